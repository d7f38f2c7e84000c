//! Plan -> per-subtask tool loop -> synthesis, streamed as [`Event`]s.

use super::memo::MemoCache;
use super::tools::{tool_error_text, ImageArgs, ImageSearchArgs, ToolBox, ToolCall, ToolOutput};
use deepsurf_core::{
    ChatMessage, CompletionService, Error, Event, EventKind, Finished, Result, ToolCallRequest,
    ToolChoice, ToolSpec,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PLANNING_PROMPT: &str = "You plan web research. Break the user's request into 2 to 5 \
independent research subtasks. Reply with one subtask per line and nothing else.";

pub const RESEARCH_PROMPT: &str = "You are a careful web researcher working on one subtask of a \
larger request. Use the tools to gather evidence. When you have enough, reply with a concise \
answer for this subtask in plain text, citing the URLs you relied on.";

pub const SYNTHESIS_PROMPT: &str = "Combine the subtask findings below into one well-structured \
answer to the original request. Keep every claim tied to the findings; do not invent sources.";

const MAX_SUBTASKS: usize = 5;
const SIMILAR_IMAGES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            image_url: None,
        }
    }

    pub fn with_image(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    fn image(&self) -> Option<&str> {
        self.image_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The user turn, with the image attached as content when there is one.
    fn user_message(&self, text: String) -> ChatMessage {
        match self.image() {
            Some(img) => ChatMessage::user_with_image(text, img),
            None => ChatMessage::user(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubTask {
    pub index: usize,
    pub description: String,
    pub messages: Vec<ChatMessage>,
    pub sources: BTreeSet<String>,
    pub images: BTreeSet<String>,
    pub status: SubTaskStatus,
    pub content: String,
}

impl SubTask {
    fn new(index: usize, description: String) -> Self {
        Self {
            index,
            description,
            messages: Vec::new(),
            sources: BTreeSet::new(),
            images: BTreeSet::new(),
            status: SubTaskStatus::Pending,
            content: String::new(),
        }
    }

    fn absorb(&mut self, out: &ToolOutput) {
        self.sources.extend(out.sources.iter().cloned());
        self.images.extend(out.images.iter().cloned());
    }
}

/// Strip list markers ("1.", "2)", "-", "*") and keep up to five non-empty lines.
pub fn parse_plan(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| {
            let l = l.trim();
            let rest = l.trim_start_matches(|c: char| c.is_ascii_digit());
            let l = if rest.len() < l.len() {
                rest.strip_prefix('.')
                    .or_else(|| rest.strip_prefix(')'))
                    .unwrap_or(l)
            } else {
                l
            };
            l.trim_start_matches(['-', '*', '•']).trim().to_string()
        })
        .filter(|l| !l.is_empty())
        .take(MAX_SUBTASKS)
        .collect()
}

/// Markdown footer listing every collected source and image once, sorted.
pub fn sources_footer(sources: &BTreeSet<String>, images: &BTreeSet<String>) -> String {
    let mut out = String::new();
    if !sources.is_empty() {
        out.push_str("\n\n---\n**Sources:**\n");
        for (i, src) in sources.iter().enumerate() {
            out.push_str(&format!("{}. [{src}]({src})\n", i + 1));
        }
    }
    if !images.is_empty() {
        out.push_str("\n**Images Found:**\n");
        for img in images {
            out.push_str(&format!("![image]({img})\n"));
        }
    }
    out
}

struct Emitter<'a> {
    tx: &'a mpsc::Sender<Event>,
    cancel: &'a CancellationToken,
}

impl Emitter<'_> {
    async fn emit(&self, ev: Event) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.tx.send(ev).await.map_err(|_| Error::Cancelled)
    }

    /// Await `fut` unless the request is cancelled first.
    async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            v = fut => Ok(v),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn span_progress(index: usize, total: usize, end: bool) -> u8 {
    let step = if end { index } else { index - 1 };
    (10 + 80 * step / total.max(1)).min(90) as u8
}

pub struct ResearchOrchestrator {
    planner: Arc<dyn CompletionService>,
    tools: Arc<ToolBox>,
    max_iterations: usize,
}

impl ResearchOrchestrator {
    pub fn new(planner: Arc<dyn CompletionService>, tools: Arc<ToolBox>) -> Self {
        Self {
            planner,
            tools,
            max_iterations: 5,
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn tools(&self) -> &Arc<ToolBox> {
        &self.tools
    }

    /// Run one request to completion. Exactly one terminal event is sent unless the receiver is
    /// gone or the token is cancelled.
    pub async fn run(
        &self,
        req: ResearchRequest,
        tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) {
        let out = Emitter {
            tx: &tx,
            cancel: &cancel,
        };
        let image_only = req.query.trim().is_empty();
        if image_only && req.image().is_none() {
            let _ = out
                .emit(Event::error(0, 0, "query must not be empty without an image"))
                .await;
            return;
        }
        let work = async {
            match req.image() {
                Some(img) if image_only => self.image_pipeline(img, &out).await,
                _ => self.pipeline(&req, &out).await,
            }
        };
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(answer)) => {
                let _ = out.emit(Event::final_answer(0, answer)).await;
            }
            Ok(Err(Error::Cancelled)) => {
                tracing::info!("research request cancelled");
                let _ = tx.try_send(Event::error(0, 0, "request cancelled"));
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "research pipeline failed");
                let _ = out
                    .emit(Event::error(0, 0, format!("[ERROR] research failed: {e}")))
                    .await;
            }
            Err(payload) => {
                let msg = panic_message(&*payload).to_string();
                drop(payload);
                tracing::error!(panic = %msg, "research pipeline panicked");
                let _ = out
                    .emit(Event::error(0, 0, format!("[ERROR] research failed: internal error: {msg}")))
                    .await;
            }
        }
    }

    /// Collect every event of one request; convenient for the CLI and tests.
    pub async fn run_to_vec(&self, req: ResearchRequest) -> Vec<Event> {
        let (tx, mut rx) = mpsc::channel(64);
        let run = self.run(req, tx, CancellationToken::new());
        let collect = async {
            let mut events = Vec::new();
            while let Some(ev) = rx.recv().await {
                events.push(ev);
            }
            events
        };
        let ((), events) = tokio::join!(run, collect);
        events
    }

    async fn pipeline(&self, req: &ResearchRequest, out: &Emitter<'_>) -> Result<String> {
        out.emit(Event::info(0, 0, "start", "Initiating research"))
            .await?;

        let plan = self.plan(req, out).await?;
        let total = plan.len();
        out.emit(Event::info(
            0,
            5,
            "plan",
            plan.iter()
                .enumerate()
                .map(|(i, d)| format!("{}. {d}", i + 1))
                .collect::<Vec<_>>()
                .join("\n"),
        ))
        .await?;

        let synthesize = total > 1;
        let specs = ToolCall::specs();
        let mut memo = MemoCache::new();
        let mut subtasks: Vec<SubTask> = plan
            .into_iter()
            .enumerate()
            .map(|(i, d)| SubTask::new(i + 1, d))
            .collect();

        for st in subtasks.iter_mut() {
            self.execute(req, st, total, &specs, &mut memo, out).await?;
            let finished = if st.index < total {
                Finished::Intermediate
            } else if synthesize {
                Finished::No
            } else {
                Finished::Yes
            };
            out.emit(Event::new(
                EventKind::TaskSummary,
                st.index,
                finished,
                span_progress(st.index, total, true),
                "summary",
                st.content.clone(),
            ))
            .await?;
        }
        tracing::debug!(memo_hits = memo.hits(), memo_entries = memo.len(), "subtasks done");

        let body = if synthesize {
            out.emit(Event::info(0, 90, "synthesis", "Synthesizing findings"))
                .await?;
            self.synthesize(req, &subtasks, out).await?
        } else {
            subtasks
                .first()
                .map(|s| s.content.clone())
                .unwrap_or_default()
        };

        let sources: BTreeSet<String> = subtasks.iter().flat_map(|s| s.sources.clone()).collect();
        let images: BTreeSet<String> = subtasks.iter().flat_map(|s| s.images.clone()).collect();
        Ok(format!("{body}{}", sources_footer(&sources, &images)))
    }

    /// Image without a question: describe it, then look for similar images.
    async fn image_pipeline(&self, image_url: &str, out: &Emitter<'_>) -> Result<String> {
        out.emit(Event::info(0, 0, "start", "Analyzing the attached image"))
            .await?;
        let mut memo = MemoCache::new();
        let mut st = SubTask::new(1, "Describe the attached image".to_string());

        let describe = ToolCall::GeneratePromptFromImage(ImageArgs {
            image_url: image_url.to_string(),
        });
        let prompt = self.run_call(&mut st, &describe, 30, &mut memo, out).await??;

        let similar = ToolCall::ImageSearch(ImageSearchArgs {
            query: prompt.clone(),
            max_images: Some(SIMILAR_IMAGES),
        });
        if let Err(e) = self.run_call(&mut st, &similar, 60, &mut memo, out).await? {
            tracing::warn!(error = %e, "similar image search failed");
        }

        let mut body = format!("**Image Analysis:**\n{prompt}");
        if !st.images.is_empty() {
            body.push_str("\n\n**Similar Images:**\n");
            for img in st.images.iter().take(SIMILAR_IMAGES) {
                body.push_str(&format!("![image]({img})\n"));
            }
        }
        Ok(format!("{body}{}", sources_footer(&st.sources, &BTreeSet::new())))
    }

    async fn plan(&self, req: &ResearchRequest, out: &Emitter<'_>) -> Result<Vec<String>> {
        let messages = [
            ChatMessage::system(PLANNING_PROMPT),
            req.user_message(req.query.trim().to_string()),
        ];
        let fallback = vec![req.query.trim().to_string()];
        let reply = out
            .guard(self.planner.complete(&messages, &[], ToolChoice::None))
            .await?;
        Ok(match reply {
            Ok(c) => {
                let plan = parse_plan(c.text().unwrap_or(""));
                if plan.is_empty() {
                    tracing::warn!("planner returned no subtasks; using the raw query");
                    fallback
                } else {
                    plan
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "planning failed; using the raw query");
                fallback
            }
        })
    }

    async fn execute(
        &self,
        req: &ResearchRequest,
        st: &mut SubTask,
        total: usize,
        specs: &[ToolSpec],
        memo: &mut MemoCache,
        out: &Emitter<'_>,
    ) -> Result<()> {
        st.status = SubTaskStatus::Running;
        let progress = span_progress(st.index, total, false);
        out.emit(Event::info(st.index, progress, "subtask", st.description.clone()))
            .await?;

        let mut user = format!(
            "Original request: {}\n\nYour subtask ({} of {total}): {}",
            req.query.trim(),
            st.index,
            st.description
        );
        if let Some(img) = req.image() {
            user.push_str(&format!("\nThe attached image is at: {img}"));
        }
        st.messages = vec![ChatMessage::system(RESEARCH_PROMPT), req.user_message(user)];

        for iteration in 1..=self.max_iterations {
            out.emit(Event::info(
                st.index,
                progress,
                "iteration",
                format!("Research iteration {iteration}"),
            ))
            .await?;

            let reply = out
                .guard(self.planner.complete(&st.messages, specs, ToolChoice::Auto))
                .await?;
            let completion = match reply {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(task = st.index, iteration, error = %e, "planner call failed");
                    st.status = SubTaskStatus::Failed;
                    st.content = format!(
                        "Subtask {} could not be completed: {e}",
                        st.index
                    );
                    return Ok(());
                }
            };

            if completion.tool_calls.is_empty() {
                st.content = completion.text().unwrap_or("").to_string();
                st.status = SubTaskStatus::Done;
                return Ok(());
            }

            st.messages
                .push(ChatMessage::assistant_tool_calls(completion.tool_calls.clone()));
            for call in &completion.tool_calls {
                let text = self.call_tool(st, call, progress, memo, out).await?;
                st.messages.push(ChatMessage::tool_output(call, text));
            }
        }

        tracing::warn!(task = st.index, max = self.max_iterations, "iteration budget exhausted");
        st.status = SubTaskStatus::Failed;
        st.content = format!(
            "Subtask {} could not be completed within {} research iterations.",
            st.index, self.max_iterations
        );
        Ok(())
    }

    async fn call_tool(
        &self,
        st: &mut SubTask,
        req: &ToolCallRequest,
        progress: u8,
        memo: &mut MemoCache,
        out: &Emitter<'_>,
    ) -> Result<String> {
        let call = match ToolCall::parse(&req.name, &req.arguments) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(task = st.index, tool = %req.name, error = %e, "rejected tool call");
                return Ok(tool_error_text(&req.name, &e));
            }
        };
        Ok(match self.run_call(st, &call, progress, memo, out).await? {
            Ok(text) => text,
            Err(e) => tool_error_text(call.name(), &e),
        })
    }

    /// Run one validated call through the memo. The outer error is cancellation only.
    async fn run_call(
        &self,
        st: &mut SubTask,
        call: &ToolCall,
        progress: u8,
        memo: &mut MemoCache,
        out: &Emitter<'_>,
    ) -> Result<Result<String>> {
        out.emit(Event::info(st.index, progress, call.stage(), call.name()))
            .await?;

        let key = call.memo_key();
        if let Some(hit) = memo.get(&key) {
            let hit = hit.clone();
            tracing::debug!(task = st.index, tool = call.name(), "memo hit");
            st.absorb(&hit);
            return Ok(Ok(hit.text));
        }

        tracing::info!(task = st.index, tool = call.name(), "tool call");
        match out.guard(self.tools.run(call, out.cancel)).await? {
            Ok(output) => {
                st.absorb(&output);
                let text = output.text.clone();
                memo.insert(key, output);
                Ok(Ok(text))
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(task = st.index, tool = call.name(), error = %e, "tool failed");
                Ok(Err(e))
            }
        }
    }

    async fn synthesize(
        &self,
        req: &ResearchRequest,
        subtasks: &[SubTask],
        out: &Emitter<'_>,
    ) -> Result<String> {
        let mut findings = format!("Original request: {}\n", req.query.trim());
        for st in subtasks {
            findings.push_str(&format!(
                "\n## Subtask {}: {}\n{}\n",
                st.index, st.description, st.content
            ));
            if !st.sources.is_empty() {
                let srcs: Vec<&str> = st.sources.iter().map(String::as_str).collect();
                findings.push_str(&format!("Sources: {}\n", srcs.join(", ")));
            }
            if !st.images.is_empty() {
                let imgs: Vec<&str> = st.images.iter().map(String::as_str).collect();
                findings.push_str(&format!("Images: {}\n", imgs.join(", ")));
            }
        }
        let messages = [
            ChatMessage::system(SYNTHESIS_PROMPT),
            ChatMessage::user(findings),
        ];
        let concatenated = || {
            subtasks
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let reply = out
            .guard(self.planner.complete(&messages, &[], ToolChoice::None))
            .await?;
        Ok(match reply {
            Ok(c) => match c.text() {
                Some(t) => t.to_string(),
                None => {
                    tracing::warn!("synthesis returned nothing; concatenating subtask answers");
                    concatenated()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed; concatenating subtask answers");
                concatenated()
            }
        })
    }
}

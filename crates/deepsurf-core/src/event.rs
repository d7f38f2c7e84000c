//! Progress events and their text-stream framing.
//!
//! Frame layout (one frame per event, blank-line terminated):
//!
//! ```text
//! event: TaskSummary
//! task: 2
//! finished: intermediate
//! progress: 66
//! stage: summary
//! data: first payload line
//! data: second payload line
//!
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Info,
    TaskSummary,
    FinalAnswer,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Info => "Info",
            EventKind::TaskSummary => "TaskSummary",
            EventKind::FinalAnswer => "FinalAnswer",
            EventKind::Error => "Error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "Info" => Some(EventKind::Info),
            "TaskSummary" => Some(EventKind::TaskSummary),
            "FinalAnswer" => Some(EventKind::FinalAnswer),
            "Error" => Some(EventKind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Finished {
    Yes,
    No,
    Intermediate,
}

impl Finished {
    pub fn as_str(&self) -> &'static str {
        match self {
            Finished::Yes => "yes",
            Finished::No => "no",
            Finished::Intermediate => "intermediate",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Finished::Yes),
            "no" => Some(Finished::No),
            "intermediate" => Some(Finished::Intermediate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub task: usize,
    pub finished: Finished,
    pub progress: u8,
    pub stage: String,
    pub payload: String,
}

impl Event {
    pub fn new(
        kind: EventKind,
        task: usize,
        finished: Finished,
        progress: u8,
        stage: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task,
            finished,
            progress: progress.min(100),
            stage: stage.into(),
            payload: payload.into(),
        }
    }

    pub fn info(task: usize, progress: u8, stage: &str, payload: impl Into<String>) -> Self {
        Self::new(EventKind::Info, task, Finished::No, progress, stage, payload)
    }

    pub fn final_answer(task: usize, payload: impl Into<String>) -> Self {
        Self::new(
            EventKind::FinalAnswer,
            task,
            Finished::Yes,
            100,
            "final",
            payload,
        )
    }

    pub fn error(task: usize, progress: u8, payload: impl Into<String>) -> Self {
        Self::new(
            EventKind::Error,
            task,
            Finished::Yes,
            progress,
            "error",
            payload,
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::FinalAnswer | EventKind::Error)
    }

    pub fn to_sse(&self) -> String {
        let mut out = String::with_capacity(self.payload.len() + 96);
        out.push_str("event: ");
        out.push_str(self.kind.as_str());
        out.push_str("\ntask: ");
        out.push_str(&self.task.to_string());
        out.push_str("\nfinished: ");
        out.push_str(self.finished.as_str());
        out.push_str("\nprogress: ");
        out.push_str(&self.progress.to_string());
        out.push_str("\nstage: ");
        // Stage must stay on one line.
        out.push_str(&self.stage.replace(['\r', '\n'], " "));
        out.push('\n');
        for line in self.payload.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Parse one frame produced by [`Event::to_sse`]. Unknown fields are ignored.
    pub fn from_sse(frame: &str) -> Option<Self> {
        let mut kind = None;
        let mut task = 0usize;
        let mut finished = Finished::No;
        let mut progress = 0u8;
        let mut stage = String::new();
        let mut data: Vec<&str> = Vec::new();
        for line in frame.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            let v = v.strip_prefix(' ').unwrap_or(v);
            match k {
                "event" => kind = EventKind::parse(v.trim()),
                "task" => task = v.trim().parse().ok()?,
                "finished" => finished = Finished::parse(v.trim())?,
                "progress" => progress = v.trim().parse().ok()?,
                "stage" => stage = v.to_string(),
                "data" => data.push(v),
                _ => {}
            }
        }
        Some(Event::new(kind?, task, finished, progress, stage, data.join("\n")))
    }
}

/// Split a byte-stream body into frames (blank-line separated).
pub fn split_frames(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .map(|f| f.trim_start_matches('\n'))
        .filter(|f| !f.trim().is_empty())
        .collect()
}

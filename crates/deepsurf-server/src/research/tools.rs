//! The closed set of tools the planner may call, with typed arguments and one dispatch table.

use deepsurf_core::{
    ChatMessage, CompletionService, Error, ImageSearchProvider, Result, TextExtractor, ToolChoice,
    ToolSpec, TranscriptService,
};
use deepsurf_local::retry::with_timeout;
use deepsurf_local::youtube::youtube_video_id;
use deepsurf_local::FallbackSearchService;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const IMAGE_PROMPT_INSTRUCTION: &str = "Describe the contents of this image as a short, clear \
image search query. Include objects, setting, mood, people, logos, colors and style, whatever \
stands out. Reply with the query only.";

pub const IMAGE_REPLY_INSTRUCTION: &str = "Answer the question about the attached image. Be \
specific about what is visible and say so when the image does not show enough to answer.";

const SEARCH_PREVIEW_CHARS: usize = 500;
const FETCH_PREVIEW_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryArgs {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSearchArgs {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_images: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlArgs {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArgs {
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageQuestionArgs {
    pub image_url: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeArgs {
    pub utc_datetime: String,
    pub offset: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    CleanQuery(QueryArgs),
    WebSearch(QueryArgs),
    ImageSearch(ImageSearchArgs),
    FetchFullText(UrlArgs),
    GetYoutubeMetadata(UrlArgs),
    GetYoutubeTranscript(UrlArgs),
    ConvertUtcToLocal(TimeArgs),
    GeneratePromptFromImage(ImageArgs),
    ReplyFromImage(ImageQuestionArgs),
}

fn parse_args<T: serde::de::DeserializeOwned>(name: &str, args_json: &str) -> Result<T> {
    let raw = if args_json.trim().is_empty() {
        "{}"
    } else {
        args_json
    };
    serde_json::from_str(raw).map_err(|e| Error::InvalidArgs(format!("{name}: {e}")))
}

fn required(name: &str, field: &str, v: &str) -> Result<String> {
    let v = v.trim();
    if v.is_empty() {
        return Err(Error::InvalidArgs(format!("{name}: `{field}` must not be empty")));
    }
    Ok(v.to_string())
}

impl ToolCall {
    pub const NAMES: [&'static str; 9] = [
        "clean_query",
        "web_search",
        "image_search",
        "fetch_full_text",
        "get_youtube_metadata",
        "get_youtube_transcript",
        "convert_utc_to_local",
        "generate_prompt_from_image",
        "reply_from_image",
    ];

    /// Validate a planner tool call and normalize its arguments.
    pub fn parse(name: &str, args_json: &str) -> Result<Self> {
        let call = match name {
            "clean_query" | "web_search" => {
                let a: QueryArgs = parse_args(name, args_json)?;
                let a = QueryArgs {
                    query: required(name, "query", &a.query)?,
                };
                if name == "clean_query" {
                    ToolCall::CleanQuery(a)
                } else {
                    ToolCall::WebSearch(a)
                }
            }
            "image_search" => {
                let a: ImageSearchArgs = parse_args(name, args_json)?;
                ToolCall::ImageSearch(ImageSearchArgs {
                    query: required(name, "query", &a.query)?,
                    max_images: a.max_images.map(|n| n.clamp(1, 30)),
                })
            }
            "fetch_full_text" | "get_youtube_metadata" | "get_youtube_transcript" => {
                let a: UrlArgs = parse_args(name, args_json)?;
                let a = UrlArgs {
                    url: required(name, "url", &a.url)?,
                };
                match name {
                    "fetch_full_text" => ToolCall::FetchFullText(a),
                    "get_youtube_metadata" => ToolCall::GetYoutubeMetadata(a),
                    _ => ToolCall::GetYoutubeTranscript(a),
                }
            }
            "convert_utc_to_local" => {
                let a: TimeArgs = parse_args(name, args_json)?;
                ToolCall::ConvertUtcToLocal(TimeArgs {
                    utc_datetime: required(name, "utc_datetime", &a.utc_datetime)?,
                    offset: required(name, "offset", &a.offset)?,
                })
            }
            "generate_prompt_from_image" => {
                let a: ImageArgs = parse_args(name, args_json)?;
                ToolCall::GeneratePromptFromImage(ImageArgs {
                    image_url: required(name, "image_url", &a.image_url)?,
                })
            }
            "reply_from_image" => {
                let a: ImageQuestionArgs = parse_args(name, args_json)?;
                ToolCall::ReplyFromImage(ImageQuestionArgs {
                    image_url: required(name, "image_url", &a.image_url)?,
                    query: required(name, "query", &a.query)?,
                })
            }
            other => return Err(Error::NotSupported(format!("unknown tool: {other}"))),
        };
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::CleanQuery(_) => "clean_query",
            ToolCall::WebSearch(_) => "web_search",
            ToolCall::ImageSearch(_) => "image_search",
            ToolCall::FetchFullText(_) => "fetch_full_text",
            ToolCall::GetYoutubeMetadata(_) => "get_youtube_metadata",
            ToolCall::GetYoutubeTranscript(_) => "get_youtube_transcript",
            ToolCall::ConvertUtcToLocal(_) => "convert_utc_to_local",
            ToolCall::GeneratePromptFromImage(_) => "generate_prompt_from_image",
            ToolCall::ReplyFromImage(_) => "reply_from_image",
        }
    }

    /// Progress label shown while the tool runs.
    pub fn stage(&self) -> &'static str {
        match self {
            ToolCall::CleanQuery(_) => "Understanding the query",
            ToolCall::WebSearch(_) => "Surfing the internet",
            ToolCall::ImageSearch(_) => "Looking for images",
            ToolCall::FetchFullText(_) => "Reading a page",
            ToolCall::GetYoutubeMetadata(_) | ToolCall::GetYoutubeTranscript(_) => {
                "Watching YouTube"
            }
            ToolCall::ConvertUtcToLocal(_) => "Checking the clock",
            ToolCall::GeneratePromptFromImage(_) | ToolCall::ReplyFromImage(_) => {
                "Looking at the image"
            }
        }
    }

    /// `name:` followed by the canonical JSON of the normalized arguments.
    pub fn memo_key(&self) -> String {
        let args = match self {
            ToolCall::CleanQuery(a) | ToolCall::WebSearch(a) => serde_json::to_string(a),
            ToolCall::ImageSearch(a) => serde_json::to_string(a),
            ToolCall::FetchFullText(a)
            | ToolCall::GetYoutubeMetadata(a)
            | ToolCall::GetYoutubeTranscript(a) => serde_json::to_string(a),
            ToolCall::ConvertUtcToLocal(a) => serde_json::to_string(a),
            ToolCall::GeneratePromptFromImage(a) => serde_json::to_string(a),
            ToolCall::ReplyFromImage(a) => serde_json::to_string(a),
        }
        .unwrap_or_default();
        format!("{}:{args}", self.name())
    }

    /// JSON-schema tool table handed to the planner.
    pub fn specs() -> Vec<ToolSpec> {
        fn spec(name: &str, description: &str, parameters: serde_json::Value) -> ToolSpec {
            ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            }
        }
        fn string_props(fields: &[(&str, &str)]) -> serde_json::Value {
            let props: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|(k, d)| {
                    (
                        k.to_string(),
                        serde_json::json!({"type": "string", "description": d}),
                    )
                })
                .collect();
            let required: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
            serde_json::json!({"type": "object", "properties": props, "required": required})
        }
        vec![
            spec(
                "clean_query",
                "Split a raw user query into website URLs, YouTube URLs and the remaining question text.",
                string_props(&[("query", "The raw user query.")]),
            ),
            spec(
                "web_search",
                "Search the web and return a short preview of each result page.",
                string_props(&[("query", "Search query.")]),
            ),
            spec(
                "image_search",
                "Search for images; returns image URLs grouped by source page.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Image search query."},
                        "max_images": {"type": "integer", "minimum": 1, "maximum": 30}
                    },
                    "required": ["query"]
                }),
            ),
            spec(
                "fetch_full_text",
                "Fetch a web page and return its main text and image count.",
                string_props(&[("url", "Absolute http(s) URL.")]),
            ),
            spec(
                "get_youtube_metadata",
                "Title, channel, duration and view count of a YouTube video.",
                string_props(&[("url", "YouTube video URL.")]),
            ),
            spec(
                "get_youtube_transcript",
                "Caption transcript of a YouTube video.",
                string_props(&[("url", "YouTube video URL.")]),
            ),
            spec(
                "convert_utc_to_local",
                "Convert a UTC timestamp to local time at a fixed UTC offset such as +05:30.",
                string_props(&[
                    ("utc_datetime", "UTC time, e.g. 2024-05-01 13:00:00."),
                    ("offset", "UTC offset, e.g. +05:30, -8 or UTC+1."),
                ]),
            ),
            spec(
                "generate_prompt_from_image",
                "Look at an image and return a short search query describing it.",
                string_props(&[("image_url", "Absolute http(s) or data: URL of the image.")]),
            ),
            spec(
                "reply_from_image",
                "Answer a question about an image by looking at it directly.",
                string_props(&[
                    ("image_url", "Absolute http(s) or data: URL of the image."),
                    ("query", "The question to answer about the image."),
                ]),
            ),
        ]
    }
}

/// What a tool hands back: text for the transcript plus anything worth citing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub sources: Vec<String>,
    pub images: Vec<String>,
}

impl ToolOutput {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: s.into(),
            ..Self::default()
        }
    }
}

pub fn tool_error_text(name: &str, err: &Error) -> String {
    format!("[ERROR] Tool {name} failed: {err}")
}

fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedQuery {
    pub websites: Vec<String>,
    pub youtube: Vec<String>,
    pub query: String,
}

pub fn clean_query(raw: &str) -> CleanedQuery {
    let mut out = CleanedQuery {
        websites: Vec::new(),
        youtube: Vec::new(),
        query: String::new(),
    };
    let mut words: Vec<&str> = Vec::new();
    for tok in raw.split_whitespace() {
        if !(tok.starts_with("http://") || tok.starts_with("https://")) {
            words.push(tok);
            continue;
        }
        let trimmed = tok.trim_end_matches(['.', ',', ';', '!', '?', '"', '\'']);
        let Ok(u) = url::Url::parse(trimmed) else {
            continue;
        };
        let bucket = if youtube_video_id(&u).is_some() {
            &mut out.youtube
        } else {
            &mut out.websites
        };
        if !bucket.iter().any(|s| s == trimmed) {
            bucket.push(trimmed.to_string());
        }
    }
    out.query = words.join(" ");
    out
}

fn parse_offset(raw: &str) -> Result<chrono::FixedOffset> {
    let bad = || Error::InvalidArgs(format!("convert_utc_to_local: bad offset `{raw}`"));
    let s = raw.trim();
    let s = s
        .strip_prefix("UTC")
        .or_else(|| s.strip_prefix("GMT"))
        .unwrap_or(s)
        .trim();
    if s.is_empty() {
        return chrono::FixedOffset::east_opt(0).ok_or_else(bad);
    }
    let (sign, rest) = match s.as_bytes()[0] {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 && rest.is_char_boundary(2) => rest.split_at(2),
        None => (rest, "0"),
    };
    let h: i32 = h.trim().parse().map_err(|_| bad())?;
    let m: i32 = m.trim().parse().map_err(|_| bad())?;
    if !(0..=14).contains(&h) || !(0..=59).contains(&m) {
        return Err(bad());
    }
    chrono::FixedOffset::east_opt(sign * (h * 3600 + m * 60)).ok_or_else(bad)
}

fn parse_utc(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let s = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&chrono::Utc));
    }
    let s = s.trim_end_matches('Z').trim_end_matches(" UTC");
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::InvalidArgs(format!(
        "convert_utc_to_local: bad datetime `{raw}`"
    )))
}

pub fn convert_utc_to_local(utc_datetime: &str, offset: &str) -> Result<String> {
    let utc = parse_utc(utc_datetime)?;
    let off = parse_offset(offset)?;
    Ok(utc
        .with_timezone(&off)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string())
}

/// Everything a tool call may touch.
pub struct ToolBox {
    search: Arc<FallbackSearchService>,
    images: Option<Arc<dyn ImageSearchProvider>>,
    extractor: Arc<dyn TextExtractor>,
    transcripts: Arc<dyn TranscriptService>,
    vision: Option<Arc<dyn CompletionService>>,
    fetch_concurrency: usize,
    timeout_ms: u64,
    default_max_images: usize,
}

impl ToolBox {
    pub fn new(
        search: Arc<FallbackSearchService>,
        extractor: Arc<dyn TextExtractor>,
        transcripts: Arc<dyn TranscriptService>,
    ) -> Self {
        Self {
            search,
            images: None,
            extractor,
            transcripts,
            vision: None,
            fetch_concurrency: 5,
            timeout_ms: 45_000,
            default_max_images: 10,
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageSearchProvider>) -> Self {
        self.images = Some(images);
        self
    }

    /// Model used by the image tools; it must accept image content parts.
    pub fn with_vision(mut self, vision: Arc<dyn CompletionService>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_fetch_concurrency(mut self, n: usize) -> Self {
        self.fetch_concurrency = n.clamp(1, 10);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn search(&self) -> &Arc<FallbackSearchService> {
        &self.search
    }

    /// Run one tool under the per-tool timeout. The token reaches the search cascade.
    pub async fn run(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<ToolOutput> {
        with_timeout(self.timeout_ms, call.name(), self.dispatch(call, cancel)).await
    }

    async fn look_at_image(&self, image_url: &str, instruction: &str) -> Result<String> {
        let vision = self
            .vision
            .as_ref()
            .ok_or_else(|| Error::NotConfigured("image understanding is not enabled".to_string()))?;
        let messages = [ChatMessage::user_with_image(instruction, image_url)];
        let c = vision.complete(&messages, &[], ToolChoice::None).await?;
        c.text()
            .map(str::to_string)
            .ok_or_else(|| Error::Llm("vision model returned no text".to_string()))
    }

    async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<ToolOutput> {
        match call {
            ToolCall::CleanQuery(a) => {
                let c = clean_query(&a.query);
                Ok(ToolOutput::text(format!(
                    "Cleaned Query: {}\nWebsites: {:?}\nYouTube URLs: {:?}",
                    c.query, c.websites, c.youtube
                )))
            }
            ToolCall::WebSearch(a) => self.web_search(&a.query, cancel).await,
            ToolCall::ImageSearch(a) => {
                let provider = self.images.as_ref().ok_or_else(|| {
                    Error::NotConfigured("image search is not enabled".to_string())
                })?;
                let max = a.max_images.unwrap_or(self.default_max_images);
                let hits = provider.search_images(&a.query, max).await?;
                let mut out = ToolOutput::default();
                for (source, imgs) in hits {
                    out.text.push_str(&format!("Source: {source}\n"));
                    for img in &imgs {
                        out.text.push_str(&format!("  {img}\n"));
                    }
                    out.sources.push(source);
                    out.images.extend(imgs);
                }
                if out.text.is_empty() {
                    out.text = format!("No images found for: {}", a.query);
                }
                Ok(out)
            }
            ToolCall::FetchFullText(a) => {
                let page = self.extractor.fetch(&a.url).await?;
                Ok(ToolOutput {
                    text: format!(
                        "URL: {}\nText Preview: {}...\nImages Found: {}",
                        a.url,
                        preview(&page.text, FETCH_PREVIEW_CHARS),
                        page.images.len()
                    ),
                    sources: vec![a.url.clone()],
                    images: page.images,
                })
            }
            ToolCall::GetYoutubeMetadata(a) => {
                let meta = self.transcripts.fetch_metadata(&a.url).await?;
                let text = serde_json::to_string(&meta)
                    .map_err(|e| Error::Fetch(format!("metadata encode: {e}")))?;
                Ok(ToolOutput {
                    text,
                    sources: vec![a.url.clone()],
                    images: Vec::new(),
                })
            }
            ToolCall::GetYoutubeTranscript(a) => {
                let transcript = self.transcripts.fetch_transcript(&a.url).await?;
                let body = if transcript.trim().is_empty() {
                    "[No transcript available]"
                } else {
                    preview(&transcript, FETCH_PREVIEW_CHARS)
                };
                Ok(ToolOutput {
                    text: format!("YouTube Transcript for {}:\n{body}...", a.url),
                    sources: vec![a.url.clone()],
                    images: Vec::new(),
                })
            }
            ToolCall::ConvertUtcToLocal(a) => Ok(ToolOutput::text(convert_utc_to_local(
                &a.utc_datetime,
                &a.offset,
            )?)),
            ToolCall::GeneratePromptFromImage(a) => Ok(ToolOutput::text(
                self.look_at_image(&a.image_url, IMAGE_PROMPT_INSTRUCTION)
                    .await?,
            )),
            ToolCall::ReplyFromImage(a) => {
                let instruction = format!("{IMAGE_REPLY_INSTRUCTION}\n\nQuestion: {}", a.query);
                Ok(ToolOutput::text(
                    self.look_at_image(&a.image_url, &instruction).await?,
                ))
            }
        }
    }

    async fn web_search(&self, query: &str, cancel: &CancellationToken) -> Result<ToolOutput> {
        let urls = self.search.search_with_trace(query, cancel).await.urls;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if urls.is_empty() {
            return Ok(ToolOutput::text(format!("No search results for: {query}")));
        }
        // Bounded fan-out; `buffered` keeps result order and is fully joined by `collect`.
        let pages: Vec<(String, Result<deepsurf_core::ExtractedPage>)> =
            futures::stream::iter(urls)
                .map(|u| async move {
                    let r = self.extractor.fetch(&u).await;
                    (u, r)
                })
                .buffered(self.fetch_concurrency)
                .collect()
                .await;

        let mut out = ToolOutput::default();
        for (url, page) in pages {
            match page {
                Ok(p) => {
                    out.text.push_str(&format!(
                        "\nURL: {url}\nSummary: {}\nImages: {:?}\n",
                        preview(&p.text, SEARCH_PREVIEW_CHARS),
                        p.images
                    ));
                    out.sources.push(url);
                    out.images.extend(p.images);
                }
                Err(e) => {
                    tracing::debug!(%url, error = %e, "result fetch failed");
                    out.text
                        .push_str(&format!("\nURL: {url}\nSummary: [could not fetch: {e}]\n"));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_and_keys_identically() {
        let a = ToolCall::parse("web_search", r#"{"query": "  rust async  "}"#).unwrap();
        let b = ToolCall::parse("web_search", r#"{"query":"rust async"}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.memo_key(), r#"web_search:{"query":"rust async"}"#);
        let c = ToolCall::parse("clean_query", r#"{"query":"rust async"}"#).unwrap();
        assert_ne!(a.memo_key(), c.memo_key());
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_calls() {
        assert!(matches!(
            ToolCall::parse("rm_rf", "{}"),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            ToolCall::parse("web_search", "{not json"),
            Err(Error::InvalidArgs(_))
        ));
        assert!(matches!(
            ToolCall::parse("fetch_full_text", r#"{"url":"   "}"#),
            Err(Error::InvalidArgs(_))
        ));
        assert!(matches!(
            ToolCall::parse("web_search", ""),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn specs_cover_every_tool_name() {
        let names: Vec<String> = ToolCall::specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ToolCall::NAMES.to_vec());
    }

    #[test]
    fn clean_query_splits_urls() {
        let c = clean_query(
            "Check https://example.com/a, and https://youtu.be/dQw4w9WgXcQ for more info.",
        );
        assert_eq!(c.websites, vec!["https://example.com/a"]);
        assert_eq!(c.youtube, vec!["https://youtu.be/dQw4w9WgXcQ"]);
        assert_eq!(c.query, "Check and for more info.");
    }

    #[test]
    fn utc_conversion_handles_offset_spellings() {
        assert_eq!(
            convert_utc_to_local("2024-05-01 13:00:00", "+05:30").unwrap(),
            "2024-05-01 18:30:00"
        );
        assert_eq!(
            convert_utc_to_local("2024-05-01T02:00:00Z", "UTC-8").unwrap(),
            "2024-04-30 18:00:00"
        );
        assert_eq!(
            convert_utc_to_local("2024-05-01 13:00", "0100").unwrap(),
            "2024-05-01 14:00:00"
        );
        assert!(convert_utc_to_local("yesterday", "+1").is_err());
        assert!(convert_utc_to_local("2024-05-01 13:00:00", "+1é2").is_err());
        assert!(convert_utc_to_local("2024-05-01 13:00:00", "+-5").is_err());
        assert!(convert_utc_to_local("2024-05-01 13:00:00", "+99").is_err());
    }

    proptest::proptest! {
        #[test]
        fn padding_never_changes_the_memo_key(
            q in "[a-z0-9]{1,12}( [a-z0-9]{1,12}){0,3}",
            left in " {0,3}",
            right in " {0,3}",
        ) {
            let padded = serde_json::json!({ "query": format!("{left}{q}{right}") }).to_string();
            let plain = serde_json::json!({ "query": q }).to_string();
            let a = ToolCall::parse("web_search", &padded).unwrap();
            let b = ToolCall::parse("web_search", &plain).unwrap();
            proptest::prop_assert_eq!(a.memo_key(), b.memo_key());
        }
    }

    proptest::proptest! {
        #[test]
        fn any_offset_text_is_accepted_or_rejected_without_panicking(offset in "\\PC{0,6}") {
            let _ = convert_utc_to_local("2024-05-01 13:00:00", &offset);
        }
    }

    #[test]
    fn image_tools_require_both_fields() {
        let c = ToolCall::parse(
            "reply_from_image",
            r#"{"image_url":" https://i.example/a.png ","query":"what breed?"}"#,
        )
        .unwrap();
        assert_eq!(
            c,
            ToolCall::ReplyFromImage(ImageQuestionArgs {
                image_url: "https://i.example/a.png".into(),
                query: "what breed?".into(),
            })
        );
        assert_eq!(c.stage(), "Looking at the image");
        assert!(matches!(
            ToolCall::parse("reply_from_image", r#"{"image_url":"https://i.example/a.png"}"#),
            Err(Error::InvalidArgs(_))
        ));
        assert!(ToolCall::parse("generate_prompt_from_image", r#"{"image_url":"x"}"#).is_ok());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("hi", 10), "hi");
    }
}

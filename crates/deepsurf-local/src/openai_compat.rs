//! OpenAI-compatible chat-completions client with tool calling.

use crate::retry::retry;
use deepsurf_core::{
    ChatMessage, Completion, CompletionService, Error, Result, RetryPolicy, Role, ToolCallRequest,
    ToolChoice, ToolSpec,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_ms: u64,
    policy: RetryPolicy,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Result<Self> {
        let base_url = base_url.ok_or_else(|| {
            Error::NotConfigured("missing DEEPSURF_OPENAI_COMPAT_BASE_URL".to_string())
        })?;
        let model = model.ok_or_else(|| {
            Error::NotConfigured("missing DEEPSURF_OPENAI_COMPAT_MODEL".to_string())
        })?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
            timeout_ms: 60_000,
            policy: RetryPolicy::default(),
        })
    }

    pub fn from_config(client: reqwest::Client, cfg: &crate::config::Config) -> Result<Self> {
        Ok(Self::new(
            client,
            cfg.llm_base_url.clone(),
            cfg.llm_api_key.clone(),
            cfg.llm_model.clone(),
        )?
        .with_timeout_ms(cfg.llm_timeout_ms)
        .with_policy(cfg.llm_policy()))
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn complete_once(&self, req: &ChatCompletionsRequest<'_>) -> Result<Completion> {
        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }
        let resp = rb.json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("chat.completions: {e}"))
            } else {
                Error::Llm(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "openai_compat chat.completions HTTP {status}"
            )));
        }
        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        let msg = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| Error::Llm("response has no choices".to_string()))?;
        Ok(Completion {
            content: msg.content,
            tool_calls: msg
                .tool_calls
                .into_iter()
                .map(|c| ToolCallRequest {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl CompletionService for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tool_choice: ToolChoice,
    ) -> Result<Completion> {
        let req = ChatCompletionsRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.iter().map(WireTool::from).collect(),
            tool_choice: (!tools.is_empty()).then(|| tool_choice.as_str()),
            stream: false,
        };
        retry(&self.policy, &CancellationToken::new(), "chat.completions", |_| {
            self.complete_once(&req)
        })
        .await
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Option<WireContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct WireImageUrl<'a> {
    url: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        let content = match (m.content.as_deref(), m.image_url.as_deref()) {
            (text, Some(url)) => Some(WireContent::Parts(vec![
                WirePart::Text {
                    text: text.unwrap_or(""),
                },
                WirePart::ImageUrl {
                    image_url: WireImageUrl { url },
                },
            ])),
            (Some(text), None) => Some(WireContent::Text(text)),
            (None, None) => None,
        };
        Self {
            role: m.role,
            content,
            tool_calls: m
                .tool_calls
                .iter()
                .map(|c| WireToolCall {
                    id: &c.id,
                    kind: "function",
                    function: WireFunctionCall {
                        name: &c.name,
                        arguments: &c.arguments,
                    },
                })
                .collect(),
            tool_call_id: m.tool_call_id.as_deref(),
            name: m.name.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

impl<'a> From<&'a ToolSpec> for WireTool<'a> {
    fn from(t: &'a ToolSpec) -> Self {
        Self {
            kind: "function",
            function: WireFunction {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChoiceToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChoiceToolCall {
    #[serde(default)]
    id: String,
    function: ChoiceFunction,
}

#[derive(Debug, Deserialize)]
struct ChoiceFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: String) -> OpenAiCompatClient {
        OpenAiCompatClient::new(
            reqwest::Client::new(),
            Some(base),
            Some("k".into()),
            Some("m".into()),
        )
        .unwrap()
        .with_policy(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        })
    }

    #[test]
    fn missing_base_url_is_not_configured() {
        let err = OpenAiCompatClient::new(reqwest::Client::new(), None, None, Some("m".into()))
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn tool_calls_round_trip_through_the_wire_format() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "m");
                assert_eq!(body["tool_choice"], "auto");
                assert_eq!(body["tools"][0]["function"]["name"], "web_search");
                assert_eq!(body["messages"][1]["tool_calls"][0]["type"], "function");
                assert_eq!(body["messages"][2]["tool_call_id"], "c0");
                Json(serde_json::json!({
                    "choices": [{"message": {"content": null, "tool_calls": [
                        {"id": "c1", "type": "function",
                         "function": {"name": "web_search", "arguments": "{\"query\":\"x\"}"}}
                    ]}}]
                }))
            }),
        );
        let c = client(serve(app).await);
        let prior = ToolCallRequest {
            id: "c0".into(),
            name: "clean_query".into(),
            arguments: "{}".into(),
        };
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_tool_calls(vec![prior.clone()]),
            ChatMessage::tool_output(&prior, "ok"),
        ];
        let tools = vec![ToolSpec {
            name: "web_search".into(),
            description: "search".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let out = c.complete(&messages, &tools, ToolChoice::Auto).await.unwrap();
        assert!(out.text().is_none());
        assert_eq!(out.tool_calls[0].name, "web_search");
        assert_eq!(out.tool_calls[0].arguments, "{\"query\":\"x\"}");
    }

    #[tokio::test]
    async fn attached_images_go_out_as_content_parts() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["messages"][0]["content"], "plain");
                let parts = &body["messages"][1]["content"];
                assert_eq!(parts[0]["type"], "text");
                assert_eq!(parts[0]["text"], "what is this?");
                assert_eq!(parts[1]["type"], "image_url");
                assert_eq!(parts[1]["image_url"]["url"], "https://img.example/cat.jpg");
                assert!(body.get("tools").is_none());
                Json(serde_json::json!({
                    "choices": [{"message": {"content": "a cat on a sofa"}}]
                }))
            }),
        );
        let c = client(serve(app).await);
        let messages = vec![
            ChatMessage::system("plain"),
            ChatMessage::user_with_image("what is this?", "https://img.example/cat.jpg"),
        ];
        let out = c.complete(&messages, &[], ToolChoice::None).await.unwrap();
        assert_eq!(out.text(), Some("a cat on a sofa"));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let h = h.clone();
                async move {
                    if h.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StatusCode::BAD_GATEWAY)
                    } else {
                        Ok(Json(serde_json::json!({
                            "choices": [{"message": {"content": "plan"}}]
                        })))
                    }
                }
            }),
        );
        let c = client(serve(app).await);
        let out = c
            .complete(&[ChatMessage::user("x")], &[], ToolChoice::None)
            .await
            .unwrap();
        assert_eq!(out.text(), Some("plan"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

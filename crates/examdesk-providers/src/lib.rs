use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use examdesk_types::{ToolOutput, ToolSchema};

mod wire;

pub use wire::{
    FunctionCall, MessageContent, MessageRole, RequiredAction, RequiredToolCall, Run, RunError,
    RunStatus, SubmitToolOutputsAction, TextContent, Thread, ThreadMessage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Upper bound for any single assistant API request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Parameters of one assistant run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub assistant_id: String,
    /// Function tools the run may call. Empty means a plain run.
    pub tools: Vec<ToolSchema>,
}

/// Conversation/run operations of the hosted assistant platform.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn create_thread(&self) -> anyhow::Result<Thread>;
    async fn add_user_message(&self, thread_id: &str, content: &str) -> anyhow::Result<()>;
    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> anyhow::Result<Run>;
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<Run>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run>;
    /// Messages of the thread, newest first.
    async fn list_messages(&self, thread_id: &str) -> anyhow::Result<Vec<ThreadMessage>>;
}

pub struct OpenAiAssistantClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiAssistantClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build assistant http client")?;
        Ok(Self {
            base_url: normalize_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> anyhow::Result<T> {
        let response = req.send().await?;
        let status = response.status();
        tracing::debug!(request = what, %status, "assistant api response");
        let text = response.text().await?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = extract_openai_error(&value).unwrap_or_else(|| {
                format!(
                    "{what} failed with status {status}: {}",
                    truncate_for_error(&text, 500)
                )
            });
            anyhow::bail!(detail);
        }

        serde_json::from_value(value).map_err(|err| {
            anyhow::anyhow!(
                "{what} returned an unexpected body ({err}): {}",
                truncate_for_error(&text, 500)
            )
        })
    }
}

#[async_trait]
impl AssistantClient for OpenAiAssistantClient {
    async fn create_thread(&self) -> anyhow::Result<Thread> {
        self.send(self.post("/threads").json(&json!({})), "thread create")
            .await
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> anyhow::Result<()> {
        let _: Value = self
            .send(
                self.post(&format!("/threads/{thread_id}/messages"))
                    .json(&json!({"role": "user", "content": content})),
                "message create",
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> anyhow::Result<Run> {
        let mut body = json!({ "assistant_id": request.assistant_id });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(tool_definitions(&request.tools));
        }
        self.send(
            self.post(&format!("/threads/{thread_id}/runs")).json(&body),
            "run create",
        )
        .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run> {
        self.send(
            self.get(&format!("/threads/{thread_id}/runs/{run_id}")),
            "run retrieve",
        )
        .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<Run> {
        self.send(
            self.post(&format!(
                "/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"
            ))
            .json(&json!({ "tool_outputs": outputs })),
            "tool output submission",
        )
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run> {
        self.send(
            self.post(&format!("/threads/{thread_id}/runs/{run_id}/cancel")),
            "run cancel",
        )
        .await
    }

    async fn list_messages(&self, thread_id: &str) -> anyhow::Result<Vec<ThreadMessage>> {
        let list: wire::MessageList = self
            .send(
                self.get(&format!("/threads/{thread_id}/messages"))
                    .query(&[("order", "desc"), ("limit", "20")]),
                "message list",
            )
            .await?;
        Ok(list.data)
    }
}

/// Renders tool schemas as platform function-tool declarations.
pub fn tool_definitions(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

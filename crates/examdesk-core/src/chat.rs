use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::Level;

use examdesk_content::DirectusClient;
use examdesk_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use examdesk_providers::{
    AssistantClient, MessageContent, MessageRole, OpenAiAssistantClient, Run, RunRequest,
    RunStatus,
};
use examdesk_tools::{Tool, ToolRegistry};
use examdesk_types::{ToolCall, ToolOutput};

use crate::config::AppConfig;
use crate::error::ChatError;

const COMPONENT: &str = "core.chat";

#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub assistant_id: String,
    pub query_assistant_id: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub tools_enabled: bool,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            assistant_id: config.assistant.assistant_id.clone(),
            query_assistant_id: config.assistant.query_assistant_id.clone(),
            poll_interval: config.run.poll_interval(),
            poll_timeout: config.run.poll_timeout(),
            tools_enabled: config.run.tools_enabled,
        }
    }
}

/// Answers one prompt per call by driving an assistant run to completion.
///
/// Holds only immutable handles, so one instance serves every request.
#[derive(Clone)]
pub struct ChatService {
    assistant: Arc<dyn AssistantClient>,
    tools: ToolRegistry,
    settings: RunSettings,
    process: ProcessKind,
}

/// Ids carried through one request for event correlation.
struct RequestScope<'a> {
    correlation_id: &'a str,
    thread_id: &'a str,
}

impl ChatService {
    pub fn new(
        assistant: Arc<dyn AssistantClient>,
        tools: ToolRegistry,
        settings: RunSettings,
    ) -> Self {
        Self {
            assistant,
            tools,
            settings,
            process: ProcessKind::Engine,
        }
    }

    /// Wires the hosted assistant and content API clients named in `config`.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let assistant = OpenAiAssistantClient::new(
            config.assistant.api_key.clone(),
            Some(&config.assistant.base_url),
        )?;
        Ok(Self::new(
            Arc::new(assistant),
            tool_registry(config)?,
            RunSettings::from_config(config),
        ))
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub async fn respond(&self, prompt: &str, correlation_id: &str) -> Result<String, ChatError> {
        let redacted = redact_text(prompt);
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "chat.request.received",
                component: COMPONENT,
                correlation_id: Some(correlation_id),
                detail: Some(&redacted),
                ..Default::default()
            },
        );

        let thread = self
            .assistant
            .create_thread()
            .await
            .map_err(ChatError::assistant)?;
        let scope = RequestScope {
            correlation_id,
            thread_id: &thread.id,
        };
        self.assistant
            .add_user_message(&thread.id, prompt)
            .await
            .map_err(ChatError::assistant)?;

        let run = self
            .assistant
            .create_run(&thread.id, &self.run_request())
            .await
            .map_err(ChatError::assistant)?;
        self.emit(&scope, "chat.run.created", &run.id, run.status.as_str());

        let run_id = run.id.clone();
        let outcome = self.drive(&scope, run).await;
        match &outcome {
            Ok(_) => self.emit(&scope, "chat.run.completed", &run_id, "completed"),
            Err(err) => {
                let detail = err.to_string();
                emit_event(
                    Level::ERROR,
                    self.process,
                    ObservabilityEvent {
                        event: "chat.run.failed",
                        component: COMPONENT,
                        correlation_id: Some(correlation_id),
                        thread_id: Some(&thread.id),
                        run_id: Some(&run_id),
                        status: Some("failed"),
                        error_code: Some(err.code()),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                if matches!(err, ChatError::RunTimedOut { .. }) {
                    self.cancel_quietly(&thread.id, &run_id).await;
                }
            }
        }
        outcome
    }

    fn run_request(&self) -> RunRequest {
        let tools = if self.settings.tools_enabled {
            self.tools.list()
        } else {
            Vec::new()
        };
        let assistant_id = match (&self.settings.query_assistant_id, tools.is_empty()) {
            (Some(query_assistant), false) => query_assistant.clone(),
            _ => self.settings.assistant_id.clone(),
        };
        RunRequest {
            assistant_id,
            tools,
        }
    }

    /// Polls until the run reaches a terminal status, answering tool calls
    /// along the way. The whole exchange, upstream calls included, is bounded
    /// by `poll_timeout`.
    async fn drive(&self, scope: &RequestScope<'_>, run: Run) -> Result<String, ChatError> {
        let started = Instant::now();
        let bounded = tokio::time::timeout(self.settings.poll_timeout, self.poll(scope, run, started));
        match bounded.await {
            Ok(outcome) => outcome,
            Err(_) => Err(timed_out(started)),
        }
    }

    async fn poll(
        &self,
        scope: &RequestScope<'_>,
        mut run: Run,
        started: Instant,
    ) -> Result<String, ChatError> {
        loop {
            match run.status {
                RunStatus::Completed => return self.final_text(scope.thread_id).await,
                RunStatus::RequiresAction => {}
                status if status.is_pending() => {}
                status => {
                    return Err(ChatError::RunFailed {
                        status: status.as_str().to_string(),
                        detail: run.last_error_message(),
                    })
                }
            }
            if started.elapsed() >= self.settings.poll_timeout {
                return Err(timed_out(started));
            }

            run = if run.status == RunStatus::RequiresAction {
                let outputs = self.run_tools(scope, &run).await?;
                self.assistant
                    .submit_tool_outputs(scope.thread_id, &run.id, &outputs)
                    .await
                    .map_err(ChatError::assistant)?
            } else {
                tokio::time::sleep(self.settings.poll_interval).await;
                let next = self
                    .assistant
                    .retrieve_run(scope.thread_id, &run.id)
                    .await
                    .map_err(ChatError::assistant)?;
                tracing::debug!(run_id = %next.id, status = %next.status, "polled run");
                next
            };
        }
    }

    async fn run_tools(
        &self,
        scope: &RequestScope<'_>,
        run: &Run,
    ) -> Result<Vec<ToolOutput>, ChatError> {
        let calls = run.tool_calls();
        if calls.is_empty() {
            return Err(ChatError::RunFailed {
                status: run.status.as_str().to_string(),
                detail: Some("no tool calls to answer".to_string()),
            });
        }
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = self.run_tool(scope, &run.id, &call).await?;
            outputs.push(ToolOutput {
                tool_call_id: call.id,
                output,
            });
        }
        Ok(outputs)
    }

    async fn run_tool(
        &self,
        scope: &RequestScope<'_>,
        run_id: &str,
        call: &ToolCall,
    ) -> Result<String, ChatError> {
        let tool = self
            .tools
            .get(&call.name)
            .filter(|_| self.settings.tools_enabled)
            .ok_or_else(|| ChatError::UnknownTool(call.name.clone()))?;
        let args = parse_arguments(call)?;
        let collection = args.get("collection").and_then(Value::as_str);

        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "chat.tool.dispatched",
                component: COMPONENT,
                correlation_id: Some(scope.correlation_id),
                thread_id: Some(scope.thread_id),
                run_id: Some(run_id),
                tool_call_id: Some(&call.id),
                collection,
                ..Default::default()
            },
        );

        let result = tool
            .execute(args)
            .await
            .map_err(|err| ChatError::from_tool(&call.name, err))?;
        Ok(result.output)
    }

    async fn final_text(&self, thread_id: &str) -> Result<String, ChatError> {
        let messages = self
            .assistant
            .list_messages(thread_id)
            .await
            .map_err(ChatError::assistant)?;
        let reply = messages
            .into_iter()
            .find(|m| m.role == MessageRole::Assistant)
            .ok_or(ChatError::MissingAssistantMessage)?;
        match reply.content.into_iter().next() {
            Some(MessageContent::Text { text }) => Ok(text.value),
            Some(other) => Err(ChatError::NonTextContent { kind: other.kind() }),
            None => Err(ChatError::NonTextContent { kind: "empty" }),
        }
    }

    async fn cancel_quietly(&self, thread_id: &str, run_id: &str) {
        if let Err(err) = self.assistant.cancel_run(thread_id, run_id).await {
            tracing::warn!(run_id, "failed to cancel timed-out run: {err:#}");
        }
    }

    fn emit(&self, scope: &RequestScope<'_>, event: &'static str, run_id: &str, status: &str) {
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event,
                component: COMPONENT,
                correlation_id: Some(scope.correlation_id),
                thread_id: Some(scope.thread_id),
                run_id: Some(run_id),
                status: Some(status),
                ..Default::default()
            },
        );
    }
}

/// The `query_database` tool backed by the content API named in `config`.
///
/// Fails when a declared tool schema would be refused at run creation.
pub fn tool_registry(config: &AppConfig) -> anyhow::Result<ToolRegistry> {
    let store = DirectusClient::new(&config.content.url, config.content.token.clone())?;
    Ok(ToolRegistry::with_content_store(Arc::new(store)).validated()?)
}

fn timed_out(started: Instant) -> ChatError {
    ChatError::RunTimedOut {
        waited_ms: started.elapsed().as_millis() as u64,
    }
}

fn parse_arguments(call: &ToolCall) -> Result<Value, ChatError> {
    if call.arguments.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&call.arguments).map_err(|err| ChatError::InvalidToolArguments {
        tool: call.name.clone(),
        message: err.to_string(),
    })
}

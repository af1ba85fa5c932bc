use std::path::PathBuf;

use thiserror::Error;

use examdesk_tools::QueryError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required config `{key}` (set {env})")]
    Missing {
        key: &'static str,
        env: &'static str,
    },

    #[error("invalid config `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Why one chat request could not produce an answer.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{service} request failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    #[error("run ended with status `{status}`{}", detail_suffix(.detail))]
    RunFailed {
        status: String,
        detail: Option<String>,
    },

    #[error("run did not finish within {waited_ms} ms")]
    RunTimedOut { waited_ms: u64 },

    #[error("completed run left no assistant message")]
    MissingAssistantMessage,

    #[error("assistant reply starts with {kind} content, not text")]
    NonTextContent { kind: &'static str },

    #[error("assistant called unknown tool `{0}`")]
    UnknownTool(String),

    #[error("arguments for tool `{tool}` are not valid JSON: {message}")]
    InvalidToolArguments { tool: String, message: String },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Upstream { .. } => "UPSTREAM_FAILED",
            ChatError::RunFailed { .. } => "RUN_FAILED",
            ChatError::RunTimedOut { .. } => "RUN_TIMED_OUT",
            ChatError::MissingAssistantMessage => "MISSING_ASSISTANT_MESSAGE",
            ChatError::NonTextContent { .. } => "NON_TEXT_CONTENT",
            ChatError::UnknownTool(_) => "UNKNOWN_TOOL",
            ChatError::InvalidToolArguments { .. } => "INVALID_TOOL_ARGUMENTS",
            ChatError::Query(err) => err.code(),
            ChatError::Tool { .. } => "TOOL_FAILED",
        }
    }

    pub(crate) fn assistant(err: anyhow::Error) -> Self {
        ChatError::Upstream {
            service: "assistant",
            message: format!("{err:#}"),
        }
    }

    /// Keeps typed query failures distinct from other tool errors.
    pub(crate) fn from_tool(tool: &str, err: anyhow::Error) -> Self {
        match err.downcast::<QueryError>() {
            Ok(query) => ChatError::Query(query),
            Err(other) => ChatError::Tool {
                tool: tool.to_string(),
                message: format!("{other:#}"),
            },
        }
    }
}

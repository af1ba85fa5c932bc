use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::fs;

use examdesk_providers::{is_placeholder_api_key, DEFAULT_BASE_URL};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "examdesk.json";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantConfig {
    pub api_key: String,
    pub base_url: String,
    pub assistant_id: String,
    /// Assistant used for tool-bound runs; falls back to `assistant_id`.
    pub query_assistant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub tools_enabled: bool,
}

impl RunConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Validated startup configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub assistant: AssistantConfig,
    pub content: ContentConfig,
    pub run: RunConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    assistant: RawAssistant,
    #[serde(default)]
    content: RawContent,
    #[serde(default)]
    run: RawRun,
}

#[derive(Debug, Default, Deserialize)]
struct RawAssistant {
    api_key: Option<String>,
    base_url: Option<String>,
    assistant_id: Option<String>,
    query_assistant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRun {
    poll_interval_ms: Option<Value>,
    poll_timeout_ms: Option<Value>,
    tools_enabled: Option<Value>,
}

/// Loads the config file (if any), then layers the environment and CLI
/// overrides over it.
///
/// An explicitly named file must exist; the default `examdesk.json` in the
/// working directory is optional.
pub async fn load_config(
    path: Option<&Path>,
    cli_overrides: Option<Value>,
) -> Result<AppConfig, ConfigError> {
    let file = match path {
        Some(path) => read_json_file(path).await?,
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                read_json_file(&default_path).await?
            } else {
                empty_object()
            }
        }
    };
    resolve_config(&[file, env_layer(), cli_overrides.unwrap_or_else(empty_object)])
}

/// Merges `layers` in order (later wins) and validates the result.
pub fn resolve_config(layers: &[Value]) -> Result<AppConfig, ConfigError> {
    let mut merged = empty_object();
    for layer in layers {
        deep_merge(&mut merged, layer);
    }
    let raw: RawConfig =
        serde_json::from_value(merged).map_err(|err| ConfigError::Invalid {
            key: "config",
            reason: err.to_string(),
        })?;

    let assistant = AssistantConfig {
        api_key: required(raw.assistant.api_key, "assistant.api_key", "OPENAI_API_KEY")?,
        base_url: optional(raw.assistant.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        assistant_id: required(
            raw.assistant.assistant_id,
            "assistant.assistant_id",
            "OPENAI_ASSISTANT_ID",
        )?,
        query_assistant_id: optional(raw.assistant.query_assistant_id),
    };
    let content = ContentConfig {
        url: required(raw.content.url, "content.url", "DIRECTUS_URL")?,
        token: required(raw.content.token, "content.token", "DIRECTUS_TOKEN")?,
    };

    let poll_interval_ms = millis(raw.run.poll_interval_ms, "run.poll_interval_ms")?
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    let poll_timeout_ms = millis(raw.run.poll_timeout_ms, "run.poll_timeout_ms")?
        .unwrap_or(DEFAULT_POLL_TIMEOUT_MS);
    if poll_interval_ms == 0 {
        return Err(ConfigError::Invalid {
            key: "run.poll_interval_ms",
            reason: "must be greater than zero".to_string(),
        });
    }
    if poll_timeout_ms < poll_interval_ms {
        return Err(ConfigError::Invalid {
            key: "run.poll_timeout_ms",
            reason: format!("must be at least run.poll_interval_ms ({poll_interval_ms})"),
        });
    }
    let tools_enabled = match raw.run.tools_enabled {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => parse_bool_like(&s).ok_or_else(|| ConfigError::Invalid {
            key: "run.tools_enabled",
            reason: format!("expected a boolean, got `{s}`"),
        })?,
        Some(other) => {
            return Err(ConfigError::Invalid {
                key: "run.tools_enabled",
                reason: format!("expected a boolean, got {other}"),
            })
        }
    };

    Ok(AppConfig {
        assistant,
        content,
        run: RunConfig {
            poll_interval_ms,
            poll_timeout_ms,
            tools_enabled,
        },
    })
}

pub fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    const MAPPING: [(&str, &str, &str); 9] = [
        ("OPENAI_API_KEY", "assistant", "api_key"),
        ("OPENAI_BASE_URL", "assistant", "base_url"),
        ("OPENAI_ASSISTANT_ID", "assistant", "assistant_id"),
        ("OPENAI_QUERY_ASSISTANT_ID", "assistant", "query_assistant_id"),
        ("DIRECTUS_URL", "content", "url"),
        ("DIRECTUS_TOKEN", "content", "token"),
        ("EXAMDESK_POLL_INTERVAL_MS", "run", "poll_interval_ms"),
        ("EXAMDESK_POLL_TIMEOUT_MS", "run", "poll_timeout_ms"),
        ("EXAMDESK_TOOLS_ENABLED", "run", "tools_enabled"),
    ];

    let mut root = empty_object();
    for (var, section, key) in MAPPING {
        let Some(value) = lookup(var) else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        deep_merge(&mut root, &json!({ section: { key: value.trim() } }));
    }
    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

async fn read_json_file(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !is_placeholder_api_key(v))
}

fn required(
    value: Option<String>,
    key: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    optional(value).ok_or(ConfigError::Missing { key, env })
}

fn millis(value: Option<Value>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    let invalid = |shown: String| ConfigError::Invalid {
        key,
        reason: format!("expected milliseconds as a non-negative integer, got {shown}"),
    };
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid(format!("`{s}`"))),
        Some(other) => Err(invalid(other.to_string())),
    }
}

fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

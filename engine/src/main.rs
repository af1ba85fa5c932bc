use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use examdesk_core::{load_config, tool_registry, AppConfig, ChatService};
use examdesk_observability::{
    default_logs_dir, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use examdesk_server::{serve, AppState};
use examdesk_tools::QUERY_DATABASE;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "examdesk-engine")]
#[command(about = "Admissions chat backend over a hosted assistant and a content API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat endpoint over HTTP.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "EXAMDESK_LOGS_DIR")]
        logs_dir: Option<PathBuf>,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Answer one prompt and print the reply.
    Run {
        prompt: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Execute the database tool directly.
    Tool {
        /// Tool arguments as inline JSON, `@path` or `-` for stdin.
        #[arg(long)]
        json: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunOverrides {
    #[arg(long)]
    assistant_id: Option<String>,
    #[arg(long)]
    poll_timeout_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    no_tools: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            config,
            logs_dir,
            overrides,
        } => {
            let logs_dir = logs_dir.unwrap_or_else(default_logs_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            info!("engine logging initialized: {:?}", log_info);

            let app_config = startup_config(config.as_deref(), build_cli_overrides(&overrides))
                .await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let startup_id = Uuid::new_v4().to_string();
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "engine.startup.ready",
                    component: "engine.main",
                    correlation_id: Some(&startup_id),
                    status: Some("ok"),
                    detail: Some(&format!(
                        "addr={addr} tools_enabled={} poll_timeout_ms={}",
                        app_config.run.tools_enabled, app_config.run.poll_timeout_ms
                    )),
                    ..Default::default()
                },
            );
            serve(addr, AppState::from_config(&app_config)?).await?;
        }
        Command::Run {
            prompt,
            config,
            overrides,
        } => {
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Cli, &default_logs_dir(), LOG_RETENTION_DAYS)?;
            let app_config =
                startup_config(config.as_deref(), build_cli_overrides(&overrides)).await?;
            let chat = ChatService::from_config(&app_config)?.with_process(ProcessKind::Cli);
            let reply = chat.respond(&prompt, &Uuid::new_v4().to_string()).await?;
            println!("{reply}");
        }
        Command::Tool { json, config } => {
            let app_config = startup_config(config.as_deref(), None).await?;
            let (tool, args) = split_tool_payload(read_tool_json(&json)?)?;
            let result = tool_registry(&app_config)?.execute(&tool, args).await?;
            let output = json!({
                "output": result.output,
                "metadata": result.metadata
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn startup_config(path: Option<&Path>, overrides: Option<Value>) -> anyhow::Result<AppConfig> {
    let config = load_config(path, overrides).await;
    if let Err(err) = &config {
        emit_event(
            tracing::Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "engine.startup.failed",
                component: "engine.main",
                status: Some("failed"),
                error_code: Some("CONFIG_INVALID"),
                detail: Some(&err.to_string()),
                ..Default::default()
            },
        );
    }
    Ok(config?)
}

fn build_cli_overrides(overrides: &RunOverrides) -> Option<Value> {
    let mut root = Map::new();
    if let Some(id) = overrides
        .assistant_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        root.insert("assistant".to_string(), json!({ "assistant_id": id }));
    }
    let mut run = Map::new();
    if let Some(ms) = overrides.poll_timeout_ms {
        run.insert("poll_timeout_ms".to_string(), json!(ms));
    }
    if overrides.no_tools {
        run.insert("tools_enabled".to_string(), json!(false));
    }
    if !run.is_empty() {
        root.insert("run".to_string(), Value::Object(run));
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

/// Accepts either `{"tool": ..., "args": {...}}` or bare `query_database`
/// arguments.
fn split_tool_payload(payload: Value) -> anyhow::Result<(String, Value)> {
    let Some(tool) = payload.get("tool") else {
        return Ok((QUERY_DATABASE.to_string(), payload));
    };
    let tool = tool
        .as_str()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .context("tool must be a non-empty string")?
        .to_string();
    let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
    Ok((tool, args))
}

fn read_tool_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

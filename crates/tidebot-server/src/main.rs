//! Tidebot daemon.
//!
//! Wires the engine to its durable store, arms the background tasks, and
//! exposes the caller surface over a newline-delimited JSON admin socket.
//! Chat delivery and message formatting are glue owned by the frontend;
//! this binary ships a webhook notifier and a one-line renderer so the
//! daemon runs end to end on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use tidebot_core::{Engine, EngineConfig, Notifier, Renderer, VersionKind};
use tidebot_store::StateStore;

#[derive(Debug, Parser)]
#[command(name = "tidebot", about = "game history monitor daemon")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "tidebot.toml")]
    config: PathBuf,

    /// Directory holding the SQLite state and the admin socket.
    #[arg(long, default_value = ".tidebot")]
    state_dir: PathBuf,

    /// Chat frontend webhook that receives outgoing messages.
    #[arg(long)]
    webhook_url: Option<String>,
}

/// Fire-and-forget chat delivery over an HTTP webhook. Failures are
/// logged, never retried.
struct WebhookNotifier {
    http: reqwest::Client,
    url: Option<String>,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let Some(url) = &self.url else {
            info!(chat_id, text, "no webhook configured; dropping message");
            return Ok(());
        };
        self.http
            .post(url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Placeholder formatting until the real frontend renders these.
struct SummaryRenderer;

impl Renderer for SummaryRenderer {
    fn battle_summary(&self, detail_json: &str) -> String {
        let detail: serde_json::Value = serde_json::from_str(detail_json).unwrap_or_default();
        let judgement = detail
            .pointer("/data/vsHistoryDetail/judgement")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let mode = detail
            .pointer("/data/vsHistoryDetail/vsMode/mode")
            .and_then(|v| v.as_str())
            .unwrap_or("REGULAR");
        format!("New battle result: {judgement} ({mode})")
    }

    fn coop_summary(&self, detail_json: &str) -> String {
        let detail: serde_json::Value = serde_json::from_str(detail_json).unwrap_or_default();
        let wave = detail
            .pointer("/data/coopHistoryDetail/resultWave")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        format!("New co-op shift finished (wave {wave})")
    }

    fn auto_stop_notice(&self, idle_minutes: u64) -> String {
        format!("No new results for {idle_minutes} minutes; monitoring stopped.")
    }
}

#[derive(Debug, Deserialize)]
struct AdminRequest {
    id: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AdminResponse {
    id: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl AdminResponse {
    fn ok(id: Option<String>, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Clone)]
struct AdminHandler {
    engine: Engine,
}

impl AdminHandler {
    fn param_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
        params.get(key).and_then(|v| v.as_i64())
    }

    async fn handle(&self, request: AdminRequest) -> AdminResponse {
        let id = request.id.clone();
        match request.method.as_deref() {
            Some("ping") => AdminResponse::ok(id, serde_json::json!({ "pong": true })),
            Some("status") => AdminResponse::ok(
                id,
                serde_json::json!({
                    "running": true,
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            ),
            Some("get_versions") => AdminResponse::ok(
                id,
                serde_json::json!({
                    "app": self.engine.get_version(VersionKind::App),
                    "companion": self.engine.get_version(VersionKind::Companion),
                    "webview": self.engine.get_version(VersionKind::Webview),
                    "query_ids": self.engine.get_version(VersionKind::QueryIds),
                }),
            ),
            Some("enable_monitoring") => {
                let (Some(user_id), Some(chat_id)) = (
                    Self::param_i64(&request.params, "user_id"),
                    Self::param_i64(&request.params, "chat_id"),
                ) else {
                    return AdminResponse::err(id, "user_id and chat_id are required");
                };
                match self.engine.enable_monitoring(user_id, chat_id).await {
                    Ok(toggle) => AdminResponse::ok(
                        id,
                        serde_json::json!({ "state": format!("{toggle:?}").to_lowercase() }),
                    ),
                    Err(err) => AdminResponse::err(id, err.to_string()),
                }
            }
            Some("disable_monitoring") => {
                let Some(user_id) = Self::param_i64(&request.params, "user_id") else {
                    return AdminResponse::err(id, "user_id is required");
                };
                match self.engine.disable_monitoring(user_id).await {
                    Ok(existed) => {
                        AdminResponse::ok(id, serde_json::json!({ "removed": existed }))
                    }
                    Err(err) => AdminResponse::err(id, err.to_string()),
                }
            }
            Some("refresh_credentials") => {
                let Some(profile_id) = Self::param_i64(&request.params, "profile_id") else {
                    return AdminResponse::err(id, "profile_id is required");
                };
                match self.engine.refresh_credentials(profile_id).await {
                    Ok(profile) => AdminResponse::ok(
                        id,
                        serde_json::json!({
                            "profile_id": profile.id,
                            "account_name": profile.account_name,
                        }),
                    ),
                    // Terminal credential failures mean the account needs
                    // re-linking; the frontend phrases that for the user.
                    Err(err) => AdminResponse::err(id, err.to_string()),
                }
            }
            _ => AdminResponse::err(id, "unknown admin method"),
        }
    }
}

async fn handle_admin_client(stream: tokio::net::UnixStream, handler: AdminHandler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AdminRequest>(trimmed) {
            Ok(request) => handler.handle(request).await,
            Err(err) => AdminResponse::err(None, format!("invalid request: {err}")),
        };
        let payload = serde_json::to_string(&response)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(&args.config)?;

    std::fs::create_dir_all(&args.state_dir)?;
    let store = StateStore::open(&args.state_dir.join("tidebot.db")).await?;

    if args.webhook_url.is_none() {
        warn!("no --webhook-url given; outgoing messages will only be logged");
    }
    let notifier = Arc::new(WebhookNotifier {
        http: reqwest::Client::new(),
        url: args.webhook_url.clone(),
    });

    let engine = Engine::new(config, store, notifier, Arc::new(SummaryRenderer))?;
    engine.start_background_tasks();

    let socket_path = args.state_dir.join("admin.sock");
    if Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!("admin socket listening on {}", socket_path.display());

    let handler = AdminHandler {
        engine: engine.clone(),
    };
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_admin_client(stream, handler).await {
                        error!("admin client error: {err}");
                    }
                });
            }
            Err(err) => {
                error!("admin accept error: {err}");
            }
        }
    }
}

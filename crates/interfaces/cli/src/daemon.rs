//! Daemon wiring: build every subsystem, accept connections on a Unix
//! socket, and serve each one as a [`ServerSession`]. Frames are
//! newline-delimited JSON envelopes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono_tz::Tz;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use dotbot_agent::{AgentPipeline, PersonaProfile, TaskRegistry};
use dotbot_config::AppConfig;
use dotbot_credentials::DeviceRegistry;
use dotbot_llm::{ApiKeys, ProviderRegistry, ResilientClient};
use dotbot_memory::MemoryStore;
use dotbot_runtime::scheduler::{
    LocalScheduler, Notifier, PromptSink, ScheduledTaskStore, UpdateChecker, sweep_workspaces,
};
use dotbot_runtime::{
    DotOrchestrator, Envelope, EventBus, ServerSession, SessionDeps, Transport,
};
use dotbot_tools::{ListDirTool, ReadFileTool, ToolRegistry, WriteFileTool};

/// Newline-delimited JSON envelopes over a Unix stream — the same framing
/// the prototype's WebSocket carrier uses, minus the WebSocket.
struct UnixTransport {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    reader: Mutex<BufReader<tokio::net::unix::OwnedReadHalf>>,
}

impl UnixTransport {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            writer: Mutex::new(write_half),
            reader: Mutex::new(BufReader::new(read_half)),
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let line = serde_json::to_string(&envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(envelope) => return Some(envelope),
                Err(err) => {
                    warn!(%err, "dropping malformed frame");
                    continue;
                }
            }
        }
    }
}

/// Default persona catalog shipped with the daemon; real deployments extend
/// it from disk.
fn default_personas() -> Vec<PersonaProfile> {
    vec![PersonaProfile {
        id: "generalist".to_string(),
        name: "Generalist".to_string(),
        summary: "handles everyday multi-step tasks".to_string(),
        body: "You are a dependable generalist. Work step by step, keep outputs in \
               the workspace, and say plainly when something cannot be done."
            .to_string(),
    }]
}

fn detect_timezone(configured: &str) -> Tz {
    let name = if configured.is_empty() {
        iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
    } else {
        configured.to_string()
    };
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = %name, "unrecognised timezone — falling back to UTC");
        chrono_tz::UTC
    })
}

/// Submits scheduler prompts into Dot directly — the same handler user
/// frames reach, minus the socket hop.
struct DirectPromptSink {
    dot: Arc<DotOrchestrator>,
    scheduler: tokio::sync::OnceCell<Arc<LocalScheduler>>,
}

#[async_trait]
impl PromptSink for DirectPromptSink {
    async fn submit(
        &self,
        prompt_id: &str,
        prompt: &str,
        source: &str,
        scheduled_task_id: Option<&str>,
    ) -> Result<()> {
        let request = dotbot_runtime::DotRequest {
            user_id: "local".to_string(),
            device_id: "local".to_string(),
            prompt: prompt.to_string(),
            source: source.to_string(),
            persona: Default::default(),
            cancel: None,
        };
        let reply = self
            .dot
            .handle_prompt(request)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        // Feed the reply straight back through correlation, mirroring the
        // response frame a remote server would send.
        if let (Some(scheduler), Some(_)) = (self.scheduler.get(), scheduled_task_id) {
            let response = dotbot_runtime::ResponsePayload {
                response: reply.text.clone(),
                is_routing_ack: reply.dispatched_agent_id.is_some().then_some(true),
                agent_task_id: reply.dispatched_agent_id.clone(),
                prompt_id: Some(prompt_id.to_string()),
            };
            scheduler.on_response(&response, chrono::Utc::now()).await?;
        }
        Ok(())
    }
}

/// Notifications land in the log until a channel surface picks them up.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, task_id: &str, message: &str) {
        info!(task_id, message, "notification");
    }
}

pub async fn run_daemon(config: AppConfig, socket_path: &Path) -> Result<()> {
    let bot_dir = dotbot_config::bot_dir();
    std::fs::create_dir_all(&bot_dir)?;

    // ── LLM stack ───────────────────────────────────────────────────────────
    let keys = ApiKeys::from_env();
    let registry = Arc::new(ProviderRegistry::new(keys));
    let llm = Arc::new(ResilientClient::new(registry.clone()));

    // ── Stores ──────────────────────────────────────────────────────────────
    let memory = Arc::new(MemoryStore::open(dotbot_config::memory_dir()));
    let devices = Arc::new(DeviceRegistry::open(bot_dir.join("devices.json")));

    // ── Tools ───────────────────────────────────────────────────────────────
    let mut tools = ToolRegistry::default();
    tools.register(Arc::new(ReadFileTool));
    tools.register(Arc::new(WriteFileTool));
    tools.register(Arc::new(ListDirTool));

    // ── Pipeline + Dot ──────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let task_registry = Arc::new(TaskRegistry::new());
    let pipeline = AgentPipeline::new(
        llm.clone(),
        tools,
        task_registry.clone(),
        memory.clone(),
        default_personas(),
        config.agent.clone(),
        config.dispatch.clone(),
        dotbot_config::agent_workspaces_dir(),
    );
    let recovered = pipeline.recover_orphans();
    if !recovered.is_empty() {
        info!(count = recovered.len(), "re-entered orphaned agent tasks");
    }

    let dot = Arc::new(DotOrchestrator::new(
        llm.clone(),
        bus.clone(),
        Arc::new(pipeline),
        memory.clone(),
        config.dispatch.clone(),
    ));

    // ── Scheduler family ────────────────────────────────────────────────────
    let tz = detect_timezone(&config.scheduler.timezone);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sink = Arc::new(DirectPromptSink {
        dot: dot.clone(),
        scheduler: tokio::sync::OnceCell::new(),
    });
    let scheduler = Arc::new(LocalScheduler::new(
        ScheduledTaskStore::open(dotbot_config::scheduled_tasks_path()),
        sink.clone(),
        Arc::new(LogNotifier),
        config.scheduler.clone(),
        tz,
    ));
    let _ = sink.scheduler.set(scheduler.clone());
    tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));

    let update_checker = Arc::new(UpdateChecker::new(
        &config.server.install_dir,
        Arc::new(LogNotifier),
        tz,
        config.scheduler.update_quiet_start_hour as u32,
        config.scheduler.update_quiet_end_hour as u32,
    ));
    tokio::spawn(update_checker.run(shutdown_tx.subscribe()));

    // Workspace GC shares the daily cadence with the update checker.
    {
        let retention = config.agent.workspace_retention_hours;
        let mut gc_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(60 * 60);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let dir = dotbot_config::agent_workspaces_dir();
                        match sweep_workspaces(&dir, retention, chrono::Utc::now()) {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "workspace GC pass complete"),
                            Err(err) => warn!(%err, "workspace GC failed"),
                        }
                    }
                    changed = gc_shutdown.changed() => {
                        if changed.is_ok() && *gc_shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    // Ctrl-C flips the shared shutdown flag; every background task watches it.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // ── Accept loop ─────────────────────────────────────────────────────────
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "dotbot daemon listening");

    let deps = Arc::new(SessionDeps {
        handler: dot,
        devices,
        bus,
        scheduler: Some(scheduler),
    });

    let mut accept_shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let (stream, _) = accept?;
                let session = Arc::new(ServerSession::new(
                    deps.clone(),
                    Arc::new(UnixTransport::new(stream)),
                ));
                let session_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.run(session_shutdown).await {
                        error!(%err, "session failed");
                    }
                });
            }
            changed = accept_shutdown.changed() => {
                if changed.is_ok() && *accept_shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    registry.shutdown().await;
    info!("daemon shut down gracefully");
    Ok(())
}

/// Default socket path under the bot dir.
pub fn default_socket_path() -> PathBuf {
    dotbot_config::bot_dir().join("dotbot.sock")
}

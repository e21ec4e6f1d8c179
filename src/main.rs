mod demo;
mod doctor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stagewatch_core::config::AppConfig;
use stagewatch_core::event::EventBus;
use stagewatch_core::types::SessionEvent;
use stagewatch_engine::{GraphStateStore, InspectionSession, SessionOptions};
use stagewatch_transport::{ChannelTransport, StaticLayoutLoader};

use crate::demo::{DemoOptions, DemoPipeline};

#[derive(Parser)]
#[command(name = "stagewatch", version, about = "Live status view for pipeline graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stagewatch.toml")]
    config: PathBuf,

    /// Layout snapshot URL (overrides source.layout_url)
    #[arg(long, env = "STAGEWATCH_LAYOUT_URL")]
    layout_url: Option<String>,

    /// Layout snapshot file (overrides source.layout_file)
    #[arg(long)]
    layout_file: Option<String>,

    /// SSE status event URL (overrides source.events_url)
    #[arg(long, env = "STAGEWATCH_EVENTS_URL")]
    events_url: Option<String>,

    /// Resync status URL (overrides source.resync_url)
    #[arg(long, env = "STAGEWATCH_RESYNC_URL")]
    resync_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the pipeline in the terminal UI (default)
    Watch,
    /// Serve the live state over HTTP
    Serve {
        /// Bind address (overrides gateway.bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Log every state change to stdout
    Tail,
    /// Replay a simulated run of the built-in agent pipeline
    Demo {
        /// Milliseconds each stage spends running
        #[arg(long, default_value = "1200")]
        step_ms: u64,
        /// Stage that should fail
        #[arg(long)]
        fail: Option<String>,
        /// Simulate a connection drop mid-run
        #[arg(long)]
        outage: bool,
        /// Log instead of opening the terminal UI
        #[arg(long)]
        tail: bool,
    },
    /// Show current configuration
    Config,
    /// Check that the configured sources are reachable
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Commands {
    fn uses_tui(&self) -> bool {
        matches!(self, Commands::Watch | Commands::Demo { tail: false, .. })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Watch);

    // Initialize tracing. The TUI owns the terminal, so it only logs when asked to.
    let default_filter = if command.uses_tui() { "off" } else { "stagewatch=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stagewatch", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(&cli.config)?;
    if cli.layout_url.is_some() {
        config.source.layout_url = cli.layout_url;
    }
    if cli.layout_file.is_some() {
        config.source.layout_file = cli.layout_file;
    }
    if cli.events_url.is_some() {
        config.source.events_url = cli.events_url;
    }
    if cli.resync_url.is_some() {
        config.source.resync_url = cli.resync_url;
    }

    match command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            let failures = doctor::run_doctor(&config).await;
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Watch => {
            let session = start_session(&config)?;
            let title = config
                .source
                .layout_url
                .clone()
                .or(config.source.layout_file.clone())
                .unwrap_or_default();
            let result = stagewatch_tui::run_tui(&session, config.tui.clone(), title).await;
            session.shutdown().await;
            result?;
        }
        Commands::Serve { bind } => {
            let mut gateway_config = config.gateway.clone();
            if let Some(bind) = bind {
                gateway_config.bind = bind;
            }
            // The gateway subscribes before the session publishes anything
            let store = Arc::new(GraphStateStore::new());
            let event_bus = Arc::new(EventBus::new(config.engine.bus_capacity));
            let server = stagewatch_gateway::GatewayServer::new(
                gateway_config.clone(),
                store.clone(),
                event_bus.clone(),
            );
            let session = InspectionSession::start(
                session_options(&config)?
                    .with_store(store)
                    .with_event_bus(event_bus),
            );
            info!(bind = %gateway_config.bind, "Starting HTTP gateway");
            let cancel = shutdown_on_ctrl_c("gateway");
            let result = server.run(cancel).await;
            session.shutdown().await;
            result?;
        }
        Commands::Tail => {
            let session = start_session(&config)?;
            let cancel = shutdown_on_ctrl_c("tail");
            tail(&session, cancel).await;
            session.shutdown().await;
        }
        Commands::Demo {
            step_ms,
            fail,
            outage,
            tail: headless,
        } => {
            let pipeline = Arc::new(DemoPipeline::new());
            if let Some(stage) = &fail {
                if !pipeline.graph().nodes.iter().any(|n| &n.id == stage) {
                    anyhow::bail!("unknown stage `{}` for --fail", stage);
                }
            }
            let (transport, sender) = ChannelTransport::new(config.engine.event_buffer);
            let session = InspectionSession::start(
                SessionOptions::new(
                    Arc::new(StaticLayoutLoader::new(pipeline.graph())),
                    Arc::new(transport),
                )
                .with_resync(pipeline.clone())
                .with_engine(config.engine.clone()),
            );

            let cancel = session.shutdown_token();
            let driver = pipeline.clone();
            let options = DemoOptions {
                step: Duration::from_millis(step_ms),
                fail,
                outage,
            };
            let run = tokio::spawn(async move {
                if let Err(e) = driver.run(sender, options, cancel).await {
                    warn!(error = %e, "Demo run stopped");
                }
            });

            let result = if headless {
                tail(&session, shutdown_on_ctrl_c("demo")).await;
                Ok(())
            } else {
                stagewatch_tui::run_tui(&session, config.tui.clone(), "demo: agent pipeline").await
            };
            session.shutdown().await;
            run.abort();
            result?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Build a session from the configured sources.
fn start_session(config: &AppConfig) -> anyhow::Result<InspectionSession> {
    Ok(InspectionSession::start(session_options(config)?))
}

fn session_options(config: &AppConfig) -> anyhow::Result<SessionOptions> {
    let loader = stagewatch_transport::create_loader(config)?;
    let transport = stagewatch_transport::create_transport(config)?;
    let mut options = SessionOptions::new(loader, transport)
        .with_engine(config.engine.clone())
        .with_layout_retry(config.layout_retry.clone());
    match stagewatch_transport::create_resync(config) {
        Some(source) => options = options.with_resync(source),
        None => warn!("No resync_url configured; reconnects will show a visibility gap"),
    }
    Ok(options)
}

fn shutdown_on_ctrl_c(what: &'static str) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down {}...", what);
        cancel_clone.cancel();
    });
    cancel
}

/// Print one line per state change until cancelled or the session closes.
async fn tail(session: &InspectionSession, cancel: CancellationToken) {
    let mut rx = session.subscribe();
    if let Ok(state) = session.current_state() {
        print_state(&state);
    }
    loop {
        let evt = tokio::select! {
            _ = cancel.cancelled() => break,
            evt = rx.recv() => evt,
        };
        match evt {
            Ok(SessionEvent::StateChanged(state)) => print_state(&state),
            Ok(SessionEvent::LayoutUnavailable { reason, attempt }) => {
                warn!(attempt, reason = %reason, "Graph unavailable");
            }
            Ok(SessionEvent::LayoutLoaded { nodes, edges }) => {
                info!(nodes, edges, "Layout loaded");
            }
            Ok(SessionEvent::EventRejected { reason }) => warn!(reason = %reason, "Event rejected"),
            Ok(SessionEvent::TransportDisconnected { reason }) => {
                warn!(reason = %reason, "Disconnected")
            }
            Ok(SessionEvent::Reconnected) => info!("Reconnected"),
            Ok(SessionEvent::ResyncCompleted { applied, skipped }) => {
                info!(applied, skipped, "Resync completed")
            }
            Ok(SessionEvent::VisibilityGap { reason }) => {
                warn!(reason = %reason, "Visibility gap: showing last known status")
            }
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Tail lagged behind"),
        }
    }
}

fn print_state(state: &stagewatch_core::types::GraphState) {
    let nodes: Vec<String> = state
        .nodes
        .iter()
        .map(|n| format!("{}={}", n.id, n.status))
        .collect();
    let gap = if state.has_visibility_gap() { " [gap]" } else { "" };
    println!("gen {:>4}{} {}", state.generation, gap, nodes.join(" "));
}

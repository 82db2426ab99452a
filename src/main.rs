use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_live::session::Role;
use loqa_live::{
    create_router, AppState, Config, DeviceEngines, LiveTransport, SessionConfig, SessionManager,
    SessionState, TracingSink, TranscriptionEvent,
};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loqa-live", version, about = "Full-duplex voice session with a live agent")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, default_value = "config/loqa-live")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Talk to the agent from this terminal until Ctrl-C
    Run {
        /// Text file appended to the agent's instructions as reference context
        #[arg(long)]
        context_file: Option<String>,

        /// Replay a WAV file instead of opening the microphone
        #[arg(long)]
        input_wav: Option<String>,
    },
    /// Serve the HTTP control API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(&cli.config)?;

    info!("Loqa Live v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Agent model: {} (voice {})", cfg.agent.model, cfg.agent.voice);

    match cli.command {
        Command::Run {
            context_file,
            input_wav,
        } => {
            if input_wav.is_some() {
                cfg.audio.input_file = input_wav;
            }
            let context = match context_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read context file {}", path))?,
                ),
                None => None,
            };
            run(cfg, context).await
        }
        Command::Serve => serve(cfg).await,
    }
}

fn build_manager(cfg: &Config) -> SessionManager {
    SessionManager::new(
        SessionConfig::from_config(cfg),
        Arc::new(LiveTransport::from_config(&cfg.agent)),
        Arc::new(DeviceEngines::from_config(&cfg.audio)),
        Arc::new(TracingSink),
    )
}

async fn run(cfg: Config, context: Option<String>) -> Result<()> {
    let manager = build_manager(&cfg);

    manager
        .connect(print_transcript, context)
        .await
        .context("Connection failed")?;

    info!("Session open, speak now (Ctrl-C to stop)");

    let mut state = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                if matches!(current, SessionState::Closed | SessionState::Failed) {
                    warn!("Session ended ({})", current);
                    break;
                }
            }
        }
    }

    let stats = manager.disconnect().await;
    println!();
    info!("Session ended");
    info!("  Duration: {:.1}s", stats.duration_secs);
    info!(
        "  Frames sent: {} (dropped {})",
        stats.frames_sent, stats.frames_dropped
    );
    info!(
        "  Audio chunks: {} enqueued, {} played, {} discarded",
        stats.chunks_enqueued, stats.chunks_completed, stats.chunks_discarded
    );
    info!("  Interruptions: {}", stats.interruptions);

    Ok(())
}

fn print_transcript(event: TranscriptionEvent) {
    let label = match event.role {
        Role::User => "you",
        Role::Model => "agent",
    };
    if event.is_final {
        println!("\r[{}] {}", label, event.text);
    } else {
        print!("\r[{}] {}", label, event.text);
        std::io::stdout().flush().ok();
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let state = AppState::new(Arc::new(build_manager(&cfg)));
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

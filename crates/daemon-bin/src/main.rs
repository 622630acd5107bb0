//! Keywarden daemon entry point.

mod dispatch;
mod state;

use anyhow::Context;
use clap::Parser;
use daemon_config_and_utils::{init_logging, Config, Paths};
use daemon_ipc::IpcServer;
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use state::DaemonState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Keywarden: local security daemon for keychains, authorizations, and
/// smartcards.
#[derive(Parser, Debug)]
#[command(name = "keywardend", version)]
struct Cli {
    /// Stay in the foreground (no detach).
    #[arg(long, default_value_t = true)]
    foreground: bool,

    /// Base directory override (default: ~/.keywarden).
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Request-port socket path override.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Smartcard service level override
    /// (forced_off|forced_on|external_daemon|conservative|aggressive).
    #[arg(long)]
    service_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.base_dir {
        Some(base) => Paths::with_base_dir(base.clone()),
        None => Paths::new().context("cannot locate base directory")?,
    };
    paths.ensure_dirs()?;

    let mut config = Config::load(&paths)?;
    if let Some(level) = &cli.service_level {
        config.service_level = Config::parse_service_level(level)?;
    }
    init_logging(&config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        foreground = cli.foreground,
        "keywarden daemon starting"
    );

    // Fatal on failure: without the root session there is no daemon.
    let state = match DaemonState::build(config, &paths) {
        Ok(state) => state,
        Err(error) => {
            error!(error = %error, "daemon bring-up failed");
            std::process::exit(1);
        }
    };

    std::fs::write(paths.pid_file(), std::process::id().to_string())?;

    let socket = cli.socket.unwrap_or_else(|| paths.socket_file());
    let server = Arc::new(IpcServer::new(&socket, state.clone()));
    state
        .shutdown
        .set(server.shutdown_sender())
        .unwrap_or_else(|_| unreachable!("shutdown sender set once"));

    // Smartcard management starts from a timer so it never delays startup.
    state.monitor.start();

    spawn_signal_listener(state.clone(), server.clone());

    let result = server.run().await;

    let _ = std::fs::remove_file(paths.pid_file());
    info!("keywarden daemon stopped");
    result.map_err(Into::into)
}

/// Handle process signals on a dedicated thread: TERM/INT shut down,
/// USR1/USR2 stand in for the platform sleep/wake notifications.
fn spawn_signal_listener(state: Arc<DaemonState>, server: Arc<IpcServer>) {
    let mut signals = match Signals::new([SIGTERM, SIGINT, SIGUSR1, SIGUSR2]) {
        Ok(signals) => signals,
        Err(error) => {
            warn!(error = %error, "signal listener unavailable");
            return;
        }
    };

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGTERM | SIGINT => {
                        info!(signal, "shutdown signal received");
                        server.shutdown();
                        break;
                    }
                    SIGUSR1 => {
                        info!("sleep notification");
                        state.system_will_sleep();
                    }
                    SIGUSR2 => {
                        info!("wake notification");
                        state.system_is_waking();
                    }
                    _ => {}
                }
            }
        })
        .expect("failed to spawn signal listener thread");
}

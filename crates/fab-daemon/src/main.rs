//! `fabd` — the supervisor daemon binary.
//!
//! Loads the daemon config, acquires the single-instance lockfile, builds
//! the [`Supervisor`](fab_daemon::supervisor::Supervisor), and runs it until
//! ctrl-c or a dispatched `shutdown` request closes the shutdown gate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fab_core::daemon_config::DaemonConfig;
use fab_core::lockfile::DaemonLockfile;
use fab_daemon::supervisor::{ExternalClients, Supervisor};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

struct Cli {
    config_path: Option<PathBuf>,
    replace: bool,
    log_format: LogFormat,
}

#[derive(Clone, Copy)]
enum LogFormat {
    Human,
    Json,
}

/// Hand-rolled rather than a `clap` dependency — three flags, no teacher
/// precedent for a CLI parser crate in this binary.
fn parse_args() -> Result<Cli> {
    let mut config_path = None;
    let mut replace = false;
    let mut log_format = LogFormat::Human;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
            }
            "--replace" | "-r" => replace = true,
            "--log-format" => {
                let value = args
                    .next()
                    .context("--log-format requires human|json")?;
                log_format = match value.as_str() {
                    "human" => LogFormat::Human,
                    "json" => LogFormat::Json,
                    other => anyhow::bail!("unknown log format: {other}"),
                };
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(Cli {
        config_path,
        replace,
        log_format,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args()?;

    match cli.log_format {
        LogFormat::Human => fab_telemetry::logging::init_logging("fabd", "info"),
        LogFormat::Json => fab_telemetry::logging::init_logging_json("fabd", "info"),
    }

    let config = match &cli.config_path {
        Some(path) => DaemonConfig::load_from(path).context("failed to load daemon config")?,
        None => DaemonConfig::load().context("failed to load daemon config")?,
    };

    if cli.replace {
        DaemonLockfile::replace_incumbent().context("failed to replace incumbent daemon")?;
    }

    let webhook_port: u16 = config
        .webhook_bind_addr
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        webhook_port,
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    lockfile
        .acquire_or_fail()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to acquire daemon lockfile")?;

    info!(pid = std::process::id(), "fabd starting");

    // Concrete GitHub/Linear backends and an LLM-provider authorizer are
    // external collaborators (spec.md §1) — none are wired in-tree yet, so
    // the comment poller has no projects to drive and the permission
    // handler's LLM path always denies with an explanatory message until a
    // caller supplies them.
    let clients = ExternalClients::default();

    let result = run(config, clients).await;

    DaemonLockfile::remove();
    result
}

async fn run(config: DaemonConfig, clients: ExternalClients) -> Result<()> {
    let (supervisor, shutdown_rx) = Supervisor::new(config, clients)
        .await
        .context("failed to construct supervisor")?;

    let ctrlc_shutdown = supervisor.dispatcher.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, triggering shutdown");
            ctrlc_shutdown.trigger(false);
        }
    });

    supervisor.run(shutdown_rx).await;
    info!("fabd stopped");
    Ok(())
}

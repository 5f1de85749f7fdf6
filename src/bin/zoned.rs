//! zoned - Zone Manager Daemon
//!
//! Constructs the zones manager from the configured zone set, starts every
//! zone, serves the host socket API, and blocks until a termination
//! signal.
//!
//! ## Usage
//!
//! ```sh
//! zoned --config /etc/zoned/daemon.json
//! zoned --config ./daemon.json --log-level debug --backend test
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use zoned::backend::{TestBackendFactory, ZoneBackendFactory};
use zoned::bus::MemoryBus;
use zoned::{HostEndpoint, ZonesManager};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
struct Options {
    config: PathBuf,
    log_level: String,
    backend: String,
    detach_on_exit: bool,
}

enum Command {
    Run(Options),
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut options = Options {
        config: PathBuf::from("/etc/zoned/daemon.json"),
        log_level: "info".to_string(),
        backend: "test".to_string(),
        detach_on_exit: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" | "help" => return Ok(Command::Help),
            "--version" | "-v" | "version" => return Ok(Command::Version),
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    options.config = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    return Err("--config requires a path".to_string());
                }
            }
            "--log-level" | "-l" => {
                if i + 1 < args.len() {
                    options.log_level = args[i + 1].clone();
                    i += 2;
                } else {
                    return Err("--log-level requires a value".to_string());
                }
            }
            "--backend" | "-b" => {
                if i + 1 < args.len() {
                    options.backend = args[i + 1].clone();
                    i += 2;
                } else {
                    return Err("--backend requires a name".to_string());
                }
            }
            "--detach-on-exit" | "-d" => {
                options.detach_on_exit = true;
                i += 1;
            }
            other => return Err(format!("unrecognized option: {other}")),
        }
    }

    Ok(Command::Run(options))
}

fn parse_level(s: &str) -> Result<Level, String> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        other => Err(format!("unknown log level: {other}")),
    }
}

fn backend_factory(name: &str) -> Result<Arc<dyn ZoneBackendFactory>, String> {
    match name {
        "test" => Ok(Arc::new(TestBackendFactory::new())),
        other => Err(format!(
            "unknown backend '{other}' (built-in backends: test)"
        )),
    }
}

fn print_version() {
    println!("zoned {}", env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    println!(
        r#"zoned - zone manager daemon

USAGE:
    zoned [options]

OPTIONS:
    --config, -c <path>      Daemon configuration file
                             (default: /etc/zoned/daemon.json)
    --log-level, -l <level>  error | warn | info | debug | trace
    --backend, -b <name>     Container runtime driver (default: test)
    --detach-on-exit, -d     Leave zones running on daemon exit
    --help, -h               Show this help
    --version, -v            Show version
"#
    );
}

// =============================================================================
// Daemon
// =============================================================================

async fn run(options: Options) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %options.config.display(),
        backend = %options.backend,
        "zoned starting"
    );

    let connector = MemoryBus::new();
    let factory = backend_factory(&options.backend).map_err(anyhow::Error::msg)?;
    let manager = ZonesManager::new(&options.config, connector, factory).await?;

    manager.start_all().await?;
    if let Err(e) = manager.start_input_monitor() {
        warn!(error = %e, "input monitor not started");
    }
    if options.detach_on_exit {
        manager.set_zones_detach_on_exit().await;
    }

    let endpoint = HostEndpoint::new(Arc::clone(&manager));
    endpoint.start()?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    // Drain in reverse startup order: input monitor, IPC endpoint, zones.
    manager.stop_input_monitor();
    endpoint.stop().await;
    manager.shutdown().await;
    info!("zoned stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            return ExitCode::FAILURE;
        }
    };

    let options = match command {
        Command::Run(options) => options,
        Command::Version => {
            print_version();
            return ExitCode::SUCCESS;
        }
        Command::Help => {
            print_help();
            return ExitCode::SUCCESS;
        }
    };

    let level = match parse_level(&options.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set tracing subscriber");
        return ExitCode::FAILURE;
    }

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

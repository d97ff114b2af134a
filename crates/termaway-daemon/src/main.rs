use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use termaway_daemon::paths::TermawayPaths;

/// Network-accessible terminal multiplexer daemon.
#[derive(Debug, Parser)]
#[command(name = "termaway-daemon", version, about)]
struct Cli {
    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Shared password required from clients
    #[arg(long, env = "TERMAWAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Certificate directory; TLS is enabled when it holds both
    /// server.crt and server.key
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Service name for local network discovery advertisement
    #[arg(long)]
    service_name: Option<String>,
}

fn main() {
    termaway_daemon::logging::init_logging();
    info!(event = "daemon.start_started");

    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("termaway-daemon: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = TermawayPaths::resolve()?;
    let mut config = termaway_daemon::load_daemon_config(&paths)?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(password) = cli.password {
        config.password = Some(password);
    }
    if let Some(cert_dir) = cli.cert_dir {
        config.cert_dir = Some(cert_dir);
    }
    if let Some(service_name) = cli.service_name {
        config.service_name = Some(service_name);
    }
    config.validate()?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        error!(event = "daemon.runtime_init_failed", error = %e);
        e
    })?;

    rt.block_on(async {
        termaway_daemon::run_server(config).await.map_err(|e| {
            error!(event = "daemon.server_failed", error = %e);
            e
        })
    })?;

    Ok(())
}

//! tlsconduit: SNI/ALPN dispatch listener

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use tlsconduit::config::{ConduitConfig, LogLevel};
use tlsconduit::server::DispatchServer;

const MAX_CONNECTIONS: usize = 10_000;

const USAGE: &str = "\
Usage: tlsconduit [config.toml] [OPTIONS]

Options:
  --log-level <LEVEL>     debug|verbose|normal|silent
  --silent, -s            Only warnings and errors
  --help, -h              Show this help
  --version, -V           Show version";

struct CliArgs {
    config_path: String,
    silent: bool,
    log_level: Option<String>,
}

impl CliArgs {
    fn parse() -> Self {
        let mut cli = CliArgs {
            config_path: "config.toml".to_string(),
            silent: false,
            log_level: None,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--silent" | "-s" => cli.silent = true,
                "--log-level" => match args.next() {
                    Some(level) => cli.log_level = Some(level),
                    None => eprintln!("[tlsconduit] --log-level needs a value"),
                },
                "--help" | "-h" => {
                    eprintln!("{}", USAGE);
                    std::process::exit(0);
                }
                "--version" | "-V" => {
                    println!("tlsconduit {}", env!("CARGO_PKG_VERSION"));
                    std::process::exit(0);
                }
                other => {
                    if let Some(level) = other.strip_prefix("--log-level=") {
                        cli.log_level = Some(level.to_string());
                    } else if other.starts_with('-') {
                        eprintln!("[tlsconduit] Ignoring unknown option {}", other);
                    } else {
                        cli.config_path = other.to_string();
                    }
                }
            }
        }
        cli
    }

    /// CLI flags override the config file
    fn log_level(&self, config: &ConduitConfig) -> LogLevel {
        if self.silent {
            return LogLevel::Silent;
        }
        match self.log_level {
            Some(ref level) => LogLevel::from_str_loose(level),
            None => config.general.log_level,
        }
    }
}

/// Load the config file, writing the defaults out when it does not exist yet
fn load_or_create(config_path: &str) -> ConduitConfig {
    if Path::new(config_path).exists() {
        return match ConduitConfig::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[tlsconduit] {}: {}", config_path, e);
                std::process::exit(1);
            }
        };
    }

    let config = ConduitConfig::default();
    let written = toml::to_string_pretty(&config)
        .map_err(|e| e.to_string())
        .and_then(|text| std::fs::write(config_path, text).map_err(|e| e.to_string()));
    match written {
        Ok(()) => eprintln!("[tlsconduit] Wrote default config to {}", config_path),
        Err(e) => eprintln!("[tlsconduit] Running on defaults, could not write {}: {}", config_path, e),
    }
    config
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let config = load_or_create(&cli.config_path);
    if let Err(e) = config.validate() {
        eprintln!("[tlsconduit] {}", e);
        std::process::exit(1);
    }
    let log_level = cli.log_level(&config);

    // Startup banner always at info; the configured filter applies afterwards
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::Layer::default())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), log_level = %log_level, "tlsconduit starting");
    info!(
        bindings = config.sni.bindings.len(),
        default = %config.sni.default,
        "SNI table loaded"
    );
    info!(protocols = ?config.alpn.server_protocols, "ALPN server preference");
    if config.alpn.server_protocols.is_empty() {
        warn!("alpn.server_protocols is empty, offers will never be answered");
    }

    let addr = config.listen_addr()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Cannot bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "Accepting connections");

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(log_level.to_filter_str())
    };
    if let Err(e) = filter_handle.reload(filter) {
        error!(error = %e, "Cannot apply log filter");
    }

    let server = Arc::new(DispatchServer::from_config(&config));
    let accept_loop = tokio::spawn(server.run(listener, Arc::new(Semaphore::new(MAX_CONNECTIONS))));

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for ctrl-c");
    }
    info!("Shutting down");
    accept_loop.abort();

    Ok(())
}

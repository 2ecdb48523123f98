//! NovaGuard Server Binary
//!
//! Usage: novaguard-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file (default: configs.json, then config.json)
//!   -d, --device-map <FILE>  Device binding table
//!       --show-code          Print the ng:// connection codes and exit
//!       --log-level <LEVEL>  Log filter when RUST_LOG is unset
//!   -h, --help               Print help information

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use novaguard::descriptor::ConnectionDescriptor;
use novaguard::server::{ConfigSet, EngineSettings, Server, DEFAULT_DEVICE_MAP_FILE};

#[derive(Parser, Debug)]
#[command(name = "novaguard-server", version, about = "NovaGuard tunnel server")]
struct Cli {
    /// Configuration file holding one record or an array of records
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device binding table
    #[arg(short, long, default_value = DEFAULT_DEVICE_MAP_FILE)]
    device_map: PathBuf,

    /// Print one ng:// connection code per record and exit
    #[arg(long)]
    show_code: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let configs = load_configs(cli.config.as_deref())?;

    if cli.show_code {
        show_codes(&configs)?;
        return Ok(());
    }

    run_server(configs, cli.device_map).await
}

fn load_configs(path: Option<&Path>) -> anyhow::Result<ConfigSet> {
    let configs = match path {
        Some(path) => ConfigSet::load(path),
        None => ConfigSet::discover(Path::new(".")),
    };
    configs.context("cannot start without a configuration")
}

fn show_codes(configs: &ConfigSet) -> anyhow::Result<()> {
    for config in configs.configs() {
        println!("{}", ConnectionDescriptor::for_config(config).to_uri()?);
    }
    Ok(())
}

async fn run_server(configs: ConfigSet, device_map: PathBuf) -> anyhow::Result<()> {
    let settings = EngineSettings {
        device_map_path: Some(device_map),
        ..EngineSettings::default()
    };

    let server = Server::new(configs, settings).context("TLS setup failed")?;
    let shutdown = server.shutdown_token();

    for config in server.configs().configs() {
        tracing::info!(
            "Serving config {:?} on tcp/{} udp/{}",
            config.config_id,
            config.tcp_port,
            config.udp_port
        );
        match ConnectionDescriptor::for_config(config).to_uri() {
            Ok(code) => tracing::info!("Connection code: {}", code),
            Err(e) => tracing::warn!("Cannot build connection code: {}", e),
        }
    }

    let run = server.run();
    tokio::pin!(run);

    let signalled = tokio::select! {
        result = &mut run => {
            result?;
            false
        }
        _ = shutdown_signal() => true,
    };

    if signalled {
        println!("Shutting down server...");
        shutdown.cancel();
        run.await?;
    }

    println!("{}", server.metrics().format_report());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

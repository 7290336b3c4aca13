mod config;
mod telemetry;

use clap::{Args, Parser};
use config::{Config, ConfigError};
use rpc_proxy::config::{CSRF_MODE_ENV, ValidationError};
use rpc_proxy::errors::StartupError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use telemetry::TelemetryError;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "gateway", version, about = "JSON-RPC batching gateway")]
enum CliCommand {
    /// Serve the RPC proxy and its admin endpoints
    #[command(alias = "run")]
    RpcProxy(ConfigArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
    /// Print every metric the gateway emits
    ListMetrics,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, env = "GATEWAY_CONFIG")]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid RPC_PROXY_CSRF_MODE: {0}")]
    CsrfOverride(#[from] ValidationError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("rpc proxy failed: {0}")]
    RpcProxy(#[from] StartupError),
}

fn main() -> ExitCode {
    let result = match CliCommand::parse() {
        CliCommand::RpcProxy(args) => run_rpc_proxy(&args.config_file),
        CliCommand::CheckConfig(args) => check_config(&args.config_file),
        CliCommand::ListMetrics => {
            list_metrics();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<Config, CliError> {
    let mut config = Config::from_file(path)?;
    let csrf_mode = std::env::var(CSRF_MODE_ENV).ok();
    config.rpc_proxy = config
        .rpc_proxy
        .with_csrf_mode_override(csrf_mode.as_deref())?;
    Ok(config)
}

fn run_rpc_proxy(path: &Path) -> Result<(), CliError> {
    let config = load_config(path)?;
    let _telemetry = telemetry::init(&config.common)?;

    let api_key_env = &config.rpc_proxy.upstream.api_key_env;
    let api_key = std::env::var(api_key_env).ok();
    if api_key.is_none() {
        tracing::warn!(
            variable = %api_key_env,
            "Upstream API key not set, chains that need it are disabled"
        );
    }
    tracing::info!(
        csrf_mode = config.rpc_proxy.csrf.mode.as_str(),
        "Starting rpc proxy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        rpc_proxy::run(config.rpc_proxy, api_key, shutdown_rx).await
    })?;

    Ok(())
}

fn check_config(path: &Path) -> Result<(), CliError> {
    let config = load_config(path)?;
    let proxy = &config.rpc_proxy;
    println!("Config OK");
    println!("  listener: {}:{}", proxy.listener.host, proxy.listener.port);
    println!(
        "  admin listener: {}:{}",
        proxy.admin_listener.host, proxy.admin_listener.port
    );
    println!("  csrf mode: {}", proxy.csrf.mode.as_str());
    match &proxy.upstream.chains {
        Some(chains) => println!("  chains: {} configured", chains.len()),
        None => println!("  chains: built-in table"),
    }
    Ok(())
}

fn list_metrics() {
    for def in rpc_proxy::metrics_defs::ALL_METRICS {
        println!("{def}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

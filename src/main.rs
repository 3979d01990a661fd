//! Mockka, an HTTP API mocking service.
//!
//! Serves live HTTP from a directory tree of `.mock` rule files: inbound
//! requests are matched against rules and a canned response is synthesized
//! (static text, file payload, or an upstream proxy). A background observer
//! reloads rules on disk changes without restart.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod metrics;
mod observer;
mod parser;
mod rule;
mod server;
mod stabber;
mod txlog;
mod urlnorm;

use config::Config;
use observer::Observer;

#[derive(Parser)]
#[command(name = "mockka")]
#[command(author, version, about = "HTTP API mocking service")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mock server (default)
    Run {
        /// Config file path
        #[arg(short, long, default_value = "mockka.yaml", value_name = "PATH")]
        config: PathBuf,

        /// Override http:port from the config
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Validate configuration file
    Validate {
        /// Config file path
        #[arg(short, long, default_value = "mockka.yaml", value_name = "PATH")]
        config: PathBuf,
    },

    /// List known services and their rules
    List {
        /// Config file path
        #[arg(short, long, default_value = "mockka.yaml", value_name = "PATH")]
        config: PathBuf,

        /// Only this service
        #[arg(long, value_name = "NAME")]
        service: Option<String>,
    },
}

fn cli_config_path(cli: &Cli) -> PathBuf {
    match &cli.command {
        None => PathBuf::from("mockka.yaml"),
        Some(Commands::Run { config, .. }) => config.clone(),
        Some(Commands::Validate { config }) => config.clone(),
        Some(Commands::List { config, .. }) => config.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Validate { config }) => {
            init_logging(None, &cli);
            run_validate(config)
        }
        other => {
            let config_path = cli_config_path(&cli);
            let config = Config::load(&config_path)?;
            init_logging(Some(&config), &cli);
            match other {
                Some(Commands::List { service, .. }) => run_list(&config, service.as_deref()).await,
                Some(Commands::Run { port, .. }) => run_server(&config, *port).await,
                None => run_server(&config, None).await,
                _ => unreachable!(),
            }
        }
    }
}

/// Init tracing from config (logging:level, logging:format) or env. Env
/// MOCKKA_LOG_LEVEL and MOCKKA_LOG_FORMAT override the config.
fn init_logging(config: Option<&Config>, cli: &Cli) {
    let use_json = match std::env::var("MOCKKA_LOG_FORMAT").ok().as_deref() {
        Some("json") => true,
        Some(_) => false,
        None => config
            .and_then(|c| c.logging.format.as_deref())
            .map(|f| f == "json")
            .unwrap_or(false),
    };

    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else if cli.verbose {
        EnvFilter::new("mockka=debug")
    } else {
        let level = std::env::var("MOCKKA_LOG_LEVEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| config.map(|c| c.logging.level.clone()))
            .unwrap_or_else(|| "info".to_string());
        let filter_str = format!("mockka={level}");
        if config.is_some() {
            EnvFilter::new(filter_str)
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str))
        }
    };

    if use_json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .json(),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    }
}

fn run_validate(config_path: &std::path::Path) -> anyhow::Result<()> {
    match Config::load(config_path) {
        Ok(_) => {
            tracing::info!("config valid");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!("config invalid: {e}");
            std::process::exit(1);
        }
    }
}

/// One observer pass, then print services and their rules.
async fn run_list(config: &Config, only_service: Option<&str>) -> anyhow::Result<()> {
    let observer = Arc::new(Observer::new(
        &config.data.rule_dir,
        config.processing.auto_head,
    ));
    observer.load().await;

    let base = config
        .listing
        .as_ref()
        .map(|l| format!("{}://{}:{}", l.scheme, l.host, l.port))
        .unwrap_or_else(|| format!("http://{}:{}", config.http.ip, config.http.port));

    let services = observer.services().await;
    if services.is_empty() {
        println!("No rules loaded");
        return Ok(());
    }

    for service in services {
        if let Some(only) = only_service {
            if service != only {
                continue;
            }
        }
        println!("{service}");
        for name in observer.service_rule_names(&service).await {
            if let Some(rule) = observer.rule_by_name(&service, &name).await {
                let mark = if rule.is_wildcard { "~" } else { " " };
                println!(
                    "  {mark} {name}: {} {}{}",
                    rule.request.method, base, rule.request.url
                );
                if !rule.desc.is_empty() {
                    println!("      {}", rule.desc);
                }
            }
        }
    }
    Ok(())
}

async fn run_server(config: &Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let observer = Arc::new(Observer::new(
        &config.data.rule_dir,
        config.processing.auto_head,
    ));
    observer.load().await;
    tracing::info!(rules = observer.rules_count().await, "initial rule scan done");

    let observer_handle = observer.start(config.data.check_delay);

    // Metrics: init and serve GET /metrics when enabled.
    if let Some(metrics_config) = config.metrics.as_ref().filter(|m| m.enabled) {
        if let Err(e) = metrics::init() {
            tracing::warn!("metrics init failed: {e}");
        } else {
            let addr: SocketAddr = format!("{}:{}", metrics_config.ip, metrics_config.port)
                .parse()
                .map_err(|e| anyhow::anyhow!("metrics address invalid: {e}"))?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "metrics server listening on GET /metrics");
            tokio::spawn(async move {
                let app = axum::Router::new().route(
                    "/metrics",
                    axum::routing::get(|| async {
                        (
                            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                            metrics::encode(),
                        )
                    }),
                );
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("metrics server error: {e}");
                }
            });
        }
    }

    let state = Arc::new(server::build_state(config, observer)?);
    let app = server::router(state.clone());

    let port = port_override.unwrap_or(config.http.port);
    let addr: SocketAddr = format!("{}:{}", config.http.ip, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("listener address invalid: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, token = %state.server_token, "mockka HTTP server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(handle) = observer_handle {
        handle.shutdown().await;
    }
    tracing::info!("graceful shutdown complete");
    Ok(())
}

/// Future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use snapdom::config::{LogLevel, ProviderConfig, ServiceConfig};
use snapdom::render_manager::{RenderDefaults, RenderManager};
use snapdom::server::{build_router, AppState};
use snapdom_browser::backoff::{Backoff, BackoffTier, FlatBackoff, TieredBackoff};
use snapdom_browser::{
    detect_browser_binary, BrowserProvider, ChromiumLauncher, ExternalEndpoint, ExternalProvider,
    SupervisedProvider, SupervisorConfig,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Render web pages to their post-JavaScript HTML over CDP.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    /// Ignore any configuration file and run with built-in defaults
    #[arg(long)]
    no_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("fatal: {err:#}");
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, source) = load_config(&cli)?;
    init_logging(config.app.log_level);
    info!("starting snapdom v{}", env!("CARGO_PKG_VERSION"));
    match source {
        ConfigSource::File(path) => info!("configuration loaded from {}", path.display()),
        ConfigSource::Defaults => info!("running with built-in defaults"),
        ConfigSource::MissingFile(path) => warn!(
            "config file {} not found, using built-in defaults",
            path.display()
        ),
    }

    let provider = build_provider(&config)?;
    let manager = Arc::new(RenderManager::new(
        move || provider,
        RenderDefaults::from_config(&config),
    ));
    manager
        .start()
        .await
        .context("browser provider failed to start")?;

    let state = AppState::new(Arc::clone(&manager));
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.app.host, config.app.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("render service listening on http://{addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server exited unexpectedly")?;

    info!("shutting down browser provider");
    manager.stop().await;
    Ok(())
}

enum ConfigSource {
    File(PathBuf),
    Defaults,
    MissingFile(PathBuf),
}

fn load_config(cli: &Cli) -> Result<(ServiceConfig, ConfigSource)> {
    if cli.no_config {
        return Ok((ServiceConfig::default(), ConfigSource::Defaults));
    }
    if cli.config.exists() {
        let config = ServiceConfig::load(&cli.config)?;
        Ok((config, ConfigSource::File(cli.config.clone())))
    } else {
        Ok((
            ServiceConfig::default(),
            ConfigSource::MissingFile(cli.config.clone()),
        ))
    }
}

fn init_logging(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_provider(config: &ServiceConfig) -> Result<Arc<dyn BrowserProvider>> {
    let launcher = Arc::new(ChromiumLauncher::new());
    match &config.browser.provider {
        ProviderConfig::Internal {
            chrome_path,
            debug_port_base,
            args_override,
            extra_args,
            auto_recycle,
            auto_recycle_after_uptime_millis,
            auto_recycle_retry_after_millis,
            recycle_drain_millis,
        } => {
            let binary = chrome_path
                .clone()
                .or_else(detect_browser_binary)
                .ok_or_else(|| {
                    anyhow!("no chromium binary found; set browser.provider.chromePath or SNAPDOM_CHROME")
                })?;
            let mut supervisor_config =
                SupervisorConfig::new(binary, *debug_port_base, debug_port_base + 1);
            supervisor_config.args_override = args_override.clone();
            supervisor_config.extra_args = extra_args.clone();
            supervisor_config.auto_recycle = *auto_recycle;
            supervisor_config.auto_recycle_after_uptime_ms = *auto_recycle_after_uptime_millis;
            supervisor_config.auto_recycle_retry_after_ms = *auto_recycle_retry_after_millis;
            supervisor_config.recycle_drain_ms = *recycle_drain_millis;
            Ok(Arc::new(SupervisedProvider::new(supervisor_config, launcher)))
        }
        ProviderConfig::ExternalStaticUrl {
            ws_url,
            reconnect_delay_millis,
        } => Ok(Arc::new(ExternalProvider::new(
            ExternalEndpoint::WsUrl(ws_url.clone()),
            launcher,
            reconnect_backoff(*reconnect_delay_millis),
        ))),
        ProviderConfig::ExternalHostPort {
            host,
            port,
            secure,
            reconnect_delay_millis,
        } => Ok(Arc::new(ExternalProvider::new(
            ExternalEndpoint::HostPort {
                host: host.clone(),
                port: *port,
                secure: *secure,
            },
            launcher,
            reconnect_backoff(*reconnect_delay_millis),
        ))),
    }
}

/// Flat when configured explicitly; otherwise a ladder that backs off as
/// the endpoint stays gone.
fn reconnect_backoff(configured_ms: Option<u64>) -> Box<dyn Backoff> {
    match configured_ms {
        Some(ms) => Box::new(FlatBackoff::new(ms)),
        None => Box::new(
            TieredBackoff::new(vec![
                BackoffTier {
                    tries_threshold: 0,
                    ms: 500,
                },
                BackoffTier {
                    tries_threshold: 5,
                    ms: 2_000,
                },
                BackoffTier {
                    tries_threshold: 20,
                    ms: 10_000,
                },
            ])
            .expect("static tier table is non-empty"),
        ),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

//! relaybot daemon: HTTP inbound webhook in front of the orchestrator.

use relaybot::api::{self, ApiState};
use relaybot::config::{Config, RuntimeConfig};
use relaybot::store::{KeySpace, Store};
use relaybot::{Orchestrator, OrchestratorDeps, conversation, logging, messaging, responder};

use anyhow::Context as _;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "relaybot")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file (defaults to RELAYBOT_CONFIG, then ./relaybot.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.debug);

    let config_path = Config::resolve_path(args.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let store = Store::connect(&config.store)
        .await
        .context("failed to connect to the coordination store")?;
    let runtime_config = Arc::new(RuntimeConfig::new(config.orchestrator.clone()));
    let history = conversation::from_config(&config.history)
        .await
        .context("failed to open conversation history")?;

    let orchestrator = Orchestrator::new(OrchestratorDeps {
        store,
        keys: KeySpace::new(config.store.key_prefix.clone()),
        runtime_config: runtime_config.clone(),
        responder: responder::from_config(&config.responder)?,
        messenger: messaging::from_config(&config.messenger)?,
        history,
    });

    let janitor = orchestrator.spawn_janitor();
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_reload(config_path, runtime_config, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.api.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind))?;
    let server = tokio::spawn(api::serve(
        listener,
        Arc::new(ApiState::new(orchestrator.clone())),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(%error, "http api stopped with an error"),
        Err(error) => tracing::error!(%error, "http api task failed"),
    }
    orchestrator.shutdown().await;
    if let Some(janitor) = janitor
        && let Err(error) = janitor.await
    {
        tracing::warn!(%error, "janitor task failed");
    }

    tracing::info!("relaybot stopped");
    Ok(())
}

/// Reload orchestrator settings from disk on SIGHUP.
#[cfg(unix)]
async fn watch_reload(path: PathBuf, runtime_config: Arc<RuntimeConfig>, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            tracing::warn!(%error, "failed to install SIGHUP handler, config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                reload(&path, &runtime_config);
            }
        }
    }
}

#[cfg(not(unix))]
async fn watch_reload(_path: PathBuf, _runtime_config: Arc<RuntimeConfig>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload(path: &Path, runtime_config: &RuntimeConfig) {
    let result = Config::load(path).and_then(|config| runtime_config.reload(config.orchestrator));
    match result {
        Ok(()) => tracing::info!(path = %path.display(), "orchestrator config reloaded"),
        Err(error) => tracing::error!(%error, "config reload rejected, keeping current settings"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
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
}

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::burrow::{
    config, logging,
    tunnel::{client, server},
};

/// Run the relay endpoint until a shutdown signal.
pub async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path)?;
    let cfg = config::load_server_config(&path)
        .with_context(|| format!("load config: {}", path.display()))?;

    let logrt = logging::init(cfg.env, &cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        config = %path.display(),
        public_port = cfg.public_port,
        client_port = cfg.client_port,
        "burrow: starting relay"
    );

    let server = server::Server::bind(&cfg).await?;
    run_endpoint(move |shutdown| server.serve(shutdown)).await
}

/// Run the tunnel client endpoint until the link drops or a shutdown signal.
pub async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path)?;
    let cfg = config::load_client_config(&path)
        .with_context(|| format!("load config: {}", path.display()))?;

    let logrt = logging::init(cfg.env, &cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        config = %path.display(),
        server_addr = %cfg.server_addr,
        upstream_port = cfg.port,
        timeout = %humantime::format_duration(cfg.timeout),
        "burrow: starting tunnel client"
    );

    let client = client::Client::new(cfg);
    run_endpoint(move |shutdown| async move { client.connect(shutdown).await }).await
}

async fn run_endpoint<F, Fut>(endpoint: F) -> anyhow::Result<()>
where
    F: FnOnce(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = JoinSet::new();
    tasks.spawn(endpoint(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain: endpoints observe the watch channel within one polling interval;
    // only enforce a timeout if something hangs.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

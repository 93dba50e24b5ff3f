use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, task::JoinSet};

use crate::promtun::{
    VERSION, admin,
    config::{self, StartupArgs},
    logging, net, telemetry,
    tunnel::{
        connector::GatewayConnectorFactory, manager::Manager, relay::Destination,
        resolver::HttpResolver,
    },
};

pub async fn run(args: StartupArgs) -> anyhow::Result<()> {
    let cfg = config::load(args).context("load config")?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        version = VERSION,
        resolver_url = %cfg.resolver_url,
        server_name = %cfg.server_name,
        destination = cfg.destination.as_deref().unwrap_or("<per stream>"),
        config_size = cfg.payload.len(),
        admin_addr = %cfg.admin_addr,
        "promtun: starting"
    );

    let destination = match &cfg.destination {
        Some(addr) => {
            probe_destination(addr, cfg.tunnel.timeout).await?;
            Destination::Fixed(addr.clone())
        }
        None => Destination::PerStream,
    };

    let settings = Arc::new(cfg.tunnel.clone());
    let dialers = GatewayConnectorFactory::new(
        cfg.server_name.clone(),
        &cfg.project_token,
        cfg.payload.clone(),
        settings.clone(),
    )?;
    let resolver = HttpResolver::new(&cfg.resolver_url, &cfg.project_token, &settings)?;
    let manager = Manager::new(
        Arc::new(resolver),
        Arc::new(dialers),
        Arc::new(destination),
        settings,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prometheus: telemetry::init_prometheus()?,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, admin_state, shutdown).await });
    }

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            manager.run(shutdown).await;
            Ok(())
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out, aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("promtun: stopped");
    Ok(())
}

/// A fixed destination must accept TCP connections at startup.
async fn probe_destination(addr: &str, timeout: Duration) -> anyhow::Result<()> {
    let conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("deadline exceeded"))
        .and_then(|r| r.map_err(anyhow::Error::from))
        .with_context(|| format!("failed to ping destination {addr}"))?;
    drop(conn);
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

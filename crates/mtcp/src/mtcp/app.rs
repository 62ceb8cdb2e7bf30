use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::mtcp::{
    admin,
    config::{self, Config},
    logging, net, telemetry,
    tunnel::{agent::Agent, relay::Relay},
};

/// Which side of the tunnel this process runs, with the CLI overrides for it.
#[derive(Debug, Clone)]
pub enum Mode {
    Relay(RelayOverrides),
    Agent(AgentOverrides),
}

#[derive(Debug, Clone, Default)]
pub struct RelayOverrides {
    pub port: Option<u16>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub server: Option<String>,
    pub fleet_size: Option<usize>,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Relay(_) => "relay",
            Mode::Agent(_) => "agent",
        }
    }

    /// Applies command-line flags on top of the loaded file.
    fn apply(&self, cfg: &mut Config) -> anyhow::Result<()> {
        match self {
            Mode::Relay(o) => {
                if let Some(port) = o.port {
                    let host = net::split_host_port(&cfg.relay.listen_addr)
                        .map(|(h, _)| h.to_string())
                        .unwrap_or_default();
                    cfg.relay.listen_addr = net::join_host_port(&host, port);
                }
                if let Some(n) = o.pool_size {
                    if n == 0 {
                        anyhow::bail!("--pool-size must be at least 1");
                    }
                    cfg.relay.pool_size = n;
                }
            }
            Mode::Agent(o) => {
                if let Some(server) = &o.server {
                    cfg.agent.server_addr = server.trim().to_string();
                }
                if o.ip.is_some() || o.port.is_some() {
                    let (host, port) = net::split_host_port(&cfg.agent.target_addr)
                        .map(|(h, p)| (h.to_string(), p))
                        .unwrap_or_else(|| ("127.0.0.1".to_string(), 80));
                    let host = o.ip.as_deref().map(str::trim).map(str::to_string).unwrap_or(host);
                    cfg.agent.target_addr = net::join_host_port(&host, o.port.unwrap_or(port));
                }
                if let Some(n) = o.fleet_size {
                    if n == 0 {
                        anyhow::bail!("--fleet-size must be at least 1");
                    }
                    cfg.agent.fleet_size = n;
                }
            }
        }
        Ok(())
    }
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let mut cfg = config::load_resolved(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    mode.apply(&mut cfg)?;

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        config_found = resolved.path.is_file(),
        mode = mode.name(),
        admin_addr = %cfg.admin_addr,
        "mtcp: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let relay_ctx = match &mode {
        Mode::Relay(_) => {
            let relay = Relay::new(cfg.relay.options())?;
            let ctx = relay.context();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { relay.listen_and_serve(shutdown).await });
            Some(ctx)
        }
        Mode::Agent(_) => {
            let agent = Agent::new(cfg.agent.options())?;
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { agent.run(shutdown).await });
            None
        }
    };

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let state = admin::AdminState {
            prom: Arc::new(telemetry::init_prometheus()?),
            mode: mode.name(),
            relay: relay_ctx,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                Some(Ok(Ok(()))) | None => {}
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(drain_timeout),
            "shutdown: tasks did not stop in time; aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("mtcp: stopped");
    Ok(())
}

async fn shutdown_signal() {
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
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

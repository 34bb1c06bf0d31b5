use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::portbridge::{
    admin,
    agent::{self, AgentEndpoint, AgentSlot},
    config, logging, net, telemetry,
    tunnel::{
        provider::{ProviderOptions, TunnelProvider},
        supervisor::{BackoffOptions, StreamSupervisor, SupervisorState, SupervisorStatus},
        table::TunnelTable,
    },
};

/// Command-line values that override the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub instance_id: Option<String>,
    pub agent_port: Option<u16>,
}

pub async fn run(overrides: Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(overrides.config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)?;
    cfg.apply_overrides(overrides.instance_id, overrides.agent_port);

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    cfg.validate()?;

    let endpoint = AgentEndpoint::new(cfg.agent.host.clone(), cfg.agent.port);
    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        instance_id = %cfg.workspace.instance_id,
        agent = %endpoint,
        admin_addr = %cfg.admin_addr,
        "portbridge: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let tokens = agent::token::from_config(&cfg.auth);
    let connector = Arc::new(agent::client::TcpConnector::new(
        agent::client::AgentClientOptions {
            instance_id: cfg.workspace.instance_id.clone(),
            workspace_host: cfg.workspace.host.clone(),
            connect_timeout: cfg.agent.connect_timeout,
            request_timeout: cfg.agent.request_timeout,
        },
        tokens,
    ));

    let table = Arc::new(TunnelTable::new());
    let slot = Arc::new(AgentSlot::new());
    let supervisor = Arc::new(StreamSupervisor::new(
        connector,
        table.clone(),
        slot.clone(),
        BackoffOptions {
            initial_delay: cfg.reconnect.initial_delay,
            multiplier: cfg.reconnect.multiplier,
            max_attempts: cfg.reconnect.max_attempts,
        },
    ));
    let provider = Arc::new(TunnelProvider::new(
        table,
        slot,
        ProviderOptions {
            open_timeout: cfg.provider.open_timeout,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let status = supervisor.subscribe();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            watch_status(status, shutdown).await;
            Ok(())
        });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("config: invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            supervisor: supervisor.clone(),
            provider: provider.clone(),
            agent: endpoint.clone(),
            config_path: resolved.path.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    supervisor.start(endpoint).await;

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);
    supervisor.stop().await;

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(drain_timeout), "shutdown: tasks did not drain; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

/// Logs supervisor transitions until shutdown.
async fn watch_status(
    mut status: watch::Receiver<SupervisorStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last = status.borrow_and_update().state;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let current = status.borrow_and_update().clone();
        if current.state == last {
            continue;
        }
        last = current.state;
        let endpoint = current.endpoint.as_deref().unwrap_or("-");
        match current.state {
            SupervisorState::Disconnected => tracing::error!(
                endpoint,
                attempts = current.attempts,
                "agent: disconnected; POST /connect to retry"
            ),
            state => tracing::debug!(endpoint, state = ?state, attempts = current.attempts, "agent: state changed"),
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
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

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::portbridge::{
    agent::{AgentApi, AgentSlot, OpenTunnel},
    net, telemetry,
    tunnel::{
        handle::{Privacy, TunnelDescription, TunnelHandle},
        table::TunnelTable,
    },
};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("tunnel: no agent connected")]
    NotConnected,
    #[error("tunnel: opening port {port} failed: {message}")]
    OpenFailed { port: u16, message: String },
    #[error("tunnel: port {port} did not appear within {timeout:?}")]
    Timeout { port: u16, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub privacy: Privacy,
}

impl TunnelRequest {
    pub fn localhost(port: u16) -> Self {
        Self {
            host: "localhost".into(),
            port,
            local_port: None,
            privacy: Privacy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Upper bound on waiting for a requested port to show up in the table.
    pub open_timeout: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
        }
    }
}

type OpenOutcome = Result<Arc<TunnelHandle>, ProviderError>;

// One outstanding open per port. The driver task publishes the outcome exactly once
// and removes the entry before doing so.
#[derive(Debug)]
struct InFlight {
    result: watch::Sender<Option<OpenOutcome>>,
}

impl InFlight {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { result: tx }
    }
}

/// Hands out tunnel handles to editor tooling.
///
/// Requests for ports that are already tunneled resolve from the table; anything
/// else asks the agent to open the port and waits for the next snapshot that
/// contains it.
pub struct TunnelProvider {
    table: Arc<TunnelTable>,
    agent: Arc<AgentSlot>,
    opts: ProviderOptions,
    inflight: Arc<DashMap<u16, Arc<InFlight>>>,
}

impl TunnelProvider {
    pub fn new(table: Arc<TunnelTable>, agent: Arc<AgentSlot>, opts: ProviderOptions) -> Self {
        Self {
            table,
            agent,
            opts,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub async fn request(&self, req: TunnelRequest) -> Result<Arc<TunnelHandle>, ProviderError> {
        if req.port == 0 || !net::is_loopback_host(&req.host) {
            tracing::debug!(host = %req.host, port = req.port, "tunnel: unsupported host; returning closed handle");
            return Ok(Arc::new(TunnelHandle::inert(req.port)));
        }
        if let Some(h) = self.table.get(req.port) {
            return Ok(h);
        }

        let port = req.port;
        let mut rx = self.join_or_open(req)?;
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(ProviderError::OpenFailed {
                port,
                message: "open task ended without a result".into(),
            })
        })
    }

    fn join_or_open(
        &self,
        req: TunnelRequest,
    ) -> Result<watch::Receiver<Option<OpenOutcome>>, ProviderError> {
        match self.inflight.entry(req.port) {
            Entry::Occupied(e) => Ok(e.get().result.subscribe()),
            Entry::Vacant(e) => {
                let agent = self.agent.current().ok_or(ProviderError::NotConnected)?;
                let flight = Arc::new(InFlight::new());
                let rx = flight.result.subscribe();
                e.insert(flight.clone());

                let open = OpenTunnel {
                    remote_port: req.port,
                    local_port: req.local_port,
                    visibility: req.privacy.visibility(),
                };
                tokio::spawn(drive_open(
                    self.table.clone(),
                    agent,
                    self.inflight.clone(),
                    flight,
                    open,
                    self.opts.open_timeout,
                ));
                Ok(rx)
            }
        }
    }

    /// Active tunnels for display.
    pub fn tunnels(&self) -> Vec<TunnelDescription> {
        self.table.list()
    }

    /// Explicitly closes the tunnel on `port`. Returns false if there was none.
    pub async fn close(&self, port: u16) -> bool {
        match self.table.remove(port) {
            Some(h) => {
                h.close().await;
                true
            }
            None => false,
        }
    }

    /// The local URL that `http://localhost:<port>` inside the workspace maps to.
    pub fn local_url(&self, port: u16) -> Option<String> {
        self.table.get(port).map(|h| h.local_address())
    }

    /// Rewrites a workspace loopback URI so it opens through its tunnel.
    ///
    /// `http://localhost:3000/app?x=1#top` becomes `http://localhost:<local>/app?x=1#top`
    /// when port 3000 is tunneled. Anything else comes back unchanged: non-loopback
    /// hosts, URIs without an explicit port, untunneled ports and strings that do not
    /// parse.
    pub fn resolve_external_uri(&self, uri: &str) -> String {
        self.rewrite_through_tunnel(uri)
            .unwrap_or_else(|| uri.to_string())
    }

    fn rewrite_through_tunnel(&self, uri: &str) -> Option<String> {
        let mut parsed = Url::parse(uri).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        if !net::is_loopback_host(parsed.host_str()?) {
            return None;
        }
        let handle = self.table.get(parsed.port()?)?;

        parsed.set_scheme("http").ok()?;
        parsed.set_host(Some("localhost")).ok()?;
        parsed.set_port(Some(handle.local_port())).ok()?;
        tracing::debug!(uri, resolved = %parsed, "tunnel: resolved external uri");
        Some(parsed.into())
    }
}

async fn drive_open(
    table: Arc<TunnelTable>,
    agent: Arc<dyn AgentApi>,
    inflight: Arc<DashMap<u16, Arc<InFlight>>>,
    flight: Arc<InFlight>,
    req: OpenTunnel,
    timeout: Duration,
) {
    let port = req.remote_port;
    metrics::counter!(telemetry::OPEN_REQUESTS).increment(1);
    tracing::debug!(port, visibility = ?req.visibility, "tunnel: requesting open");

    let opened = async {
        agent
            .open_tunnel(req)
            .await
            .map_err(|err| ProviderError::OpenFailed {
                port,
                message: err.to_string(),
            })?;
        table.wait_for(port).await.ok_or(ProviderError::NotConnected)
    };
    let outcome = match tokio::time::timeout(timeout, opened).await {
        Ok(res) => res,
        Err(_) => Err(ProviderError::Timeout { port, timeout }),
    };

    if let Err(err) = &outcome {
        metrics::counter!(telemetry::OPEN_FAILURES).increment(1);
        tracing::warn!(port, err = %err, "tunnel: open failed");
    }

    inflight.remove(&port);
    flight.result.send_replace(Some(outcome));
}

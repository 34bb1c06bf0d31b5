//! Client side of the local agent API.
//!
//! The agent runs on the developer's machine and brokers tunnels into the remote
//! workspace. Everything in `tunnel` talks to it through [`AgentApi`], so the wire
//! transport in [`client`] can be swapped out (tests use an in-memory fake).

pub mod client;
pub mod protocol;
pub mod token;

use std::{fmt, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the agent listens on when nothing else is configured.
pub const DEFAULT_AGENT_PORT: u16 = 63100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    None,
    Private,
    Network,
}

/// One entry of a tunnel status snapshot pushed by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub remote_port: u16,
    pub local_port: u16,
    #[serde(default)]
    pub visibility: Visibility,
}

impl TunnelStatus {
    pub fn new(remote_port: u16, local_port: u16, visibility: Visibility) -> Self {
        Self {
            remote_port,
            local_port,
            visibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTunnel {
    pub remote_port: u16,
    pub local_port: Option<u16>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedTunnel {
    pub remote_port: u16,
    pub local_port: u16,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent: connect {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent: io: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("agent: rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("agent: unexpected reply: {0}")]
    Unexpected(&'static str),
    #[error("agent: credentials: {0}")]
    Credentials(String),
    #[error("agent: timed out after {0:?}")]
    Timeout(Duration),
}

/// A server-pushed sequence of tunnel snapshots.
///
/// Dropping the stream cancels the underlying call.
#[async_trait]
pub trait StatusStream: Send {
    /// `Ok(None)` means the agent ended the stream cleanly.
    async fn next_snapshot(&mut self) -> Result<Option<Vec<TunnelStatus>>, AgentError>;
}

pub type BoxedStatusStream = Box<dyn StatusStream>;

#[async_trait]
pub trait AgentApi: Send + Sync {
    fn endpoint(&self) -> &AgentEndpoint;
    async fn tunnel_status(&self) -> Result<BoxedStatusStream, AgentError>;
    async fn open_tunnel(&self, req: OpenTunnel) -> Result<OpenedTunnel, AgentError>;
    async fn close_tunnel(&self, remote_port: u16) -> Result<(), AgentError>;
}

/// Builds an [`AgentApi`] for a given endpoint. The supervisor calls this on every
/// (re)start so that switching agent ports needs no other plumbing.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, endpoint: &AgentEndpoint) -> Arc<dyn AgentApi>;
}

/// The agent the process is currently attached to, shared between the supervisor
/// (writer) and the provider (reader).
#[derive(Default)]
pub struct AgentSlot {
    current: ArcSwapOption<Arc<dyn AgentApi>>,
}

impl fmt::Debug for AgentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSlot")
            .field("endpoint", &self.current().map(|a| a.endpoint().to_string()))
            .finish()
    }
}

impl AgentSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn AgentApi>> {
        self.current.load_full().map(|a| Arc::clone(&*a))
    }

    pub fn set(&self, agent: Option<Arc<dyn AgentApi>>) {
        self.current.store(agent.map(Arc::new));
    }
}

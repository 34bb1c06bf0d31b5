use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU16, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::portbridge::agent::{AgentApi, TunnelStatus, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    #[default]
    Private,
}

impl Privacy {
    pub fn from_visibility(v: Visibility) -> Self {
        match v {
            Visibility::Network => Privacy::Public,
            Visibility::None | Visibility::Private => Privacy::Private,
        }
    }

    pub fn visibility(self) -> Visibility {
        match self {
            Privacy::Public => Visibility::Network,
            Privacy::Private => Visibility::Private,
        }
    }
}

impl std::fmt::Display for Privacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Privacy::Public => write!(f, "public"),
            Privacy::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

/// Display form of a tunnel, as listed to editor tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDescription {
    pub remote_address: RemoteAddress,
    pub local_address: String,
    pub privacy: Privacy,
}

/// One remote port mapped to a locally reachable address.
///
/// Handles are owned by the [`TunnelTable`](super::table::TunnelTable); everyone
/// else holds an `Arc` that does not keep the mapping alive. Privacy is fixed for the
/// lifetime of a handle: a privacy change replaces the handle.
pub struct TunnelHandle {
    remote: RemoteAddress,
    local_port: AtomicU16,
    privacy: Privacy,
    disposed: AtomicBool,
    on_dispose: watch::Sender<bool>,
    agent: Option<Arc<dyn AgentApi>>,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("remote", &self.remote)
            .field("local_port", &self.local_port())
            .field("privacy", &self.privacy)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl TunnelHandle {
    pub fn new(status: &TunnelStatus, agent: Option<Arc<dyn AgentApi>>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            remote: RemoteAddress {
                host: "localhost".into(),
                port: status.remote_port,
            },
            local_port: AtomicU16::new(status.local_port),
            privacy: Privacy::from_visibility(status.visibility),
            disposed: AtomicBool::new(false),
            on_dispose: tx,
            agent,
        }
    }

    /// A handle that is closed from birth. Returned for requests that can never be
    /// tunneled so callers get "unsupported" instead of an error.
    pub fn inert(remote_port: u16) -> Self {
        let h = Self::new(
            &TunnelStatus::new(remote_port, remote_port, Visibility::None),
            None,
        );
        h.dispose_silently();
        h
    }

    pub fn remote_address(&self) -> &RemoteAddress {
        &self.remote
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    pub fn local_address(&self) -> String {
        format!("http://localhost:{}", self.local_port())
    }

    pub fn privacy(&self) -> Privacy {
        self.privacy
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn describe(&self) -> TunnelDescription {
        TunnelDescription {
            remote_address: self.remote.clone(),
            local_address: self.local_address(),
            privacy: self.privacy,
        }
    }

    /// Returns true when the local port actually changed.
    pub(crate) fn refresh_local_port(&self, port: u16) -> bool {
        self.local_port.swap(port, Ordering::AcqRel) != port
    }

    /// Table-internal disposal: no remote side effect. Returns false if the handle
    /// was already disposed.
    pub fn dispose_silently(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.on_dispose.send_replace(true);
        true
    }

    /// Caller-initiated disposal: asks the agent to close the tunnel, then fires the
    /// disposed signal. Close failures are logged, not returned.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(agent) = &self.agent {
            if let Err(err) = agent.close_tunnel(self.remote.port).await {
                tracing::warn!(port = self.remote.port, err = %err, "tunnel: close failed");
            }
        }
        self.on_dispose.send_replace(true);
    }

    /// Resolves once the handle has been disposed (immediately if it already was).
    pub async fn disposed(&self) {
        let mut rx = self.on_dispose.subscribe();
        let _ = rx.wait_for(|d| *d).await;
    }
}

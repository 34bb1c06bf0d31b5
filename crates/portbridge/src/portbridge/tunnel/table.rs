use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::portbridge::{
    agent::{AgentApi, TunnelStatus},
    telemetry,
    tunnel::{
        handle::{Privacy, TunnelDescription, TunnelHandle},
        notifier::{ChangeListener, ChangeNotifier},
    },
};

/// What one snapshot did to the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Handles kept as-is whose local port was updated in place.
    pub refreshed: usize,
}

impl DiffSummary {
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.removed > 0
    }
}

/// Authoritative map of remote port to tunnel handle.
///
/// Writers are the snapshot diff, teardown and explicit close; each write happens
/// under one lock acquisition so readers see either the old or the new table.
#[derive(Debug, Default)]
pub struct TunnelTable {
    tunnels: RwLock<HashMap<u16, Arc<TunnelHandle>>>,
    changes: ChangeNotifier,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u16, Arc<TunnelHandle>>> {
        self.tunnels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u16, Arc<TunnelHandle>>> {
        self.tunnels.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, remote_port: u16) -> Option<Arc<TunnelHandle>> {
        self.read()
            .get(&remote_port)
            .filter(|h| !h.is_disposed())
            .cloned()
    }

    /// Live tunnels. A handle closed directly by its holder stops counting at once,
    /// even though the entry stays until the next snapshot.
    pub fn len(&self) -> usize {
        live_count(&self.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active tunnels ordered by remote port.
    pub fn list(&self) -> Vec<TunnelDescription> {
        let mut out: Vec<TunnelDescription> = self
            .read()
            .values()
            .filter(|h| !h.is_disposed())
            .map(|h| h.describe())
            .collect();
        out.sort_by_key(|d| d.remote_address.port);
        out
    }

    pub fn listen(&self) -> ChangeListener {
        self.changes.listen()
    }

    pub fn generation(&self) -> u64 {
        self.changes.generation()
    }

    /// Reconciles a full snapshot against the table and fires at most one change
    /// notification for it.
    pub fn apply_snapshot(
        &self,
        snapshot: &[TunnelStatus],
        agent: Option<&Arc<dyn AgentApi>>,
    ) -> DiffSummary {
        let mut summary = DiffSummary::default();
        let mut retired: Vec<Arc<TunnelHandle>> = Vec::new();

        let total = {
            let mut tunnels = self.write();
            let present: HashSet<u16> = snapshot.iter().map(|s| s.remote_port).collect();

            for status in snapshot {
                let port = status.remote_port;
                if port == 0 {
                    tracing::warn!(local_port = status.local_port, "tunnel: ignoring status for remote port 0");
                    continue;
                }

                let privacy = Privacy::from_visibility(status.visibility);
                let keep = tunnels
                    .get(&port)
                    .is_some_and(|h| h.privacy() == privacy && !h.is_disposed());
                if keep {
                    if let Some(h) = tunnels.get(&port) {
                        if h.refresh_local_port(status.local_port) {
                            summary.refreshed += 1;
                        }
                    }
                    continue;
                }

                let fresh = Arc::new(TunnelHandle::new(status, agent.cloned()));
                match tunnels.insert(port, fresh) {
                    Some(old) => {
                        retired.push(old);
                        summary.replaced += 1;
                    }
                    None => summary.added += 1,
                }
            }

            tunnels.retain(|port, h| {
                if present.contains(port) {
                    return true;
                }
                retired.push(h.clone());
                summary.removed += 1;
                false
            });

            live_count(&tunnels)
        };

        for h in retired {
            h.dispose_silently();
        }

        metrics::gauge!(telemetry::TUNNELS).set(total as f64);
        if summary.changed() {
            self.changes.notify();
        }
        summary
    }

    /// Drops every handle (silently) and fires one notification. Returns how many
    /// handles were torn down.
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<TunnelHandle>> = self.write().drain().map(|(_, h)| h).collect();
        for h in &drained {
            h.dispose_silently();
        }
        metrics::gauge!(telemetry::TUNNELS).set(0.0);
        self.changes.notify();
        drained.len()
    }

    /// Takes a handle out of the table without disposing it; used by explicit close,
    /// which then calls [`TunnelHandle::close`] itself.
    pub fn remove(&self, remote_port: u16) -> Option<Arc<TunnelHandle>> {
        let (removed, total) = {
            let mut tunnels = self.write();
            let removed = tunnels.remove(&remote_port);
            (removed, live_count(&tunnels))
        };
        if removed.is_some() {
            metrics::gauge!(telemetry::TUNNELS).set(total as f64);
            self.changes.notify();
        }
        removed
    }

    /// Waits until the table holds a live handle for `remote_port`.
    ///
    /// Returns `None` only if the table stops notifying, which cannot happen while
    /// the caller borrows it; callers bound the wait with a timeout.
    pub async fn wait_for(&self, remote_port: u16) -> Option<Arc<TunnelHandle>> {
        let mut changes = self.listen();
        loop {
            if let Some(h) = self.get(remote_port) {
                return Some(h);
            }
            if !changes.changed().await {
                return None;
            }
        }
    }
}

fn live_count(tunnels: &HashMap<u16, Arc<TunnelHandle>>) -> usize {
    tunnels.values().filter(|h| !h.is_disposed()).count()
}

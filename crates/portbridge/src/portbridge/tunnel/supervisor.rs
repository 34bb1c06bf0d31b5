use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::portbridge::{
    agent::{AgentApi, AgentConnector, AgentEndpoint, AgentError, AgentSlot},
    telemetry,
    tunnel::table::TunnelTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    /// Gave up after too many consecutive failures; only an explicit start recovers.
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub endpoint: Option<String>,
    /// Consecutive failed attempts since the last received snapshot.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            endpoint: None,
            attempts: 0,
            retry_in_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

struct Session {
    endpoint: AgentEndpoint,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(endpoint = %self.endpoint, err = %err, "agent: session task failed");
        }
    }
}

/// Keeps one tunnel-status stream to the agent alive and mirrors it into the
/// [`TunnelTable`].
///
/// A stream that ends or fails tears the table down and is retried with
/// exponential backoff. After `max_attempts` consecutive failures the supervisor
/// parks in [`SupervisorState::Disconnected`] until `start` is called again.
pub struct StreamSupervisor {
    connector: Arc<dyn AgentConnector>,
    table: Arc<TunnelTable>,
    agent: Arc<AgentSlot>,
    opts: BackoffOptions,
    session: Mutex<Option<Session>>,
    status: Arc<watch::Sender<SupervisorStatus>>,
}

impl StreamSupervisor {
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        table: Arc<TunnelTable>,
        agent: Arc<AgentSlot>,
        opts: BackoffOptions,
    ) -> Self {
        let (status, _rx) = watch::channel(SupervisorStatus::default());
        Self {
            connector,
            table,
            agent,
            opts,
            session: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Starts streaming from `endpoint`, cancelling any session already running.
    /// The attempt counter starts from zero.
    pub async fn start(&self, endpoint: AgentEndpoint) {
        let mut session = self.session.lock().await;
        if let Some(prev) = session.take() {
            tracing::info!(endpoint = %prev.endpoint, "agent: replacing active session");
            prev.shutdown().await;
            self.table.clear();
        }

        let api = self.connector.connect(&endpoint);
        self.agent.set(Some(api.clone()));
        self.status.send_replace(SupervisorStatus {
            state: SupervisorState::Connecting,
            endpoint: Some(endpoint.to_string()),
            attempts: 0,
            retry_in_ms: None,
        });

        let (cancel, cancel_rx) = watch::channel(false);
        let worker = Worker {
            api,
            table: self.table.clone(),
            opts: self.opts.clone(),
            status: self.status.clone(),
            cancel: cancel_rx,
        };
        tracing::info!(endpoint = %endpoint, "agent: session started");
        let task = tokio::spawn(worker.run());
        *session = Some(Session {
            endpoint,
            cancel,
            task,
        });
    }

    /// Cancels the active session, tears the table down and forgets the agent.
    ///
    /// A cancelled worker leaves the table alone; teardown after cancellation is
    /// owned here and in `start`, so it fires exactly one notification.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(prev) = session.take() {
            let endpoint = prev.endpoint.clone();
            prev.shutdown().await;
            tracing::info!(endpoint = %endpoint, "agent: session stopped");
        }
        self.agent.set(None);
        self.table.clear();
        self.status.send_modify(|s| {
            s.state = SupervisorState::Stopped;
            s.retry_in_ms = None;
        });
    }
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(AgentError),
}

struct Worker {
    api: Arc<dyn AgentApi>,
    table: Arc<TunnelTable>,
    opts: BackoffOptions,
    status: Arc<watch::Sender<SupervisorStatus>>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let endpoint = self.api.endpoint().to_string();
        let mut attempts = 0u32;
        let mut delay = self.opts.initial_delay;

        loop {
            self.publish(SupervisorState::Connecting, attempts, None);
            metrics::counter!(telemetry::STREAM_ATTEMPTS).increment(1);

            let failure = match self.stream_once(&mut attempts, &mut delay).await {
                StreamEnd::Cancelled => {
                    tracing::debug!(endpoint = %endpoint, "agent: tunnel status stream cancelled");
                    return;
                }
                StreamEnd::Closed => None,
                StreamEnd::Failed(err) => Some(err),
            };
            let torn_down = self.table.clear();
            match failure {
                None => {
                    tracing::warn!(endpoint = %endpoint, torn_down, "agent: tunnel status stream ended");
                }
                Some(err) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        err = %err,
                        torn_down,
                        "agent: cannot maintain connection to local agent"
                    );
                }
            }
            metrics::counter!(telemetry::STREAM_FAILURES).increment(1);

            attempts += 1;
            if attempts >= self.opts.max_attempts {
                tracing::error!(
                    endpoint = %endpoint,
                    attempts,
                    "agent: could not connect to local agent; waiting for an explicit reconnect"
                );
                self.publish(SupervisorState::Disconnected, attempts, None);
                return;
            }

            self.publish(SupervisorState::Backoff, attempts, Some(delay));
            tracing::info!(
                endpoint = %endpoint,
                attempt = attempts,
                backoff = %humantime::format_duration(delay),
                "agent: reconnecting"
            );
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, self.opts.multiplier);
        }
    }

    async fn stream_once(&mut self, attempts: &mut u32, delay: &mut Duration) -> StreamEnd {
        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return StreamEnd::Cancelled,
            res = self.api.tunnel_status() => res,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return StreamEnd::Failed(err),
        };

        let mut streaming = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return StreamEnd::Cancelled,
                res = stream.next_snapshot() => res,
            };
            let snapshot = match next {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return StreamEnd::Closed,
                Err(err) => return StreamEnd::Failed(err),
            };

            if !streaming {
                streaming = true;
                *attempts = 0;
                *delay = self.opts.initial_delay;
                self.publish(SupervisorState::Streaming, 0, None);
                tracing::info!(endpoint = %self.api.endpoint(), "agent: tunnel status stream established");
            }

            metrics::counter!(telemetry::SNAPSHOTS).increment(1);
            let summary = self.table.apply_snapshot(&snapshot, Some(&self.api));
            if summary.changed() {
                tracing::debug!(
                    added = summary.added,
                    replaced = summary.replaced,
                    removed = summary.removed,
                    "tunnel: table updated"
                );
            }
        }
    }

    fn publish(&self, state: SupervisorState, attempts: u32, retry_in: Option<Duration>) {
        self.status.send_modify(|s| {
            s.state = state;
            s.attempts = attempts;
            s.retry_in_ms = retry_in.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        });
    }
}

/// Grows `delay` by `multiplier`, saturating instead of overflowing.
fn next_delay(delay: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}

/// Resolves once cancellation is requested or the session owner is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portbridge::{
        agent::{TunnelStatus, Visibility},
        tunnel::testing::{FakeAgent, FakeConnector, wait_until},
    };

    fn supervisor(agent: Arc<FakeAgent>) -> (StreamSupervisor, Arc<TunnelTable>, Arc<AgentSlot>) {
        let table = Arc::new(TunnelTable::new());
        let slot = Arc::new(AgentSlot::new());
        let sup = StreamSupervisor::new(
            FakeConnector::new(agent),
            table.clone(),
            slot.clone(),
            BackoffOptions::default(),
        );
        (sup, table, slot)
    }

    fn gaps_ms(calls: &[tokio::time::Instant]) -> Vec<u128> {
        calls
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect()
    }

    fn assert_gaps(calls: &[tokio::time::Instant], expected: &[u128]) {
        let gaps = gaps_ms(calls);
        assert_eq!(gaps.len(), expected.len(), "gaps {gaps:?}");
        for (got, want) in gaps.iter().zip(expected) {
            assert!(
                *got >= *want && *got <= *want + 5,
                "gaps {gaps:?}, expected {expected:?}"
            );
        }
    }

    async fn wait_state(sup: &StreamSupervisor, state: SupervisorState) -> SupervisorStatus {
        let mut rx = sup.subscribe();
        let status = rx.wait_for(|s| s.state == state).await.unwrap().clone();
        status
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_end_in_disconnected() {
        let agent = FakeAgent::new();
        let (sup, _table, _slot) = supervisor(agent.clone());

        sup.start(AgentEndpoint::localhost(63100)).await;
        let st = wait_state(&sup, SupervisorState::Disconnected).await;
        assert_eq!(st.attempts, 5);
        assert_eq!(st.endpoint.as_deref(), Some("localhost:63100"));

        tokio::time::sleep(Duration::from_secs(600)).await;
        let calls = agent.status_calls();
        assert_eq!(calls.len(), 5, "no sixth attempt");
        assert_gaps(&calls, &[1000, 1500, 2250, 3375]);
    }

    #[tokio::test(start_paused = true)]
    async fn received_snapshot_resets_the_attempt_counter() {
        let agent = FakeAgent::new();
        agent.push_failure();
        agent.push_failure();
        let tx = agent.push_stream();
        tx.send(Ok(vec![TunnelStatus::new(3000, 3000, Visibility::Private)]))
            .unwrap();
        drop(tx);

        let (sup, _table, _slot) = supervisor(agent.clone());
        sup.start(AgentEndpoint::localhost(63100)).await;
        wait_state(&sup, SupervisorState::Disconnected).await;

        let calls = agent.status_calls();
        assert_eq!(calls.len(), 7);
        assert_gaps(&calls, &[1000, 1500, 1000, 1500, 2250, 3375]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_tears_down_the_table() {
        let agent = FakeAgent::new();
        let tx = agent.push_stream();
        let (sup, table, _slot) = supervisor(agent.clone());

        sup.start(AgentEndpoint::localhost(63100)).await;
        tx.send(Ok(vec![TunnelStatus::new(3000, 3000, Visibility::Network)]))
            .unwrap();
        wait_until(|| table.get(3000).is_some()).await;
        assert_eq!(sup.status().state, SupervisorState::Streaming);
        let handle = table.get(3000).unwrap();

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle.disposed())
            .await
            .expect("handle disposed on stream end");
        assert!(table.is_empty());
        assert!(agent.close_calls().is_empty(), "teardown is silent");

        let st = wait_state(&sup, SupervisorState::Backoff).await;
        assert_eq!(st.attempts, 1);
        assert_eq!(st.retry_in_ms, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_returns_immediately() {
        let agent = FakeAgent::new();
        let (sup, _table, slot) = supervisor(agent.clone());

        sup.start(AgentEndpoint::localhost(63100)).await;
        wait_state(&sup, SupervisorState::Backoff).await;
        assert!(slot.current().is_some());

        let before = tokio::time::Instant::now();
        sup.stop().await;
        assert!(before.elapsed() < Duration::from_millis(1000));
        assert_eq!(sup.status().state, SupervisorState::Stopped);
        assert!(slot.current().is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(agent.status_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_streaming_disposes_handles() {
        let agent = FakeAgent::new();
        let tx = agent.push_stream();
        let (sup, table, _slot) = supervisor(agent.clone());

        sup.start(AgentEndpoint::localhost(63100)).await;
        tx.send(Ok(vec![TunnelStatus::new(80, 10080, Visibility::Private)]))
            .unwrap();
        wait_until(|| table.get(80).is_some()).await;
        let handle = table.get(80).unwrap();
        let generation = table.generation();

        sup.stop().await;
        assert_eq!(table.generation(), generation + 1, "one teardown, one notification");
        assert!(handle.is_disposed());
        assert!(table.is_empty());
        assert!(tx.is_closed(), "stream dropped");
        assert_eq!(sup.status().state, SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_again_replaces_the_running_session() {
        let agent = FakeAgent::new();
        let first = agent.push_stream();
        let second = agent.push_stream();
        let connector = FakeConnector::new(agent.clone());
        let table = Arc::new(TunnelTable::new());
        let sup = StreamSupervisor::new(
            connector.clone(),
            table.clone(),
            Arc::new(AgentSlot::new()),
            BackoffOptions::default(),
        );

        sup.start(AgentEndpoint::localhost(63100)).await;
        first
            .send(Ok(vec![TunnelStatus::new(80, 80, Visibility::Private)]))
            .unwrap();
        wait_until(|| table.get(80).is_some()).await;
        let old = table.get(80).unwrap();

        let generation = table.generation();
        sup.start(AgentEndpoint::localhost(63200)).await;
        assert_eq!(table.generation(), generation + 1);
        assert!(first.is_closed(), "old stream cancelled");
        assert!(old.is_disposed());
        assert_eq!(sup.status().endpoint.as_deref(), Some("localhost:63200"));
        assert_eq!(sup.status().attempts, 0);

        second
            .send(Ok(vec![TunnelStatus::new(443, 443, Visibility::Network)]))
            .unwrap();
        wait_until(|| table.get(443).is_some()).await;
        assert!(table.get(80).is_none());
        assert_eq!(
            connector.endpoints(),
            vec![AgentEndpoint::localhost(63100), AgentEndpoint::localhost(63200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_supervisor_recovers_on_start() {
        let agent = FakeAgent::new();
        let (sup, table, _slot) = supervisor(agent.clone());

        sup.start(AgentEndpoint::localhost(63100)).await;
        wait_state(&sup, SupervisorState::Disconnected).await;

        let tx = agent.push_stream();
        tx.send(Ok(vec![TunnelStatus::new(5000, 5000, Visibility::Private)]))
            .unwrap();
        sup.start(AgentEndpoint::localhost(63100)).await;
        wait_until(|| table.get(5000).is_some()).await;
        assert_eq!(sup.status().state, SupervisorState::Streaming);
        assert_eq!(agent.status_calls().len(), 6);
    }

    #[test]
    fn backoff_growth_saturates() {
        assert_eq!(
            next_delay(Duration::from_secs(1), 1.5),
            Duration::from_millis(1500)
        );
        assert_eq!(next_delay(Duration::from_secs(1), 1e300), Duration::MAX);
        assert_eq!(next_delay(Duration::MAX, 2.0), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_multiplier_keeps_retrying_without_panicking() {
        let agent = FakeAgent::new();
        let sup = StreamSupervisor::new(
            FakeConnector::new(agent.clone()),
            Arc::new(TunnelTable::new()),
            Arc::new(AgentSlot::new()),
            BackoffOptions {
                multiplier: 1e300,
                ..BackoffOptions::default()
            },
        );

        sup.start(AgentEndpoint::localhost(63100)).await;
        let mut rx = sup.subscribe();
        let status = rx
            .wait_for(|s| s.attempts == 2 && s.state == SupervisorState::Backoff)
            .await
            .unwrap()
            .clone();
        assert_eq!(status.retry_in_ms, Some(u64::MAX));
        assert_eq!(agent.status_calls().len(), 2);

        sup.stop().await;
        assert_eq!(sup.status().state, SupervisorState::Stopped);
    }
}

//! In-memory agent used by the tunnel tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};

use crate::portbridge::agent::{
    AgentApi, AgentConnector, AgentEndpoint, AgentError, BoxedStatusStream, OpenTunnel,
    OpenedTunnel, StatusStream, TunnelStatus,
};

pub(crate) type StreamEvent = Result<Vec<TunnelStatus>, AgentError>;

/// Scripted agent: each `tunnel_status` call takes the next queued entry; an empty
/// queue or a queued failure behaves like a refused connection.
pub(crate) struct FakeAgent {
    endpoint: AgentEndpoint,
    script: Mutex<VecDeque<Option<mpsc::UnboundedReceiver<StreamEvent>>>>,
    status_calls: Mutex<Vec<Instant>>,
    open_calls: Mutex<Vec<OpenTunnel>>,
    close_calls: Mutex<Vec<u16>>,
    open_error: Mutex<Option<String>>,
}

impl FakeAgent {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_endpoint(AgentEndpoint::localhost(63100))
    }

    pub(crate) fn with_endpoint(endpoint: AgentEndpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            script: Mutex::new(VecDeque::new()),
            status_calls: Mutex::new(Vec::new()),
            open_calls: Mutex::new(Vec::new()),
            close_calls: Mutex::new(Vec::new()),
            open_error: Mutex::new(None),
        })
    }

    /// Queues a stream for the next `tunnel_status` call. Dropping the returned
    /// sender ends the stream cleanly.
    pub(crate) fn push_stream(&self) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Some(rx));
        tx
    }

    pub(crate) fn push_failure(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    pub(crate) fn fail_opens(&self, message: &str) {
        *self.open_error.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn status_calls(&self) -> Vec<Instant> {
        self.status_calls.lock().unwrap().clone()
    }

    pub(crate) fn open_calls(&self) -> Vec<OpenTunnel> {
        self.open_calls.lock().unwrap().clone()
    }

    pub(crate) fn close_calls(&self) -> Vec<u16> {
        self.close_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    async fn tunnel_status(&self) -> Result<BoxedStatusStream, AgentError> {
        self.status_calls.lock().unwrap().push(Instant::now());
        match self.script.lock().unwrap().pop_front().flatten() {
            Some(rx) => Ok(Box::new(FakeStream { rx })),
            None => Err(AgentError::Connect {
                endpoint: self.endpoint.to_string(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            }),
        }
    }

    async fn open_tunnel(&self, req: OpenTunnel) -> Result<OpenedTunnel, AgentError> {
        let remote_port = req.remote_port;
        let local_port = req.local_port.unwrap_or(remote_port);
        self.open_calls.lock().unwrap().push(req);
        if let Some(message) = self.open_error.lock().unwrap().clone() {
            return Err(AgentError::Rejected {
                code: "failed_precondition".into(),
                message,
            });
        }
        Ok(OpenedTunnel {
            remote_port,
            local_port,
        })
    }

    async fn close_tunnel(&self, remote_port: u16) -> Result<(), AgentError> {
        self.close_calls.lock().unwrap().push(remote_port);
        Ok(())
    }
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

#[async_trait]
impl StatusStream for FakeStream {
    async fn next_snapshot(&mut self) -> Result<Option<Vec<TunnelStatus>>, AgentError> {
        match self.rx.recv().await {
            Some(Ok(snapshot)) => Ok(Some(snapshot)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// Hands out the same fake for every endpoint and records what was asked for.
pub(crate) struct FakeConnector {
    agent: Arc<FakeAgent>,
    endpoints: Mutex<Vec<AgentEndpoint>>,
}

impl FakeConnector {
    pub(crate) fn new(agent: Arc<FakeAgent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn endpoints(&self) -> Vec<AgentEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

impl AgentConnector for FakeConnector {
    fn connect(&self, endpoint: &AgentEndpoint) -> Arc<dyn AgentApi> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        self.agent.clone()
    }
}

/// Polls `cond` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::portbridge::agent::{
    AgentApi, AgentConnector, AgentEndpoint, AgentError, BoxedStatusStream, OpenTunnel,
    OpenedTunnel, StatusStream, TunnelStatus,
    protocol::{self, AgentCall, AgentReply, RequestEnvelope},
    token::TokenSource,
};

#[derive(Debug, Clone)]
pub struct AgentClientOptions {
    pub instance_id: String,
    pub workspace_host: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for AgentClientOptions {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            workspace_host: String::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Framed-JSON agent client. Every call uses its own TCP connection; the status
/// stream keeps its connection open until the agent closes it or the stream is
/// dropped.
pub struct AgentClient {
    endpoint: AgentEndpoint,
    opts: AgentClientOptions,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("endpoint", &self.endpoint)
            .field("instance_id", &self.opts.instance_id)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(
        endpoint: AgentEndpoint,
        opts: AgentClientOptions,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            endpoint,
            opts,
            tokens,
        }
    }

    async fn dial(&self) -> Result<TcpStream, AgentError> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let conn = tokio::time::timeout(self.opts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AgentError::Timeout(self.opts.connect_timeout))?
            .map_err(|source| AgentError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        let _ = conn.set_nodelay(true);
        Ok(conn)
    }

    async fn envelope(&self, call: AgentCall) -> Result<RequestEnvelope, AgentError> {
        let token = self
            .tokens
            .token()
            .await
            .map_err(|err| AgentError::Credentials(format!("{err:#}")))?;
        Ok(RequestEnvelope {
            token,
            instance_id: self.opts.instance_id.clone(),
            workspace_host: self.opts.workspace_host.clone(),
            call,
        })
    }

    async fn call(&self, call: AgentCall) -> Result<AgentReply, AgentError> {
        let timeout = self.opts.request_timeout;
        tokio::time::timeout(timeout, self.roundtrip(call))
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
    }

    async fn roundtrip(&self, call: AgentCall) -> Result<AgentReply, AgentError> {
        let env = self.envelope(call).await?;
        let mut conn = self.dial().await?;
        protocol::write_request(&mut conn, &env).await?;
        match protocol::read_reply(&mut conn).await? {
            Some(AgentReply::Error { code, message }) => Err(AgentError::Rejected { code, message }),
            Some(reply) => Ok(reply),
            None => Err(AgentError::Unexpected("connection closed before reply")),
        }
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    async fn tunnel_status(&self) -> Result<BoxedStatusStream, AgentError> {
        let env = self
            .envelope(AgentCall::TunnelStatus { observe: true })
            .await?;
        let mut conn = self.dial().await?;
        protocol::write_request(&mut conn, &env).await?;
        Ok(Box::new(TcpStatusStream { conn }))
    }

    async fn open_tunnel(&self, req: OpenTunnel) -> Result<OpenedTunnel, AgentError> {
        let reply = self
            .call(AgentCall::OpenTunnel {
                remote_port: req.remote_port,
                local_port: req.local_port,
                visibility: req.visibility,
            })
            .await?;
        match reply {
            AgentReply::Opened {
                remote_port,
                local_port,
            } => Ok(OpenedTunnel {
                remote_port,
                local_port,
            }),
            _ => Err(AgentError::Unexpected("expected opened")),
        }
    }

    async fn close_tunnel(&self, remote_port: u16) -> Result<(), AgentError> {
        match self.call(AgentCall::CloseTunnel { remote_port }).await? {
            AgentReply::Closed { .. } => Ok(()),
            _ => Err(AgentError::Unexpected("expected closed")),
        }
    }
}

struct TcpStatusStream {
    conn: TcpStream,
}

#[async_trait]
impl StatusStream for TcpStatusStream {
    async fn next_snapshot(&mut self) -> Result<Option<Vec<TunnelStatus>>, AgentError> {
        match protocol::read_reply(&mut self.conn).await? {
            None => Ok(None),
            Some(AgentReply::Status { tunnels }) => Ok(Some(tunnels)),
            Some(AgentReply::Error { code, message }) => {
                Err(AgentError::Rejected { code, message })
            }
            Some(_) => Err(AgentError::Unexpected("expected status")),
        }
    }
}

/// Connects to agents over TCP using the framed-JSON protocol.
pub struct TcpConnector {
    opts: AgentClientOptions,
    tokens: Arc<dyn TokenSource>,
}

impl TcpConnector {
    pub fn new(opts: AgentClientOptions, tokens: Arc<dyn TokenSource>) -> Self {
        Self { opts, tokens }
    }
}

impl AgentConnector for TcpConnector {
    fn connect(&self, endpoint: &AgentEndpoint) -> Arc<dyn AgentApi> {
        Arc::new(AgentClient::new(
            endpoint.clone(),
            self.opts.clone(),
            self.tokens.clone(),
        ))
    }
}

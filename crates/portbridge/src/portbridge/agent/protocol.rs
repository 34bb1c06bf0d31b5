use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::portbridge::agent::{TunnelStatus, Visibility};

const MAGIC_REQUEST: &[u8; 4] = b"PBRQ"; // PortBridge ReQuest
const MAGIC_REPLY: &[u8; 4] = b"PBRS"; // PortBridge ReSponse
const PROTOCOL_V1: u8 = 1;

pub const MAX_FRAME_JSON_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub workspace_host: String,
    pub call: AgentCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCall {
    TunnelStatus {
        #[serde(default)]
        observe: bool,
    },
    OpenTunnel {
        remote_port: u16,
        #[serde(default)]
        local_port: Option<u16>,
        #[serde(default)]
        visibility: Visibility,
    },
    CloseTunnel {
        remote_port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    Status {
        #[serde(default)]
        tunnels: Vec<TunnelStatus>,
    },
    Opened {
        remote_port: u16,
        local_port: u16,
    },
    Closed {
        remote_port: u16,
    },
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &RequestEnvelope,
) -> Result<(), ProtocolError> {
    write_frame(w, MAGIC_REQUEST, &serde_json::to_vec(req)?).await
}

/// Reads one request frame. `Ok(None)` on a clean EOF before the frame starts.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<RequestEnvelope>, ProtocolError> {
    match read_frame(r, MAGIC_REQUEST).await? {
        Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        None => Ok(None),
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &AgentReply,
) -> Result<(), ProtocolError> {
    write_frame(w, MAGIC_REPLY, &serde_json::to_vec(reply)?).await
}

/// Reads one reply frame. `Ok(None)` on a clean EOF before the frame starts.
pub async fn read_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<AgentReply>, ProtocolError> {
    match read_frame(r, MAGIC_REPLY).await? {
        Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        None => Ok(None),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    magic: &[u8; 4],
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let n: u32 = payload.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_all(magic).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.write_u32(n).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    want: &[u8; 4],
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut magic = [0u8; 4];
    if r.read(&mut magic[..1]).await? == 0 {
        return Ok(None);
    }
    r.read_exact(&mut magic[1..]).await?;
    if &magic != want {
        return Err(ProtocolError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let n = r.read_u32().await?;
    if n > MAX_FRAME_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

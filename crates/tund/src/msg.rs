//! Control-channel messages
//!
//! Newline-delimited JSON, one message per line:
//! ```text
//! {"type":"Auth","payload":{"client_id":null,"user":"demo","version":"1"}}\n
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted message line (64 KB) - stops a client from growing the buffer forever
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Messages exchanged on control and proxy connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// First message of a control connection
    Auth(Auth),
    /// Server answer to [`Auth`]
    AuthResp(AuthResp),
    /// Client asks for a public tunnel
    ReqTunnel(ReqTunnel),
    /// Server answer to [`ReqTunnel`]
    NewTunnel(NewTunnel),
    /// First message of a proxy connection
    RegProxy(RegProxy),
    /// Heartbeat request
    Ping,
    /// Heartbeat answer
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    /// Set when a client reconnects and wants its old identity back
    pub client_id: Option<String>,
    pub user: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResp {
    pub client_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqTunnel {
    pub req_id: String,
    pub protocol: String,
    pub subdomain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTunnel {
    pub req_id: String,
    pub url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegProxy {
    pub client_id: String,
}

/// Read one message. `Ok(None)` means the peer closed the connection.
pub async fn read_msg<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_MESSAGE_SIZE + 1)
        .read_line(&mut line)
        .await
        .context("Failed to read message")?;

    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n as u64 > MAX_MESSAGE_SIZE {
            bail!("Message exceeds {} bytes", MAX_MESSAGE_SIZE);
        }
        bail!("Connection closed mid-message");
    }

    let msg = serde_json::from_str(line.trim_end()).context("Malformed message")?;
    Ok(Some(msg))
}

/// Write one message followed by a newline
pub async fn write_msg<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

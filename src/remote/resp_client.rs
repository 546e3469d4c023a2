//! Minimal RESP client for destination nodes
//!
//! Only what the transfer and redirect paths need: encode one command as a
//! flat array of bulk strings, decode one reply. Inline-protocol, pub/sub,
//! and pipelining are out of scope.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::error::{MagnetiteError, Result};
use crate::protocol::Reply;

use super::{Connector, DestinationConn};

pub struct RespConnection {
    stream: BufStream<TcpStream>,
}

impl RespConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    async fn write_command(&mut self, cmd: &str, args: &[Bytes]) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
        buf.extend_from_slice(format!("${}\r\n", cmd.len()).as_bytes());
        buf.extend_from_slice(cmd.as_bytes());
        buf.extend_from_slice(b"\r\n");
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.stream.read_until(b'\n', &mut line).await?;
        if !line.ends_with(b"\r\n") {
            return Err(MagnetiteError::Protocol(
                "reply line not CRLF terminated".to_string(),
            ));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    // Boxed for the recursive array case. The line is kept as raw bytes
    // until the type byte is known; a corrupt peer must surface as a
    // protocol error, never a slicing panic.
    fn read_reply(&mut self) -> Pin<Box<dyn Future<Output = Result<Reply>> + Send + '_>> {
        Box::pin(async move {
            let line = self.read_line().await?;
            let Some((&kind, rest)) = line.split_first() else {
                return Err(MagnetiteError::Protocol("empty reply line".to_string()));
            };
            match kind {
                b'+' => Ok(Reply::Status(line_text(rest)?.to_string())),
                b'-' => Err(MagnetiteError::Remote(line_text(rest)?.to_string())),
                b':' => {
                    let rest = line_text(rest)?;
                    let v = rest.parse::<i64>().map_err(|_| {
                        MagnetiteError::Protocol(format!("bad integer reply: {rest}"))
                    })?;
                    Ok(Reply::Integer(v))
                }
                b'$' => {
                    let rest = line_text(rest)?;
                    let len = rest.parse::<i64>().map_err(|_| {
                        MagnetiteError::Protocol(format!("bad bulk length: {rest}"))
                    })?;
                    if len < 0 {
                        return Ok(Reply::Nil);
                    }
                    let mut payload = vec![0u8; len as usize + 2];
                    self.stream.read_exact(&mut payload).await?;
                    if !payload.ends_with(b"\r\n") {
                        return Err(MagnetiteError::Protocol(
                            "bulk payload not CRLF terminated".to_string(),
                        ));
                    }
                    payload.truncate(payload.len() - 2);
                    Ok(Reply::Bulk(Bytes::from(payload)))
                }
                b'*' => {
                    let rest = line_text(rest)?;
                    let len = rest.parse::<i64>().map_err(|_| {
                        MagnetiteError::Protocol(format!("bad array length: {rest}"))
                    })?;
                    if len < 0 {
                        return Ok(Reply::Nil);
                    }
                    let mut items = Vec::with_capacity(len as usize);
                    for _ in 0..len {
                        items.push(self.read_reply().await?);
                    }
                    Ok(Reply::Array(items))
                }
                other => Err(MagnetiteError::Protocol(format!(
                    "unknown reply type byte: 0x{other:02x}"
                ))),
            }
        })
    }
}

fn line_text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|_| MagnetiteError::Protocol("reply line not UTF-8".to_string()))
}

#[async_trait]
impl DestinationConn for RespConnection {
    async fn call(&mut self, cmd: &str, args: &[Bytes]) -> Result<Reply> {
        self.write_command(cmd, args).await?;
        self.read_reply().await
    }
}

/// Dials TCP connections to one destination address.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn DestinationConn>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| MagnetiteError::Connection(format!("{}: {e}", self.addr)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| MagnetiteError::Connection(e.to_string()))?;
        Ok(Box::new(RespConnection::new(stream)))
    }
}

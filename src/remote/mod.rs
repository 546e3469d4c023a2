//! Outbound connections to destination nodes
//!
//! Migration transfer and redirect proxying both talk to a peer node over
//! its client protocol. [`Connector`] abstracts dialing, [`DestinationConn`]
//! a single request/response connection, and [`ConnectionPool`] keeps a
//! bounded free list per destination so worker fan-out does not redial on
//! every page.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::protocol::Reply;

pub mod resp_client;

#[cfg(test)]
pub(crate) mod mock;

pub use resp_client::TcpConnector;

/// Script the destination proxy evaluates to re-route a command by its
/// key's hash tag. The entire command is carried in KEYS so the proxy
/// computes the slot from the tagged key before dispatching.
pub const ROUTING_SCRIPT: &str = "return redis.call(unpack(KEYS))";

/// One live connection to a destination node.
#[async_trait]
pub trait DestinationConn: Send {
    /// Issue `cmd args...` and decode the single reply. A protocol-level
    /// error reply from the peer surfaces as `Err(Remote)`.
    async fn call(&mut self, cmd: &str, args: &[Bytes]) -> Result<Reply>;
}

/// Dials new connections to one destination.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DestinationConn>>;
}

/// Bounded pool of idle connections to one destination.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn DestinationConn>>>,
    max_idle: usize,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, max_idle: usize) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Check out a connection, dialing when the free list is empty. The
    /// returned handle parks the connection back on drop.
    pub async fn get(&self) -> Result<PooledConn<'_>> {
        let parked = self.idle.lock().pop();
        let conn = match parked {
            Some(conn) => conn,
            None => {
                debug!("dialing new destination connection");
                self.connector.connect().await?
            }
        };
        Ok(PooledConn {
            conn: Some(conn),
            pool: self,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn park(&self, conn: Box<dyn DestinationConn>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

/// Checked-out connection; returns to its pool's free list on drop.
pub struct PooledConn<'a> {
    conn: Option<Box<dyn DestinationConn>>,
    pool: &'a ConnectionPool,
}

impl PooledConn<'_> {
    pub fn as_mut(&mut self) -> &mut dyn DestinationConn {
        // Only `drop` takes the connection out.
        match self.conn.as_mut() {
            Some(c) => c.as_mut(),
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.park(conn);
        }
    }
}

/// Issue `cmd key args...` against the destination, indirecting through
/// [`ROUTING_SCRIPT`] when the key is hash-tagged so the destination proxy
/// routes by the tag rather than by the verb's literal key.
pub async fn call_routed(
    conn: &mut dyn DestinationConn,
    tagged: bool,
    cmd: &str,
    args: &[Bytes],
) -> Result<Reply> {
    if !tagged {
        return conn.call(cmd, args).await;
    }
    let mut eval_args = Vec::with_capacity(args.len() + 3);
    eval_args.push(Bytes::from_static(ROUTING_SCRIPT.as_bytes()));
    eval_args.push(Bytes::from((args.len() + 1).to_string()));
    eval_args.push(Bytes::from(cmd.to_string()));
    eval_args.extend_from_slice(args);
    conn.call("eval", &eval_args).await
}

//! Cache client used by the prober.
//!
//! `CacheClient` is the seam between the probe and the cache service.
//! `MemcacheClient` implements it over a small pool of memcached text
//! protocol connections.

use crate::protocol::{encode_get, parse_reply, Item, ParseError, ParseResult, Reply};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// A key-value cache that can be asked for several keys at once.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Fetch `keys`. Keys that are not cached are absent from the result.
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Item>, ClientError>;
}

/// Errors from talking to the cache service
#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Protocol(ParseError),
    /// Server replied `ERROR`
    UnknownCommand,
    /// Server replied `CLIENT_ERROR`
    Rejected(String),
    /// Server replied `SERVER_ERROR`
    Server(String),
    /// Connection closed in the middle of a reply
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ClientError::UnknownCommand => write!(f, "Server did not recognize the command"),
            ClientError::Rejected(msg) => write!(f, "Client error: {}", msg),
            ClientError::Server(msg) => write!(f, "Server error: {}", msg),
            ClientError::Closed => write!(f, "Connection closed by server"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// A single memcached connection.
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Send `get` for `keys` and read the full reply.
    pub async fn get_multi(&mut self, keys: &[String]) -> Result<Vec<Item>, ClientError> {
        let mut request = BytesMut::new();
        encode_get(keys, &mut request);
        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        match self.read_reply().await? {
            Reply::Values(items) => {
                for item in &items {
                    trace!(key = %item.key, flags = item.flags, bytes = item.value.len(), "Hit");
                }
                Ok(items)
            }
            Reply::Error => Err(ClientError::UnknownCommand),
            Reply::ClientError(msg) => Err(ClientError::Rejected(msg)),
            Reply::ServerError(msg) => Err(ClientError::Server(msg)),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        loop {
            match parse_reply(&self.buffer) {
                ParseResult::Complete(reply, consumed) => {
                    self.buffer.advance(consumed);
                    trace!(?reply, "Received reply");
                    return Ok(reply);
                }
                ParseResult::Error(ParseError::Incomplete) => {
                    let n = self.stream.read_buf(&mut self.buffer).await?;
                    if n == 0 {
                        return Err(ClientError::Closed);
                    }
                }
                ParseResult::Error(e) => return Err(ClientError::Protocol(e)),
            }
        }
    }
}

/// Pooled memcached client.
///
/// At most `pool_size` connections exist at once. A connection goes back to
/// the idle list only after a complete reply, so a call that fails or is
/// dropped mid-read takes its connection with it.
pub struct MemcacheClient {
    addr: String,
    idle: Mutex<Vec<Connection<TcpStream>>>,
    slots: Arc<Semaphore>,
}

impl MemcacheClient {
    pub fn new(addr: impl Into<String>, pool_size: usize) -> Self {
        MemcacheClient {
            addr: addr.into(),
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            slots: Arc::new(Semaphore::new(pool_size)),
        }
    }

    fn take_idle(&self) -> Option<Connection<TcpStream>> {
        self.idle.lock().ok()?.pop()
    }

    fn put_idle(&self, conn: Connection<TcpStream>) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    async fn connect(&self) -> Result<Connection<TcpStream>, ClientError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(server = %self.addr, "Opened cache connection");
        Ok(Connection::new(stream))
    }

    /// Number of connections currently parked in the pool
    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CacheClient for MemcacheClient {
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Item>, ClientError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ClientError::Closed)?;

        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let items = conn.get_multi(keys).await?;
        self.put_idle(conn);
        Ok(items)
    }
}

//! Point-to-point streams between nodes.
//!
//! Each stream carries one request: the opener writes the protocol id as
//! the first line, then the request line; the acceptor answers with one
//! line and closes. Peers are identified by their socket address.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CREATE_ACCOUNT_PROTOCOL: &str = "/create-account";
pub const GET_BALANCE_PROTOCOL: &str = "/get-balance";
pub const SEND_BALANCE_PROTOCOL: &str = "/send-balance";
pub const GET_TRANS_PROTOCOL: &str = "/get-trans";
pub const SYNC_PROTOCOL: &str = "/blockchain/sync/1.0.0";

pub const CREATE_ACCOUNT_TOKEN: &str = "create_account";
pub const SYNC_REQUEST_TOKEN: &str = "sync_request";

/// Longest protocol header or request line accepted.
pub const MAX_REQUEST_LINE: u64 = 1 << 20;
/// Longest response line accepted; sync snapshots carry a whole store.
pub const MAX_RESPONSE_LINE: u64 = 256 << 20;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection to {0} timed out")]
    ConnectionTimeout(String),
    #[error("Connection closed before a full line was received")]
    ConnectionClosed,
    #[error("Line exceeds {0} bytes")]
    LineTooLong(u64),
    #[error("No handler for protocol {0}")]
    UnknownProtocol(String),
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Read one newline-terminated line of at most `limit` bytes, trimmed.
pub async fn read_line<R>(reader: &mut R, limit: u64) -> Result<String, NetworkError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    let n = (&mut *reader).take(limit).read_line(&mut line).await?;
    if n == 0 {
        return Err(NetworkError::ConnectionClosed);
    }
    if !line.ends_with('\n') && n as u64 >= limit {
        return Err(NetworkError::LineTooLong(limit));
    }
    Ok(line.trim().to_string())
}

/// Write `line` followed by a newline and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Send one request line on `protocol` and return the response line.
pub async fn request<H>(host: &H, peer: &str, protocol: &str, payload: &str) -> Result<String, NetworkError>
where
    H: PeerHost + ?Sized,
{
    let stream = host.open_stream(peer, protocol).await?;
    let mut stream = BufReader::new(stream);
    write_line(stream.get_mut(), payload).await?;
    read_line(&mut stream, MAX_RESPONSE_LINE).await
}

/// Outbound side of the transport.
#[async_trait]
pub trait PeerHost: Send + Sync {
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<BoxStream, NetworkError>;

    /// Connect, then disconnect; true when the connection succeeded.
    async fn is_reachable(&self, peer: &str) -> bool;
}

/// Serves streams accepted for a protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, protocol: &str, stream: BoxStream);
}

/// TCP transport: streams are plain connections prefixed by a protocol line.
pub struct TcpHost {
    connect_timeout: Duration,
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
}

impl TcpHost {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Route streams opened for `protocol` to `handler`.
    pub async fn on_stream(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.write().await.insert(protocol.to_string(), handler);
    }

    /// Accept connections until the listener fails; each stream is served
    /// on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), NetworkError> {
        info!(addr = %listener.local_addr()?, "accepting streams");
        loop {
            let (socket, addr) = listener.accept().await?;
            let host = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = host.dispatch(socket, addr).await {
                    debug!(%addr, error = %e, "stream dropped");
                }
            });
        }
    }

    async fn dispatch(&self, socket: TcpStream, addr: SocketAddr) -> Result<(), NetworkError> {
        let mut stream = BufReader::new(socket);
        let protocol = read_line(&mut stream, MAX_REQUEST_LINE).await?;
        let handler = self.handlers.read().await.get(&protocol).cloned();
        match handler {
            Some(handler) => {
                debug!(%addr, %protocol, "stream accepted");
                handler.handle(&protocol, Box::new(stream)).await;
                Ok(())
            }
            None => {
                warn!(%addr, %protocol, "no handler registered");
                Err(NetworkError::UnknownProtocol(protocol))
            }
        }
    }

    async fn connect(&self, peer: &str) -> Result<TcpStream, NetworkError> {
        timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| NetworkError::ConnectionTimeout(peer.to_string()))?
            .map_err(NetworkError::from)
    }
}

#[async_trait]
impl PeerHost for TcpHost {
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<BoxStream, NetworkError> {
        let mut stream = self.connect(peer).await?;
        write_line(&mut stream, protocol).await?;
        Ok(Box::new(stream))
    }

    async fn is_reachable(&self, peer: &str) -> bool {
        match self.connect(peer).await {
            Ok(_stream) => true,
            Err(e) => {
                debug!(peer, error = %e, "peer unreachable");
                false
            }
        }
    }
}

//! The chunked differential transfer protocol.
//!
//! One long-lived TCP connection carries framed requests from the initiator
//! (this server, pulling) and an unframed typed response stream from the
//! peer (the backup client, serving). [`session`] implements the pulling
//! engine, [`peer`] the serving side, [`wire`] the codec between them.

pub mod loopback;
pub mod peer;
pub mod session;
pub mod throttle;
pub mod wire;

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Maximum outstanding block requests per session.
pub const QUEUED_BLOCKS_HIGH: usize = 64;
/// Refill threshold for the request window.
pub const QUEUED_BLOCKS_LOW: usize = 8;
/// Reconnect attempts before a transfer gives up.
pub const RECONNECT_TRIES: u32 = 50;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("connection lost")]
    ConnLost,
    #[error("strong hash mismatch after out-of-band retry")]
    Hash,
    #[error("peer silent past the idle deadline")]
    Timeout,
    #[error("peer could not open the file")]
    CannotOpen,
    #[error("peer lost its base directory")]
    BaseDirLost,
    #[error("peer read error")]
    ReadError,
    #[error("peer error codes {code1}/{code2}")]
    Peer { code1: u32, code2: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("stream corrupt: {0}")]
    Corrupt(String),
    #[error("destination out of space")]
    NoSpace,
    #[error("cancelled")]
    Cancelled,
}

/// Anything a session can run over: TCP in production, duplex pipes in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Supplies fresh connections for reconnects and out-of-band block loads.
pub trait Reconnector: Send {
    type Transport: Transport;

    fn connect(&mut self) -> impl std::future::Future<Output = io::Result<Self::Transport>> + Send;
}

/// Dials the long-lived transfer connection to a client's agent.
pub struct TcpReconnector {
    addr: String,
}

impl TcpReconnector {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpReconnector { addr: addr.into() }
    }
}

impl Reconnector for TcpReconnector {
    type Transport = tokio::net::TcpStream;

    async fn connect(&mut self) -> io::Result<Self::Transport> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Produces reconnectors for a client address; the coordinator's seam
/// between scheduling and transport.
pub trait ClientConnector: Send + Sync + 'static {
    type R: Reconnector + Send + 'static;

    fn reconnector(&self, addr: &str) -> Self::R;
}

pub struct TcpConnector;

impl ClientConnector for TcpConnector {
    type R = TcpReconnector;

    fn reconnector(&self, addr: &str) -> TcpReconnector {
        TcpReconnector::new(addr)
    }
}

/// Receives out-of-order block writes; implemented by the VHD writer for
/// image backups and by a no-op for plain file transfers.
pub trait BlockSink: Send {
    fn write_at(
        &mut self,
        offset: i64,
        data: &[u8],
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// The region is known to be zeros; the sink may hole-punch it.
    fn punch(
        &mut self,
        offset: i64,
        len: i64,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Placeholder sink for sessions that write files, not images.
pub struct NoSink;

impl BlockSink for NoSink {
    async fn write_at(&mut self, _offset: i64, _data: &[u8]) -> io::Result<()> {
        unreachable!("file transfers never route through a block sink")
    }

    async fn punch(&mut self, _offset: i64, _len: i64) -> io::Result<()> {
        unreachable!("file transfers never route through a block sink")
    }
}

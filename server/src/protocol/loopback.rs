//! In-memory transport backend: every connection is a duplex pipe to a
//! freshly spawned in-process peer serving a directory. Tests and the
//! loopback tooling drive the full protocol through this without sockets.

use super::peer::{self, PeerConfig};
use super::{ClientConnector, Reconnector};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct LoopbackReconnector {
    root: PathBuf,
    cfg: PeerConfig,
    connects: Arc<AtomicU32>,
}

impl LoopbackReconnector {
    pub fn new(root: &Path, cfg: PeerConfig) -> Self {
        LoopbackReconnector {
            root: root.to_path_buf(),
            cfg,
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared dial counter; reconnect tests assert on it after the
    /// reconnector has been moved into a driver.
    pub fn connect_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.connects)
    }
}

impl Reconnector for LoopbackReconnector {
    type Transport = tokio::io::DuplexStream;

    async fn connect(&mut self) -> io::Result<Self::Transport> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        tokio::spawn(peer::serve(theirs, self.root.clone(), self.cfg.clone()));
        Ok(ours)
    }
}

/// Connector whose "addresses" are directories served in-process.
pub struct LoopbackConnector {
    pub cfg: PeerConfig,
}

impl LoopbackConnector {
    pub fn new(cfg: PeerConfig) -> Self {
        LoopbackConnector { cfg }
    }
}

impl ClientConnector for LoopbackConnector {
    type R = LoopbackReconnector;

    fn reconnector(&self, addr: &str) -> LoopbackReconnector {
        LoopbackReconnector::new(Path::new(addr), self.cfg.clone())
    }
}

//! Same-process transport
//!
//! Used when the lock manager is not shared with other processes. Every send
//! is dropped and nothing is ever received.

use super::{Inbound, Topology, Transport, TransportEvent};
use crate::message::Message;
use canopy_core::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// No-op transport for a standalone peer
#[derive(Debug)]
pub struct LocalTransport {
    // Held so the inbound receiver stays open until close()
    keepalive: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl LocalTransport {
    /// Create the transport and its (silent) inbound receiver
    pub fn new() -> (Self, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LocalTransport {
                keepalive: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl Transport for LocalTransport {
    fn send(&self, _message: Message) -> Result<()> {
        Ok(())
    }

    fn topology(&self) -> Topology {
        Topology::Standalone
    }

    fn close(&self) {
        self.keepalive.lock().take();
    }
}

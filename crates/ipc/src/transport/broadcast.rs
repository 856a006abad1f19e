//! In-process broadcast transport
//!
//! Models participants that can only broadcast to each other (browser tabs
//! sharing a channel name, tasks of one test). A [`BroadcastHub`] owns one
//! `tokio::sync::broadcast` channel per database name; every participant sees
//! every message and drops the unicast ones meant for someone else.
//!
//! The lowest peer id acts as master. There is no handover of lock state when
//! that changes.

use super::{Inbound, Topology, Transport, TransportEvent};
use crate::message::Message;
use canopy_core::{LockError, PeerId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Registry of named broadcast channels
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
}

impl BroadcastHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the channel for `name` as `peer`
    ///
    /// Must be called from within a tokio runtime.
    pub fn join(&self, name: &str, peer: PeerId) -> (BroadcastTransport, Inbound) {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(receiver, tx, peer.clone(), name.to_string()));

        (
            BroadcastTransport {
                peer,
                sender,
                forwarder: Mutex::new(Some(forwarder)),
            },
            rx,
        )
    }

    /// Number of participants currently joined to `name`
    pub fn participants(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map_or(0, |sender| sender.receiver_count())
    }
}

async fn forward(
    mut receiver: broadcast::Receiver<Message>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    peer: PeerId,
    channel: String,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                if !message.is_for(&peer) {
                    continue;
                }
                if tx.send(TransportEvent::Message(message)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "canopy::peer", %peer, %channel, skipped, "Broadcast receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = tx.send(TransportEvent::Disconnected(None));
                break;
            }
        }
    }
    debug!(target: "canopy::peer", %peer, %channel, "Broadcast forwarder stopped");
}

/// One participant's handle on a hub channel
#[derive(Debug)]
pub struct BroadcastTransport {
    peer: PeerId,
    sender: broadcast::Sender<Message>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for BroadcastTransport {
    fn send(&self, message: Message) -> Result<()> {
        if self.forwarder.lock().is_none() {
            return Err(LockError::transport("broadcast transport closed"));
        }
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| LockError::transport("no broadcast receivers"))
    }

    fn topology(&self) -> Topology {
        Topology::LowestId
    }

    fn close(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
            debug!(target: "canopy::peer", peer = %self.peer, "Broadcast transport closed");
        }
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.close();
    }
}

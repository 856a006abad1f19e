//! Message channels between coordination peers
//!
//! A transport moves [`Message`]s between participants of one database. It
//! is handed out together with an [`Inbound`] receiver that yields incoming
//! messages and disconnect notices in arrival order.
//!
//! | Transport | Scope | Master selection |
//! |-----------|-------|------------------|
//! | [`LocalTransport`] | one process, no peers | self |
//! | [`SocketTransport`] | processes sharing a database file | the broker's peer |
//! | [`BroadcastTransport`] | participants of one [`BroadcastHub`] | lowest peer id |

use crate::message::Message;
use canopy_core::{PeerId, Result};
use tokio::sync::mpsc;

mod broadcast;
mod local;
#[cfg(unix)]
mod socket;

pub use broadcast::{BroadcastHub, BroadcastTransport};
pub use local::LocalTransport;
#[cfg(unix)]
pub use socket::SocketTransport;

/// How a transport decides which participant is master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// No other participants; the local peer is master
    Standalone,
    /// A known peer is master for the transport's lifetime
    Fixed {
        /// Master id
        master: PeerId,
    },
    /// The lowest id among known peers (including self) is master
    LowestId,
}

/// Something received from a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An incoming message
    Message(Message),
    /// A peer (`Some`) or the whole channel (`None`) went away
    Disconnected(Option<PeerId>),
}

/// Receiving half handed out with a transport
pub type Inbound = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound side of a message channel
pub trait Transport: Send + Sync + 'static {
    /// Queue a message for delivery
    ///
    /// Returns once the message is handed to the channel, not when it is
    /// received.
    fn send(&self, message: Message) -> Result<()>;

    /// Master selection rule
    fn topology(&self) -> Topology;

    /// Stop sending and receiving; the inbound receiver ends afterwards
    fn close(&self);
}

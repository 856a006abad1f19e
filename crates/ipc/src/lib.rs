//! Multi-process coordination for the Canopy lock service
//!
//! One participant per database is the master and owns the authoritative
//! [`LockManager`](canopy_concurrency::LockManager); every other participant
//! is a worker that forwards lock operations to it as JSON messages.
//!
//! - Message: Wire envelope and payloads
//! - Codec: Length-prefixed JSON frames for stream transports
//! - Transport: Local no-op, Unix socket broker, in-process broadcast hub
//! - CoordinationPeer: Master/worker state machine, lock proxying and event
//!   relay

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod message;
pub mod peer;
pub mod transport;

#[cfg(unix)]
pub mod broker;

#[cfg(unix)]
pub use broker::{socket_path_for, Broker};
pub use codec::{CodecError, MAX_FRAME_LEN};
pub use message::{Body, ChangeEvent, LockGrant, Message, MoveTarget, Reply, RequestId, Subscription};
pub use peer::{CoordinationPeer, Notification, PeerLock, PeerState, RemoteEvent, RequestHandler};
#[cfg(unix)]
pub use transport::SocketTransport;
pub use transport::{
    BroadcastHub, BroadcastTransport, Inbound, LocalTransport, Topology, Transport, TransportEvent,
};

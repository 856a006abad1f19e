//! Unix domain socket client of a [`Broker`](crate::Broker)
//!
//! The broker greets every connection with the master's `hello`;
//! [`SocketTransport::connect`] waits for it to learn who the master is and
//! fails fast if it does not arrive. After that one reader task turns frames
//! into [`TransportEvent`]s and one writer task drains the outbound queue.

use super::{Inbound, Topology, Transport, TransportEvent};
use crate::codec::{read_message, write_message};
use crate::message::{Body, Message};
use canopy_core::{LockError, PeerId, Result};
use parking_lot::Mutex;
use std::path::Path as FsPath;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Connection to the broker of one database file
#[derive(Debug)]
pub struct SocketTransport {
    master: PeerId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Connect to the broker socket at `socket`
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] if the socket cannot be reached or
    /// the master's greeting does not arrive within `timeout`.
    pub async fn connect(socket: &FsPath, timeout: Duration) -> Result<(Self, Inbound)> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            LockError::transport(format!("cannot reach broker at {}: {}", socket.display(), e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let greeting = match tokio::time::timeout(timeout, read_message(&mut reader)).await {
            Ok(Ok(Some(message))) if message.body == Body::Hello => message,
            Ok(Ok(Some(message))) => {
                return Err(LockError::transport(format!(
                    "broker greeted with {} instead of hello",
                    message.body.kind()
                )))
            }
            Ok(Ok(None)) => return Err(LockError::transport("broker closed the connection")),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(LockError::transport(format!(
                    "no hello from master within {timeout:?}"
                )))
            }
        };
        let master = greeting.from.clone();
        debug!(target: "canopy::peer", %master, socket = %socket.display(), "Connected to broker");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        // The greeting also introduces the master to the local peer
        let _ = event_tx.send(TransportEvent::Message(greeting));

        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if event_tx.send(TransportEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(target: "canopy::peer", error = %e, "Broker connection failed");
                        break;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Disconnected(None));
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    error!(target: "canopy::peer", error = %e, "Failed to write to broker");
                    break;
                }
            }
        });

        Ok((
            SocketTransport {
                master,
                outbound: Mutex::new(Some(out_tx)),
                reader: Mutex::new(Some(reader_task)),
            },
            event_rx,
        ))
    }

    /// The master announced by the broker
    pub fn master(&self) -> &PeerId {
        &self.master
    }
}

impl Transport for SocketTransport {
    fn send(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(LockError::transport("socket transport closed"));
        };
        tx.send(message)
            .map_err(|_| LockError::transport("broker connection lost"))
    }

    fn topology(&self) -> Topology {
        Topology::Fixed {
            master: self.master.clone(),
        }
    }

    fn close(&self) {
        // Dropping the sender lets the writer flush what is queued and exit
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

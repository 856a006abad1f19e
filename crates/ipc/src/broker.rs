//! Socket broker for one database file
//!
//! The first process to open a database binds `<db file>.canopy.sock` and
//! hosts the master peer in-process. Later processes connect as workers via
//! [`CoordinationPeer::connect`]. The broker only routes messages:
//!
//! - `to` = master goes to the hosted master
//! - `to` = worker goes to that worker's connection
//! - broadcasts go to every connection except the sender's, plus the master
//!
//! A connection is registered under the `from` of its first frame. When it
//! closes, the broker announces a `bye` on the worker's behalf so the master
//! drops everything that worker held.

use crate::codec::{read_message, write_message};
use crate::message::{Body, Message};
use crate::peer::CoordinationPeer;
use crate::transport::{Topology, Transport, TransportEvent};
use canopy_core::{CanopyConfig, LockError, PeerId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Suffix appended to the database file name
pub const SOCKET_SUFFIX: &str = ".canopy.sock";

/// Socket path of the broker for `db_file`
pub fn socket_path_for(db_file: &FsPath) -> PathBuf {
    let mut name = db_file.as_os_str().to_owned();
    name.push(SOCKET_SUFFIX);
    PathBuf::from(name)
}

struct Router {
    master: PeerId,
    master_tx: mpsc::UnboundedSender<TransportEvent>,
    conns: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Message>>>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    fn route(&self, message: Message) {
        match &message.to {
            Some(to) if *to == self.master => self.to_master(message),
            Some(to) => match self.conns.lock().get(to) {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => {
                    debug!(target: "canopy::broker", %to, kind = message.body.kind(), "Dropping message for unknown peer")
                }
            },
            None => {
                for (peer, tx) in self.conns.lock().iter() {
                    if *peer != message.from {
                        let _ = tx.send(message.clone());
                    }
                }
                if message.from != self.master {
                    self.to_master(message);
                }
            }
        }
    }

    fn to_master(&self, message: Message) {
        if self.master_tx.send(TransportEvent::Message(message)).is_err() {
            debug!(target: "canopy::broker", "Master stopped; message dropped");
        }
    }
}

/// Transport of the master hosted inside the broker
struct RouterTransport {
    router: Arc<Router>,
    closed: AtomicBool,
}

impl Transport for RouterTransport {
    fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LockError::transport("broker transport closed"));
        }
        self.router.route(message);
        Ok(())
    }

    fn topology(&self) -> Topology {
        Topology::Fixed {
            master: self.router.master.clone(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Running broker: the socket listener plus the hosted master
pub struct Broker {
    master: CoordinationPeer,
    router: Arc<Router>,
    socket_path: PathBuf,
    accept: JoinHandle<()>,
}

impl Broker {
    /// Bind the broker socket for `db_file` and start the master
    ///
    /// A socket file left behind by a dead broker is removed first.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] if another broker is already serving the
    /// file, [`LockError::Io`] if the socket cannot be created.
    pub async fn bind(db_file: &FsPath, config: CanopyConfig) -> Result<Self> {
        let socket_path = socket_path_for(db_file);
        if socket_path.exists() {
            if UnixStream::connect(&socket_path).await.is_ok() {
                return Err(LockError::transport(format!(
                    "a broker is already serving {}",
                    socket_path.display()
                )));
            }
            warn!(target: "canopy::broker", socket = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let id = PeerId::generate();
        let (master_tx, master_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let router = Arc::new(Router {
            master: id.clone(),
            master_tx,
            conns: Mutex::new(HashMap::new()),
            shutdown,
        });
        let transport = RouterTransport {
            router: Arc::clone(&router),
            closed: AtomicBool::new(false),
        };

        let master = match CoordinationPeer::start(id, config, transport, master_rx).await {
            Ok(master) => master,
            Err(e) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(e);
            }
        };
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&router)));
        info!(
            target: "canopy::broker",
            socket = %socket_path.display(),
            master = %master.id(),
            "Broker listening"
        );

        Ok(Broker {
            master,
            router,
            socket_path,
            accept,
        })
    }

    /// The hosted master peer
    pub fn master(&self) -> &CoordinationPeer {
        &self.master
    }

    /// Path of the bound socket
    pub fn socket_path(&self) -> &FsPath {
        &self.socket_path
    }

    /// Number of connected workers
    pub fn connections(&self) -> usize {
        self.router.conns.lock().len()
    }

    /// Stop the master, disconnect every worker and remove the socket file
    pub async fn shutdown(self) -> Result<()> {
        self.master.exit().await?;
        self.router.shutdown.send_replace(true);
        if let Err(e) = self.accept.await {
            if !e.is_cancelled() {
                error!(target: "canopy::broker", error = %e, "Accept loop panicked");
            }
        }
        self.router.conns.lock().clear();

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(target: "canopy::broker", socket = %self.socket_path.display(), "Broker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("socket_path", &self.socket_path)
            .field("master", &self.master.id())
            .finish()
    }
}

async fn accept_loop(listener: UnixListener, router: Arc<Router>) {
    let mut shutdown = router.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!(target: "canopy::broker", "Connection accepted");
                    tokio::spawn(serve(Arc::clone(&router), stream));
                }
                Err(e) => {
                    warn!(target: "canopy::broker", error = %e, "Accept failed");
                }
            },
        }
    }
}

async fn serve(router: Arc<Router>, stream: UnixStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    // Greet with the master's hello so the worker learns who it is
    let _ = tx.send(Message::broadcast(router.master.clone(), Body::Hello));

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                debug!(target: "canopy::broker", error = %e, "Connection write failed");
                break;
            }
        }
    });

    let mut shutdown = router.shutdown.subscribe();
    let mut peer: Option<PeerId> = None;
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = read_message(&mut reader) => read,
        };
        match read {
            Ok(Some(message)) => {
                match &peer {
                    None => {
                        debug!(target: "canopy::broker", peer = %message.from, "Connection registered");
                        router
                            .conns
                            .lock()
                            .insert(message.from.clone(), tx.clone());
                        peer = Some(message.from.clone());
                    }
                    Some(id) if *id != message.from => {
                        warn!(target: "canopy::broker", peer = %id, claimed = %message.from, "Dropping frame with foreign sender");
                        continue;
                    }
                    Some(_) => {}
                }
                router.route(message);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(target: "canopy::broker", error = %e, "Connection read failed");
                break;
            }
        }
    }

    if let Some(peer) = peer {
        router.conns.lock().remove(&peer);
        if !*shutdown.borrow() {
            info!(target: "canopy::broker", %peer, "Connection closed");
            router.route(Message::broadcast(peer, Body::Bye));
        }
    }
    drop(tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_socket_path_appends_suffix() {
        let path = socket_path_for(FsPath::new("/data/app.db"));
        assert_eq!(path, PathBuf::from("/data/app.db.canopy.sock"));
    }

    #[tokio::test]
    async fn test_second_broker_is_refused() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        let broker = Broker::bind(&db, CanopyConfig::default()).await.unwrap();
        assert!(broker.master().is_master());
        assert!(broker.socket_path().exists());

        let err = Broker::bind(&db, CanopyConfig::default()).await.unwrap_err();
        assert!(matches!(err, LockError::Transport(_)));

        let socket = broker.socket_path().to_path_buf();
        broker.shutdown().await.unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        let socket = socket_path_for(&db);
        // leaves the socket file behind with nobody listening
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let broker = Broker::bind(&db, CanopyConfig::default()).await.unwrap();
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_greeted_with_master_hello() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        let broker = Broker::bind(&db, CanopyConfig::default()).await.unwrap();

        let mut stream = UnixStream::connect(broker.socket_path()).await.unwrap();
        let hello = read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(hello.body, Body::Hello);
        assert_eq!(&hello.from, broker.master().id());

        drop(stream);
        broker.shutdown().await.unwrap();
    }
}

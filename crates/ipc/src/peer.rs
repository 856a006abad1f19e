//! Coordination peer
//!
//! A [`CoordinationPeer`] is one participant of a shared database. The master
//! serves lock operations from its own [`LockManager`]; a worker forwards them
//! to the master and awaits the reply. Both relay change events to the peers
//! that subscribed to them.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──► Announcing ──► Active ──► Exiting ──► Stopped
//!                  │
//!                  └─ worker without a master hello ──► Stopped (error)
//! ```
//!
//! ## Remote transactions
//!
//! The master files a worker's locks under `"<peer id>:<tid>"` so that tids
//! allocated independently by different processes never cooperate by
//! accident, and so everything a departed peer held can be dropped with
//! [`LockManager::release_tid`].
//!
//! If the master goes away uncleanly, a worker's pending request fails only
//! once the transport reports the disconnect. There is no re-election.

use crate::message::{
    Body, ChangeEvent, LockGrant, LockRequestData, Message, MoveData, MoveTarget, Reply,
    RequestId, Subscription, UnlockData,
};
use crate::transport::{Inbound, LocalTransport, Topology, Transport, TransportEvent};
use canopy_concurrency::{LockManager, LockOptions, PathLock};
use canopy_core::{
    CanopyConfig, LockError, LockId, LockMode, Path, PeerConfig, PeerId, Result, Tid,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const STREAM_CAPACITY: usize = 256;

/// Lifecycle state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Id generated, role derived from the transport
    Starting,
    /// Hello broadcast, waiting for the master if required
    Announcing,
    /// Serving requests
    Active,
    /// Draining locks before departure
    Exiting,
    /// Transport closed
    Stopped,
}

/// Application-level request handler
///
/// Called on the peer's message task; keep it short.
pub trait RequestHandler: Send + Sync + 'static {
    /// Answer a `request` from `from`; `Err` becomes a failed `result`
    fn handle(&self, from: &PeerId, data: Value) -> std::result::Result<Value, String>;
}

impl<F> RequestHandler for F
where
    F: Fn(&PeerId, Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
{
    fn handle(&self, from: &PeerId, data: Value) -> std::result::Result<Value, String> {
        self(from, data)
    }
}

/// Change event received from another peer
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    /// Relaying peer
    pub from: PeerId,
    /// The change
    pub event: ChangeEvent,
}

/// Application broadcast received from another peer
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Sender
    pub from: PeerId,
    /// Payload
    pub data: Value,
}

struct InFlight {
    to: PeerId,
    reply: oneshot::Sender<Result<Body>>,
}

/// What the master holds on behalf of one remote peer
#[derive(Debug, Default)]
struct RemoteHoldings {
    tids: HashSet<Tid>,
    locks: BTreeSet<LockId>,
}

struct Shared {
    state: PeerState,
    master: PeerId,
    roster: BTreeMap<PeerId, Instant>,
    subscriptions: Vec<Subscription>,
    relayed: HashMap<PeerId, Vec<Subscription>>,
    in_flight: HashMap<RequestId, InFlight>,
    next_request: RequestId,
    proxied: BTreeMap<LockId, LockGrant>,
    remote: HashMap<PeerId, RemoteHoldings>,
}

struct PeerInner {
    id: PeerId,
    config: PeerConfig,
    topology: Topology,
    manager: LockManager,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    roster_changed: Notify,
    events_enabled: AtomicBool,
    remote_events: broadcast::Sender<RemoteEvent>,
    notifications: broadcast::Sender<Notification>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Lock and move requests of remote peers still being served
    in_service: AtomicUsize,
    service_idle: Notify,
}

/// Counts one remote request as in service until dropped
struct InService(Arc<PeerInner>);

impl Drop for InService {
    fn drop(&mut self) {
        if self.0.in_service.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.service_idle.notify_waiters();
        }
    }
}

/// Handle to a coordination peer
///
/// Cheap to clone; all clones drive the same peer.
#[derive(Clone)]
pub struct CoordinationPeer {
    inner: Arc<PeerInner>,
}

fn remote_tid(peer: &PeerId, tid: &Tid) -> Tid {
    Tid::new(format!("{}:{}", peer, tid))
}

fn local_tid(peer: &PeerId, tid: &Tid) -> Tid {
    let prefix = format!("{}:", peer);
    Tid::new(tid.as_str().strip_prefix(&prefix).unwrap_or(tid.as_str()))
}

fn unexpected(body: &Body) -> LockError {
    LockError::Transport(format!("unexpected {} reply", body.kind()))
}

impl CoordinationPeer {
    /// Start a peer on `transport`
    ///
    /// Announces itself and, when the transport names a fixed master other
    /// than this peer, waits up to `peer.startup_timeout_ms` for the
    /// master's hello.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Transport`] if the hello cannot be sent or the
    /// master does not answer in time; the transport is closed in that case.
    pub async fn start<T: Transport>(
        id: PeerId,
        config: CanopyConfig,
        transport: T,
        inbound: Inbound,
    ) -> Result<Self> {
        let topology = transport.topology();
        let master = match &topology {
            Topology::Fixed { master } => master.clone(),
            Topology::Standalone | Topology::LowestId => id.clone(),
        };

        let (remote_events, _) = broadcast::channel(STREAM_CAPACITY);
        let (notifications, _) = broadcast::channel(STREAM_CAPACITY);
        let peer = CoordinationPeer {
            inner: Arc::new(PeerInner {
                id: id.clone(),
                config: config.peer,
                topology: topology.clone(),
                manager: LockManager::new(config.lock),
                transport: Arc::new(transport),
                shared: Mutex::new(Shared {
                    state: PeerState::Starting,
                    master,
                    roster: BTreeMap::new(),
                    subscriptions: Vec::new(),
                    relayed: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_request: 1,
                    proxied: BTreeMap::new(),
                    remote: HashMap::new(),
                }),
                roster_changed: Notify::new(),
                events_enabled: AtomicBool::new(true),
                remote_events,
                notifications,
                handler: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                in_service: AtomicUsize::new(0),
                service_idle: Notify::new(),
            }),
        };
        debug!(target: "canopy::peer", %id, ?topology, "Peer starting");

        let weak = Arc::downgrade(&peer.inner);
        peer.spawn(run_inbound(weak, inbound));

        peer.set_state(PeerState::Announcing);
        if let Err(e) = peer.broadcast(Body::Hello) {
            peer.abort();
            return Err(e);
        }

        if let Topology::Fixed { master } = &topology {
            if *master != id {
                if let Err(e) = peer.await_master(master).await {
                    error!(target: "canopy::peer", %id, %master, error = %e, "Master did not answer");
                    peer.abort();
                    return Err(e);
                }
            }
        }

        if topology != Topology::Standalone {
            let weak = Arc::downgrade(&peer.inner);
            peer.spawn(run_pulse(weak, peer.inner.config.pulse_interval()));
        }

        peer.set_state(PeerState::Active);
        info!(target: "canopy::peer", %id, master = %peer.master_id(), "Peer active");
        Ok(peer)
    }

    /// Start a peer that shares its lock manager with nobody
    pub async fn standalone(config: CanopyConfig) -> Result<Self> {
        let (transport, inbound) = LocalTransport::new();
        Self::start(PeerId::generate(), config, transport, inbound).await
    }

    /// Connect to the broker of `db_file` as a worker
    #[cfg(unix)]
    pub async fn connect(db_file: &std::path::Path, config: CanopyConfig) -> Result<Self> {
        let socket = crate::broker::socket_path_for(db_file);
        let (transport, inbound) =
            crate::transport::SocketTransport::connect(&socket, config.peer.startup_timeout())
                .await?;
        Self::start(PeerId::generate(), config, transport, inbound).await
    }

    /// Join the broadcast channel for `name` on `hub`
    pub async fn join_broadcast(
        hub: &crate::transport::BroadcastHub,
        name: &str,
        config: CanopyConfig,
    ) -> Result<Self> {
        let id = PeerId::generate();
        let (transport, inbound) = hub.join(name, id.clone());
        Self::start(id, config, transport, inbound).await
    }

    async fn await_master(&self, master: &PeerId) -> Result<()> {
        let limit = self.inner.config.startup_timeout();
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.inner.roster_changed.notified();
            if self.inner.shared.lock().roster.contains_key(master) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LockError::transport(format!(
                    "no hello from master {} within {:?}",
                    master, limit
                )));
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.lock().push(tokio::spawn(task));
    }

    fn abort(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.transport.close();
        self.set_state(PeerState::Stopped);
    }

    fn set_state(&self, state: PeerState) {
        self.inner.shared.lock().state = state;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// This peer's id
    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        self.inner.shared.lock().state
    }

    /// Current master
    pub fn master_id(&self) -> PeerId {
        self.inner.shared.lock().master.clone()
    }

    /// Check if this peer is the master
    pub fn is_master(&self) -> bool {
        self.inner.shared.lock().master == self.inner.id
    }

    /// Known remote peers
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.shared.lock().roster.keys().cloned().collect()
    }

    /// The local lock manager; authoritative only on the master
    pub fn manager(&self) -> &LockManager {
        &self.inner.manager
    }

    /// Master selection rule of the transport
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Locks this worker holds through the master
    pub fn proxied_locks(&self) -> Vec<LockGrant> {
        self.inner.shared.lock().proxied.values().cloned().collect()
    }

    /// Whether change events are relayed and delivered
    pub fn events_enabled(&self) -> bool {
        self.inner.events_enabled.load(Ordering::Acquire)
    }

    /// Turn change event relay on or off
    pub fn set_events_enabled(&self, enabled: bool) {
        self.inner.events_enabled.store(enabled, Ordering::Release);
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            PeerState::Exiting | PeerState::Stopped => Err(LockError::PeerExiting),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Acquire a lock through the master
    ///
    /// On the master this is [`LockManager::acquire`]. A worker sends a
    /// `lock-request`; only the comment of `options` travels with it, the
    /// master applies its own queue timeout and expiry.
    ///
    /// # Errors
    ///
    /// [`LockError::PeerExiting`] once [`exit`](Self::exit) has begun, any
    /// manager error, or [`LockError::Transport`] if the master is
    /// unreachable or leaves.
    pub async fn lock(
        &self,
        path: Path,
        tid: Tid,
        mode: LockMode,
        options: LockOptions,
    ) -> Result<PeerLock> {
        self.ensure_running()?;
        let master = self.master_id();
        if master == self.inner.id {
            let lock = self
                .inner
                .manager
                .acquire(path, tid.clone(), mode, options)
                .await?;
            return Ok(PeerLock::new(self.clone(), LockGrant::from_lock(&lock, tid), None));
        }

        let data = LockRequestData {
            path: path.clone(),
            write: mode.is_write(),
            tid: tid.clone(),
            comment: options.comment,
        };
        let body = self
            .request(master.clone(), |id| Body::LockRequest { id, data })
            .await?;
        let grant = match body {
            Body::LockResult(reply) => reply.into_result(&path, &tid, None)?,
            other => return Err(unexpected(&other)),
        };
        debug!(target: "canopy::peer", id = %grant.id, path = %grant.path, %tid, "Lock granted by master");
        self.inner
            .shared
            .lock()
            .proxied
            .insert(grant.id, grant.clone());
        Ok(PeerLock::new(self.clone(), grant, Some(master)))
    }

    async fn release_lock(&self, lock: &PeerLock) -> Result<()> {
        let Some(master) = &lock.master else {
            return self.inner.manager.release(lock.grant.id, "").await;
        };
        self.ensure_running()?;

        let id = lock.grant.id;
        let body = self
            .request(master.clone(), |rid| Body::UnlockRequest {
                id: rid,
                data: UnlockData { id },
            })
            .await?;
        let result = match body {
            Body::UnlockResult(reply) => reply
                .into_result(&lock.grant.path, &lock.grant.tid, Some(id))
                .map(|_| ()),
            other => return Err(unexpected(&other)),
        };
        if !matches!(result, Err(LockError::Transport(_))) {
            self.inner.shared.lock().proxied.remove(&id);
        }
        result
    }

    async fn move_lock(
        &self,
        lock: &mut PeerLock,
        move_to: MoveTarget,
        target: Option<(Path, LockMode)>,
    ) -> Result<()> {
        let tid = lock.grant.tid.clone();
        let Some(master) = lock.master.clone() else {
            let moved = match target {
                Some((path, mode)) => self.inner.manager.move_to(lock.grant.id, path, mode).await?,
                None => self.inner.manager.move_to_parent(lock.grant.id).await?,
            };
            lock.grant = LockGrant::from_lock(&moved, tid);
            return Ok(());
        };
        self.ensure_running()?;

        let old = lock.grant.id;
        let data = MoveData {
            id: old,
            move_to,
            path: target.as_ref().map(|(p, _)| p.clone()),
            write: target.as_ref().map(|(_, m)| m.is_write()),
        };
        let body = self
            .request(master, |id| Body::MoveLockRequest { id, data })
            .await?;
        let result = match body {
            Body::LockResult(reply) => reply.into_result(&lock.grant.path, &tid, Some(old)),
            other => return Err(unexpected(&other)),
        };

        let mut shared = self.inner.shared.lock();
        match result {
            Ok(grant) => {
                shared.proxied.remove(&old);
                shared.proxied.insert(grant.id, grant.clone());
                lock.grant = grant;
                Ok(())
            }
            Err(e) => {
                // A contended move gives up the old lock before queueing
                if !matches!(e, LockError::Transport(_) | LockError::InvalidPath(_)) {
                    shared.proxied.remove(&old);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Requests and notifications
    // ========================================================================

    async fn request(&self, to: PeerId, body: impl FnOnce(RequestId) -> Body) -> Result<Body> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut shared = self.inner.shared.lock();
            if !shared.roster.contains_key(&to) {
                return Err(LockError::transport(format!("peer {} is not connected", to)));
            }
            let id = shared.next_request;
            shared.next_request += 1;
            shared.in_flight.insert(
                id,
                InFlight {
                    to: to.clone(),
                    reply: tx,
                },
            );
            id
        };
        let message = Message::unicast(self.inner.id.clone(), to, body(id));
        if let Err(e) = self.inner.transport.send(message) {
            self.inner.shared.lock().in_flight.remove(&id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(LockError::PeerExiting))
    }

    /// Send an application request and await its `result`
    pub async fn send_request(&self, to: PeerId, data: Value) -> Result<Value> {
        self.ensure_running()?;
        match self.request(to, |id| Body::Request { id, data }).await? {
            Body::Reply(reply) if reply.ok => Ok(reply.data.unwrap_or(Value::Null)),
            Body::Reply(reply) => Err(LockError::Remote {
                code: reply
                    .code
                    .unwrap_or_else(|| canopy_core::error::codes::REMOTE.to_string()),
                reason: reply.reason.unwrap_or_default(),
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Install the handler for incoming application requests
    pub fn set_request_handler(&self, handler: impl RequestHandler) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Broadcast an application notification
    pub fn send_notification(&self, data: Value) -> Result<()> {
        self.ensure_running()?;
        self.broadcast(Body::Notification { data })
    }

    /// Stream of notifications from other peers
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    fn broadcast(&self, body: Body) -> Result<()> {
        self.inner
            .transport
            .send(Message::broadcast(self.inner.id.clone(), body))
    }

    fn send_to(&self, to: PeerId, body: Body) {
        let kind = body.kind();
        if let Err(e) = self
            .inner
            .transport
            .send(Message::unicast(self.inner.id.clone(), to.clone(), body))
        {
            error!(target: "canopy::peer", %to, kind, error = %e, "Failed to send message");
        }
    }

    // ========================================================================
    // Subscriptions and events
    // ========================================================================

    /// Ask every peer to relay change events covered by `path` and `event`
    pub fn subscribe(&self, path: Path, event: impl Into<String>) -> Result<()> {
        let subscription = Subscription::new(path, event);
        {
            let mut shared = self.inner.shared.lock();
            if shared.subscriptions.contains(&subscription) {
                return Ok(());
            }
            shared.subscriptions.push(subscription.clone());
        }
        self.broadcast(Body::Subscribe { data: subscription })
    }

    /// Withdraw a subscription
    pub fn unsubscribe(&self, path: Path, event: impl Into<String>) -> Result<()> {
        let subscription = Subscription::new(path, event);
        {
            let mut shared = self.inner.shared.lock();
            let before = shared.subscriptions.len();
            shared.subscriptions.retain(|s| *s != subscription);
            if shared.subscriptions.len() == before {
                return Ok(());
            }
        }
        self.broadcast(Body::Unsubscribe { data: subscription })
    }

    /// Subscriptions `peer` asked this peer to relay
    pub fn peer_subscriptions(&self, peer: &PeerId) -> Vec<Subscription> {
        self.inner
            .shared
            .lock()
            .relayed
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Own subscriptions, in subscription order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.shared.lock().subscriptions.clone()
    }

    /// Relay a local change to every peer subscribed to it
    ///
    /// Returns the number of peers the event was sent to.
    pub fn relay_local_event(&self, event: ChangeEvent) -> usize {
        if !self.events_enabled() {
            return 0;
        }
        let targets: Vec<PeerId> = self
            .inner
            .shared
            .lock()
            .relayed
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.covers(&event)))
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &targets {
            self.send_to(peer.clone(), Body::Event { data: event.clone() });
        }
        targets.len()
    }

    /// Relay every change event arriving on `feed`
    pub fn attach_change_feed(&self, mut feed: mpsc::UnboundedReceiver<ChangeEvent>) {
        let weak = Arc::downgrade(&self.inner);
        self.spawn(async move {
            while let Some(event) = feed.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                CoordinationPeer { inner }.relay_local_event(event);
            }
        });
    }

    /// Stream of change events relayed by other peers
    pub fn remote_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.inner.remote_events.subscribe()
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    fn dispatch(&self, message: Message) {
        if !message.is_for(&self.inner.id) {
            return;
        }
        let Message { from, body, .. } = message;
        if matches!(body, Body::Bye) {
            self.remove_peer(&from, "bye");
            return;
        }
        let joined = self.touch(&from);

        match body {
            Body::Hello => {
                if joined {
                    self.send_to(from.clone(), Body::Hello);
                    let subscriptions = self.subscriptions();
                    for data in subscriptions {
                        self.send_to(from.clone(), Body::Subscribe { data });
                    }
                }
            }
            Body::Bye | Body::Pulse => {}
            Body::LockRequest { id, data } => self.serve_lock(from, id, data),
            Body::UnlockRequest { id, data } => self.serve_unlock(from, id, data),
            Body::MoveLockRequest { id, data } => self.serve_move(from, id, data),
            body @ (Body::LockResult(_) | Body::UnlockResult(_) | Body::Reply(_)) => {
                self.complete(&from, body)
            }
            Body::Subscribe { data } => {
                let mut shared = self.inner.shared.lock();
                let subs = shared.relayed.entry(from).or_default();
                if !subs.contains(&data) {
                    subs.push(data);
                }
            }
            Body::Unsubscribe { data } => {
                if let Some(subs) = self.inner.shared.lock().relayed.get_mut(&from) {
                    subs.retain(|s| *s != data);
                }
            }
            Body::Event { data } => {
                if !self.events_enabled() {
                    return;
                }
                let wanted = self
                    .inner
                    .shared
                    .lock()
                    .subscriptions
                    .iter()
                    .any(|s| s.covers(&data));
                if wanted {
                    let _ = self.inner.remote_events.send(RemoteEvent { from, event: data });
                }
            }
            Body::Request { id, data } => self.serve_request(from, id, data),
            Body::Notification { data } => {
                let _ = self.inner.notifications.send(Notification { from, data });
            }
        }
    }

    /// Refresh a peer's last-seen time; returns true if it was unknown
    fn touch(&self, peer: &PeerId) -> bool {
        let joined = {
            let mut shared = self.inner.shared.lock();
            let joined = shared.roster.insert(peer.clone(), Instant::now()).is_none();
            if joined {
                self.elect(&mut shared);
            }
            joined
        };
        if joined {
            info!(target: "canopy::peer", id = %self.inner.id, %peer, "Peer joined");
            self.inner.roster_changed.notify_waiters();
        }
        joined
    }

    fn elect(&self, shared: &mut Shared) {
        if self.inner.topology != Topology::LowestId {
            return;
        }
        let lowest = shared
            .roster
            .keys()
            .next()
            .filter(|first| **first < self.inner.id)
            .cloned()
            .unwrap_or_else(|| self.inner.id.clone());
        if lowest != shared.master {
            info!(target: "canopy::peer", id = %self.inner.id, master = %lowest, "Master changed");
            shared.master = lowest;
        }
    }

    fn complete(&self, from: &PeerId, body: Body) {
        let Some(id) = body.reply_id() else { return };
        let waiter = {
            let mut shared = self.inner.shared.lock();
            let addressed = shared.in_flight.get(&id).is_some_and(|f| f.to == *from);
            if addressed {
                shared.in_flight.remove(&id)
            } else {
                None
            }
        };
        let Some(waiter) = waiter else {
            debug!(target: "canopy::peer", %from, id, kind = body.kind(), "Reply without request");
            return;
        };
        if let Err(Ok(Body::LockResult(reply))) = waiter.reply.send(Ok(body)) {
            // Caller gave up while the master was granting
            if let Some(grant) = reply.data.filter(|_| reply.ok) {
                self.send_to(
                    from.clone(),
                    Body::UnlockRequest {
                        id: 0,
                        data: UnlockData { id: grant.id },
                    },
                );
            }
        }
    }

    fn serving(&self) -> Result<()> {
        self.ensure_running()?;
        if !self.is_master() {
            return Err(LockError::transport(format!(
                "{} is not the master",
                self.inner.id
            )));
        }
        Ok(())
    }

    /// Track a lock granted to `peer`; false if the peer already left
    fn track_remote(&self, peer: &PeerId, lock: &PathLock) -> bool {
        match self.inner.shared.lock().remote.get_mut(peer) {
            Some(holdings) => {
                holdings.tids.insert(lock.tid.clone());
                holdings.locks.insert(lock.id);
                true
            }
            None => false,
        }
    }

    fn owns_remote(&self, peer: &PeerId, id: LockId) -> bool {
        self.inner
            .shared
            .lock()
            .remote
            .get(peer)
            .is_some_and(|h| h.locks.contains(&id))
    }

    /// Drop `id` and `tid` from the peer's holdings once the manager no
    /// longer knows them
    fn forget_if_gone(&self, peer: &PeerId, id: Option<LockId>, tid: Option<&Tid>) {
        let manager = &self.inner.manager;
        let gone = id.filter(|id| manager.lock_info(*id).is_none());
        let idle = tid.filter(|tid| !manager.tid_in_use(tid));
        if gone.is_none() && idle.is_none() {
            return;
        }
        if let Some(holdings) = self.inner.shared.lock().remote.get_mut(peer) {
            if let Some(id) = gone {
                holdings.locks.remove(&id);
            }
            if let Some(tid) = idle {
                holdings.tids.remove(tid);
            }
        }
    }

    fn begin_service(&self) -> InService {
        self.inner.in_service.fetch_add(1, Ordering::SeqCst);
        InService(Arc::clone(&self.inner))
    }

    /// Wait until every spawned lock or move request has sent its outcome
    async fn service_drained(&self) {
        loop {
            let idle = self.inner.service_idle.notified();
            if self.inner.in_service.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn serve_lock(&self, from: PeerId, id: RequestId, data: LockRequestData) {
        if let Err(e) = self.serving() {
            self.send_to(from, Body::LockResult(Reply::failure(id, &e)));
            return;
        }
        let tid = remote_tid(&from, &data.tid);
        self.inner
            .shared
            .lock()
            .remote
            .entry(from.clone())
            .or_default()
            .tids
            .insert(tid.clone());

        let peer = self.clone();
        let service = self.begin_service();
        tokio::spawn(async move {
            let _service = service;
            let mode = LockMode::from_write_flag(data.write);
            let options = LockOptions::new().comment(data.comment);
            let result = peer
                .inner
                .manager
                .acquire(data.path, tid.clone(), mode, options)
                .await;
            let body = match result {
                Ok(lock) => {
                    if !peer.track_remote(&from, &lock) {
                        let _ = peer.inner.manager.release_now(lock.id, "requester left");
                        return;
                    }
                    Body::LockResult(Reply::success(id, LockGrant::from_lock(&lock, data.tid)))
                }
                Err(e) => {
                    peer.forget_if_gone(&from, None, Some(&tid));
                    Body::LockResult(Reply::failure(id, &e))
                }
            };
            peer.send_to(from, body);
        });
    }

    fn serve_unlock(&self, from: PeerId, id: RequestId, data: UnlockData) {
        let tid = self.inner.manager.lock_info(data.id).map(|l| l.tid);
        let result = self.serving().and_then(|_| {
            if self.owns_remote(&from, data.id) {
                self.inner.manager.release_now(data.id, "remote unlock")
            } else {
                Err(LockError::UnknownLock(data.id))
            }
        });
        self.forget_if_gone(&from, Some(data.id), tid.as_ref());
        let reply = match result {
            Ok(()) => Reply::success(id, data),
            Err(e) => Reply::failure(id, &e),
        };
        // id 0 marks fire-and-forget unlocks
        if id != 0 {
            self.send_to(from, Body::UnlockResult(reply));
        }
    }

    fn serve_move(&self, from: PeerId, id: RequestId, data: MoveData) {
        let checked = self.serving().and_then(|_| {
            if self.owns_remote(&from, data.id) {
                Ok(())
            } else {
                Err(LockError::UnknownLock(data.id))
            }
        });
        if let Err(e) = checked {
            self.send_to(from, Body::LockResult(Reply::failure(id, &e)));
            return;
        }

        let tid = self.inner.manager.lock_info(data.id).map(|l| l.tid);
        let peer = self.clone();
        let service = self.begin_service();
        tokio::spawn(async move {
            let _service = service;
            let manager = &peer.inner.manager;
            let result: Result<PathLock> = match data.move_to {
                MoveTarget::Parent => manager.move_to_parent(data.id).await,
                MoveTarget::Path => match data.path {
                    None => Err(LockError::InvalidPath(
                        "move-lock-request without a target path".to_string(),
                    )),
                    Some(path) => {
                        let mode = data
                            .write
                            .map(LockMode::from_write_flag)
                            .or_else(|| manager.lock_info(data.id).map(|l| l.mode));
                        match mode {
                            Some(mode) => manager.move_to(data.id, path, mode).await,
                            None => Err(LockError::UnknownLock(data.id)),
                        }
                    }
                },
            };
            peer.forget_if_gone(&from, Some(data.id), tid.as_ref());
            let body = match result {
                Ok(lock) => {
                    if !peer.track_remote(&from, &lock) {
                        let _ = manager.release_now(lock.id, "requester left");
                        return;
                    }
                    let tid = local_tid(&from, &lock.tid);
                    Body::LockResult(Reply::success(id, LockGrant::from_lock(&lock, tid)))
                }
                Err(e) => Body::LockResult(Reply::failure(id, &e)),
            };
            peer.send_to(from, body);
        });
    }

    fn serve_request(&self, from: PeerId, id: RequestId, data: Value) {
        let handler = self.inner.handler.lock().clone();
        let reply = match handler {
            Some(handler) => match handler.handle(&from, data) {
                Ok(value) => Reply::success(id, value),
                Err(reason) => Reply {
                    id,
                    ok: false,
                    reason: Some(reason),
                    code: None,
                    data: None,
                },
            },
            None => Reply {
                id,
                ok: false,
                reason: Some("no request handler installed".to_string()),
                code: None,
                data: None,
            },
        };
        self.send_to(from, Body::Reply(reply));
    }

    // ========================================================================
    // Departures
    // ========================================================================

    fn remove_peer(&self, peer: &PeerId, reason: &str) {
        let (known, rejected, holdings) = {
            let mut shared = self.inner.shared.lock();
            let known = shared.roster.remove(peer).is_some();
            shared.relayed.remove(peer);
            let ids: Vec<RequestId> = shared
                .in_flight
                .iter()
                .filter(|(_, f)| f.to == *peer)
                .map(|(id, _)| *id)
                .collect();
            let rejected: Vec<InFlight> = ids
                .iter()
                .filter_map(|id| shared.in_flight.remove(id))
                .collect();
            let holdings = shared.remote.remove(peer);
            if known {
                self.elect(&mut shared);
            }
            (known, rejected, holdings)
        };

        for waiter in rejected {
            let _ = waiter.reply.send(Err(LockError::transport(format!(
                "peer {} left ({})",
                peer, reason
            ))));
        }
        if let Some(holdings) = holdings {
            let released: usize = holdings
                .tids
                .iter()
                .map(|tid| self.inner.manager.release_tid(tid, reason))
                .sum();
            if released > 0 {
                warn!(target: "canopy::peer", %peer, released, reason, "Released locks of departed peer");
            }
        }
        if known {
            info!(target: "canopy::peer", id = %self.inner.id, %peer, reason, "Peer left");
            self.inner.roster_changed.notify_waiters();
        }
    }

    fn transport_lost(&self) {
        error!(target: "canopy::peer", id = %self.inner.id, "Transport disconnected");
        let (peers, rejected) = {
            let mut shared = self.inner.shared.lock();
            let peers: Vec<PeerId> = shared.roster.keys().cloned().collect();
            let rejected: Vec<InFlight> = shared.in_flight.drain().map(|(_, f)| f).collect();
            (peers, rejected)
        };
        for waiter in rejected {
            let _ = waiter
                .reply
                .send(Err(LockError::transport("transport disconnected")));
        }
        for peer in peers {
            self.remove_peer(&peer, "transport disconnected");
        }
    }

    fn pulse(&self) {
        if let Err(e) = self.broadcast(Body::Pulse) {
            error!(target: "canopy::peer", id = %self.inner.id, error = %e, "Failed to send pulse");
        }
        let Some(limit) = self.inner.config.peer_timeout() else {
            return;
        };
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .inner
            .shared
            .lock()
            .roster
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > limit)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in stale {
            warn!(target: "canopy::peer", id = %self.inner.id, %peer, ?limit, "Peer timed out");
            self.remove_peer(&peer, "pulse timeout");
        }
    }

    /// Leave the coordination group
    ///
    /// Rejects in-flight requests with [`LockError::PeerExiting`], refuses
    /// new ones, releases every lock held here (a worker asks the master,
    /// waiting at most `peer.drain_timeout_ms` per lock), says `bye` and
    /// closes the transport. A master first lets the workers' queued requests
    /// fail with [`LockError::PeerExiting`], also bounded by
    /// `peer.drain_timeout_ms`. Calling it again is a no-op.
    pub async fn exit(&self) -> Result<()> {
        let (rejected, proxied) = {
            let mut shared = self.inner.shared.lock();
            if matches!(shared.state, PeerState::Exiting | PeerState::Stopped) {
                return Ok(());
            }
            shared.state = PeerState::Exiting;
            let rejected: Vec<InFlight> = shared.in_flight.drain().map(|(_, f)| f).collect();
            (rejected, std::mem::take(&mut shared.proxied))
        };
        info!(target: "canopy::peer", id = %self.inner.id, "Peer exiting");
        for waiter in rejected {
            let _ = waiter.reply.send(Err(LockError::PeerExiting));
        }

        if self.is_master() {
            self.inner.shared.lock().remote.clear();
            let released = self.inner.manager.release_all("peer exiting");
            debug!(target: "canopy::peer", released, "Released all locks");
            // queued remote requests report peer_exiting before the bye
            let limit = self.inner.config.drain_timeout();
            if tokio::time::timeout(limit, self.service_drained()).await.is_err() {
                warn!(target: "canopy::peer", ?limit, "Remote requests still in service at exit");
            }
        } else {
            let master = self.master_id();
            let limit = self.inner.config.drain_timeout();
            for grant in proxied.values() {
                let lock_id = grant.id;
                let unlock = self.request(master.clone(), |id| Body::UnlockRequest {
                    id,
                    data: UnlockData { id: lock_id },
                });
                match tokio::time::timeout(limit, unlock).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!(target: "canopy::peer", id = %lock_id, error = %e, "Unlock on exit failed")
                    }
                    Err(_) => {
                        warn!(target: "canopy::peer", id = %lock_id, ?limit, "Unlock on exit timed out")
                    }
                }
            }
        }

        if let Err(e) = self.broadcast(Body::Bye) {
            debug!(target: "canopy::peer", error = %e, "Could not say bye");
        }
        self.abort();
        info!(target: "canopy::peer", id = %self.inner.id, "Peer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for CoordinationPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationPeer")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("master", &self.master_id())
            .finish()
    }
}

async fn run_inbound(weak: Weak<PeerInner>, mut inbound: Inbound) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        let peer = CoordinationPeer { inner };
        match event {
            TransportEvent::Message(message) => peer.dispatch(message),
            TransportEvent::Disconnected(Some(gone)) => peer.remove_peer(&gone, "disconnected"),
            TransportEvent::Disconnected(None) => peer.transport_lost(),
        }
    }
}

async fn run_pulse(weak: Weak<PeerInner>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        CoordinationPeer { inner }.pulse();
    }
}

/// A lock held through a [`CoordinationPeer`]
///
/// Dropping the handle does not release the lock; call
/// [`release`](Self::release) or let it expire.
#[derive(Debug)]
pub struct PeerLock {
    peer: CoordinationPeer,
    grant: LockGrant,
    master: Option<PeerId>,
}

impl PeerLock {
    fn new(peer: CoordinationPeer, grant: LockGrant, master: Option<PeerId>) -> Self {
        PeerLock {
            peer,
            grant,
            master,
        }
    }

    /// Lock id assigned by the master
    pub fn id(&self) -> LockId {
        self.grant.id
    }

    /// Locked path
    pub fn path(&self) -> &Path {
        &self.grant.path
    }

    /// Owning transaction
    pub fn tid(&self) -> &Tid {
        &self.grant.tid
    }

    /// Access mode
    pub fn mode(&self) -> LockMode {
        self.grant.mode()
    }

    /// Expiry time, if the lock expires
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.grant
            .expires
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Wire description of the lock
    pub fn grant(&self) -> &LockGrant {
        &self.grant
    }

    /// Check if the lock lives in another process's manager
    pub fn is_remote(&self) -> bool {
        self.master.is_some()
    }

    /// Release the lock
    pub async fn release(&self) -> Result<()> {
        self.peer.release_lock(self).await
    }

    /// Move the lock to its parent path
    pub async fn move_to_parent(&mut self) -> Result<()> {
        let peer = self.peer.clone();
        peer.move_lock(self, MoveTarget::Parent, None).await
    }

    /// Move the lock to `path` in `mode`
    pub async fn move_to(&mut self, path: Path, mode: LockMode) -> Result<()> {
        let peer = self.peer.clone();
        peer.move_lock(self, MoveTarget::Path, Some((path, mode))).await
    }
}

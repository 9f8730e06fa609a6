//! Remote peers and per-connection state shared by the server and client.
//!
//! A [`Remote`] exists from handshake completion until disconnect:
//!
//! ```text
//! TCP connect -> handshake (ids exchanged) -> RemoteConnected
//!                                               |
//!           Disconnect frame       -> RemoteDisconnected(Graceful)
//!           no traffic > timeout   -> RemoteDisconnected(Timeout)
//!           EOF / reset / bad data -> RemoteDisconnected(Error)
//! ```
//!
//! Message handlers are registered per remote. Messages that arrive before
//! a handler is registered are held and delivered on the first `update()`
//! after registration.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::server::NetworkConfig;
use crate::transport::tcp::{Connection, FrameKind, ReadState};
use crate::transport::udp::UdpChannel;
use crate::transport::{ChannelType, Message, MessageSender};

/// A connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Remote {
    /// Endpoint id the peer announced in its handshake.
    pub id: Uuid,
    /// Address of the peer's reliable connection.
    pub addr: SocketAddr,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.addr)
    }
}

/// Why a remote went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    /// Either side closed the connection deliberately.
    Graceful,
    /// Nothing was received for longer than the configured timeout.
    Timeout,
    /// The connection failed or the peer violated the wire protocol.
    Error,
}

/// Lifecycle notifications, drained with `poll_event()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started,
    Stopped,
    RemoteConnected(Remote),
    RemoteDisconnected {
        remote: Remote,
        status: DisconnectStatus,
    },
}

/// Callback receiving messages from one remote.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Operations common to [`NetworkServer`](crate::NetworkServer) and
/// [`NetworkClient`](crate::NetworkClient).
pub trait Network {
    /// Endpoint id sent to peers in the handshake.
    fn id(&self) -> Uuid;

    fn is_running(&self) -> bool;

    fn remotes(&self) -> Vec<Remote>;

    /// Handle for queueing messages from outside `update()`.
    fn sender(&self) -> MessageSender;

    /// Register `handler` for messages from `remote`.
    ///
    /// Returns `Ok(true)` when the handler is now registered, including when
    /// the same handler was already registered. Returns `Ok(false)` when a
    /// different handler is registered for the remote.
    fn register_message_handler(&mut self, remote: Remote, handler: MessageHandler) -> Result<bool>;

    /// Remove the handler for `remote`. Returns `Ok(true)` whether or not a
    /// handler was registered.
    fn deregister_message_handler(&mut self, remote: Remote) -> Result<bool>;

    fn send_message(&self, message: Message) -> Result<()> {
        self.sender().send(message)
    }
}

struct Peer {
    remote: Remote,
    conn: Connection,
    udp_addr: SocketAddr,
    handler: Option<MessageHandler>,
    pending: VecDeque<Message>,
    /// Messages dropped from a full `pending` queue.
    overflowed: u64,
}

impl Peer {
    /// Queue a received message. Without a handler at most `limit` messages
    /// are held and the oldest is dropped to make room.
    fn hold(&mut self, message: Message, limit: usize) {
        if self.handler.is_some() {
            self.pending.push_back(message);
            return;
        }
        if self.pending.len() >= limit {
            self.pending.pop_front();
            self.overflowed += 1;
            if self.overflowed == 1 || self.overflowed.is_power_of_two() {
                tracing::warn!(
                    remote = %self.remote.id,
                    limit,
                    dropped = self.overflowed,
                    "no message handler registered, oldest pending message dropped"
                );
            }
        }
        if limit > 0 {
            self.pending.push_back(message);
        }
    }

    fn deliver(&mut self) {
        if let Some(handler) = self.handler.clone() {
            while let Some(message) = self.pending.pop_front() {
                handler(message);
            }
        }
    }
}

/// Connected peers of one endpoint, plus the sockets and queues they share.
pub(crate) struct PeerSet {
    id: Uuid,
    config: NetworkConfig,
    peers: HashMap<Uuid, Peer>,
    connected: Arc<RwLock<HashMap<Uuid, Remote>>>,
    outbox: Arc<Mutex<VecDeque<Message>>>,
    running: Arc<AtomicBool>,
    udp: Option<UdpChannel>,
    events: VecDeque<NetworkEvent>,
}

impl PeerSet {
    pub(crate) fn new(config: NetworkConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            peers: HashMap::new(),
            connected: Arc::new(RwLock::new(HashMap::new())),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            udp: None,
            events: VecDeque::new(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn sender(&self) -> MessageSender {
        MessageSender::new(
            self.outbox.clone(),
            self.connected.clone(),
            self.running.clone(),
            self.config.max_reliable_message,
        )
    }

    pub(crate) fn udp_port(&self) -> Option<u16> {
        self.udp.as_ref().and_then(|udp| udp.local_port().ok())
    }

    pub(crate) fn start(&mut self, udp: UdpChannel) {
        self.udp = Some(udp);
        self.running.store(true, Ordering::SeqCst);
        self.events.push_back(NetworkEvent::Started);
    }

    /// Drop every peer, notifying them when `graceful`, and emit `Stopped`.
    pub(crate) fn stop(&mut self, graceful: bool) {
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<Uuid> = self.peers.keys().copied().collect();
        for id in ids {
            self.remove(id, DisconnectStatus::Graceful, graceful);
        }
        self.outbox.lock().clear();
        self.udp = None;
        self.events.push_back(NetworkEvent::Stopped);
    }

    pub(crate) fn poll_event(&mut self) -> Option<NetworkEvent> {
        self.events.pop_front()
    }

    pub(crate) fn contains(&self, id: &Uuid) -> bool {
        self.peers.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn remotes(&self) -> Vec<Remote> {
        self.peers.values().map(|p| p.remote).collect()
    }

    /// Register a peer whose handshake completed.
    pub(crate) fn add(&mut self, remote: Remote, conn: Connection, udp_port: u16) {
        let udp_addr = SocketAddr::new(conn.peer_addr().ip(), udp_port);
        tracing::info!(remote = %remote.id, addr = %remote.addr, %udp_addr, "remote connected");
        self.connected.write().insert(remote.id, remote);
        self.peers.insert(
            remote.id,
            Peer {
                remote,
                conn,
                udp_addr,
                handler: None,
                pending: VecDeque::new(),
                overflowed: 0,
            },
        );
        self.events.push_back(NetworkEvent::RemoteConnected(remote));
    }

    /// Remove a peer. Messages already received are delivered first when a
    /// handler is registered.
    pub(crate) fn remove(&mut self, id: Uuid, status: DisconnectStatus, notify: bool) -> Option<Remote> {
        let mut peer = self.peers.remove(&id)?;
        self.connected.write().remove(&id);
        peer.deliver();
        peer.conn.close(notify);

        let remote = peer.remote;
        tracing::info!(remote = %remote.id, addr = %remote.addr, ?status, "remote disconnected");
        self.events
            .push_back(NetworkEvent::RemoteDisconnected { remote, status });
        Some(remote)
    }

    fn peer_mut(&mut self, remote: &Remote) -> Result<&mut Peer> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        self.peers
            .get_mut(&remote.id)
            .filter(|p| p.remote == *remote)
            .ok_or(LinkError::InvalidRemote(remote.id))
    }

    pub(crate) fn register_handler(&mut self, remote: Remote, handler: MessageHandler) -> Result<bool> {
        let peer = self.peer_mut(&remote)?;
        match &peer.handler {
            Some(existing) => Ok(Arc::ptr_eq(existing, &handler)),
            None => {
                tracing::debug!(remote = %remote.id, pending = peer.pending.len(), "message handler registered");
                peer.handler = Some(handler);
                Ok(true)
            }
        }
    }

    pub(crate) fn deregister_handler(&mut self, remote: Remote) -> Result<bool> {
        let peer = self.peer_mut(&remote)?;
        peer.handler = None;
        Ok(true)
    }

    /// One pump of every peer connection: read, route the outbox, send
    /// heartbeats, write, detect timeouts, and deliver messages.
    pub(crate) fn pump(&mut self) {
        if !self.is_running() {
            return;
        }
        let now = Instant::now();
        let mut dropped: Vec<(Uuid, DisconnectStatus)> = Vec::new();
        let mut frames = Vec::new();

        let limit = self.config.max_pending_messages;
        for peer in self.peers.values_mut() {
            frames.clear();
            let state = peer.conn.poll_read(&mut frames);
            let mut status = None;
            for (kind, payload) in frames.drain(..) {
                match kind {
                    FrameKind::Data => peer.hold(
                        Message::new(peer.remote, ChannelType::ReliableOrdered, payload),
                        limit,
                    ),
                    FrameKind::Heartbeat => {}
                    FrameKind::Disconnect => {
                        status = Some(DisconnectStatus::Graceful);
                        break;
                    }
                    FrameKind::Handshake => {
                        tracing::warn!(remote = %peer.remote.id, "unexpected handshake on established connection");
                        status = Some(DisconnectStatus::Error);
                        break;
                    }
                }
            }
            let status = status.or(match state {
                Ok(ReadState::Open) => None,
                Ok(ReadState::Closed) => Some(DisconnectStatus::Error),
                Err(e) => {
                    tracing::warn!(remote = %peer.remote.id, error = %e, "connection read failed");
                    Some(DisconnectStatus::Error)
                }
            });
            let status = status.or_else(|| {
                (now.duration_since(peer.conn.last_received()) > self.config.timeout)
                    .then_some(DisconnectStatus::Timeout)
            });
            if let Some(status) = status {
                dropped.push((peer.remote.id, status));
            }
        }
        for (id, status) in dropped.drain(..) {
            self.remove(id, status, false);
        }

        self.receive_datagrams();
        self.route_outbox();

        for peer in self.peers.values_mut() {
            if now.duration_since(peer.conn.last_sent()) >= self.config.heartbeat_interval {
                peer.conn.queue(FrameKind::Heartbeat, &[]);
            }
            if let Err(e) = peer.conn.flush() {
                tracing::warn!(remote = %peer.remote.id, error = %e, "connection write failed");
                dropped.push((peer.remote.id, DisconnectStatus::Error));
            }
        }
        for (id, status) in dropped {
            self.remove(id, status, false);
        }

        for peer in self.peers.values_mut() {
            peer.deliver();
        }
    }

    fn receive_datagrams(&mut self) {
        let Some(udp) = self.udp.as_mut() else {
            return;
        };
        loop {
            match udp.recv() {
                Ok(None) => break,
                Ok(Some(None)) => continue,
                Ok(Some(Some((sender, data, from)))) => match self.peers.get_mut(&sender) {
                    Some(peer) if peer.udp_addr == from => peer.hold(
                        Message::new(peer.remote, ChannelType::UnreliableUnordered, data),
                        self.config.max_pending_messages,
                    ),
                    Some(peer) => tracing::debug!(
                        %sender,
                        %from,
                        expected = %peer.udp_addr,
                        "datagram from unexpected address dropped"
                    ),
                    None => tracing::debug!(%sender, %from, "datagram from unknown remote dropped"),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "datagram receive failed");
                    break;
                }
            }
        }
    }

    fn route_outbox(&mut self) {
        let queued: Vec<Message> = self.outbox.lock().drain(..).collect();
        for message in queued {
            let Some(peer) = self
                .peers
                .get_mut(&message.remote.id)
                .filter(|p| p.remote == message.remote)
            else {
                tracing::warn!(remote = %message.remote.id, "message for disconnected remote dropped");
                continue;
            };
            match message.channel {
                ChannelType::ReliableOrdered => peer.conn.queue(FrameKind::Data, &message.data),
                ChannelType::UnreliableUnordered => {
                    let Some(udp) = self.udp.as_ref() else {
                        continue;
                    };
                    if let Err(e) = udp.send(self.id, &message.data, peer.udp_addr) {
                        tracing::debug!(remote = %peer.remote.id, error = %e, "datagram send failed");
                    }
                }
            }
        }
    }
}

use std::io;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::session::{DisconnectStatus, MessageHandler, Network, NetworkEvent, PeerSet, Remote};
use crate::transport::MessageSender;
use crate::transport::tcp::{self, Connection, FrameKind, ReadState};
use crate::transport::udp::UdpChannel;

/// Timing and size limits shared by [`NetworkServer`] and
/// [`NetworkClient`](crate::NetworkClient).
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Idle time after which a heartbeat frame is sent.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is dropped with
    /// [`DisconnectStatus::Timeout`]. Also bounds the handshake.
    pub timeout: Duration,
    /// Delay between client connection attempts.
    pub reconnect_interval: Duration,
    /// Upper bound on a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Largest reliable message, in bytes.
    pub max_reliable_message: usize,
    /// Messages held per remote while no handler is registered. The oldest
    /// is dropped when a new one arrives at the limit.
    pub max_pending_messages: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            max_reliable_message: 64 * 1024 * 1024,
            max_pending_messages: 1024,
        }
    }
}

/// Accepts client connections on one port.
///
/// Nothing happens in the background: the host calls [`update`](Self::update)
/// regularly to accept connections, complete handshakes, move messages and
/// detect timeouts, then drains [`poll_event`](Self::poll_event).
///
/// The reliable channel listens on TCP `port` and the unreliable channel on
/// UDP `port`.
pub struct NetworkServer {
    peers: PeerSet,
    listener: Option<TcpListener>,
    port: Option<u16>,
    handshaking: Vec<Connection>,
}

impl NetworkServer {
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        Self {
            peers: PeerSet::new(config),
            listener: None,
            port: None,
            handshaking: Vec::new(),
        }
    }

    /// Start listening on `port` (0 picks a free port).
    ///
    /// Starting again on the port already in use does nothing. Starting on
    /// another port stops the current session first, so `Stopped` is
    /// reported before the new `Started`.
    pub fn start_server(&mut self, port: u16) -> Result<()> {
        if self.is_running() && self.port == Some(port) {
            return Ok(());
        }
        self.stop();

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let udp = UdpChannel::bind(port)?;

        self.listener = Some(listener);
        self.port = Some(port);
        self.peers.start(udp);

        tracing::info!(port, id = %self.peers.id(), "network server listening");
        Ok(())
    }

    /// Disconnect every client gracefully and close the sockets.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        tracing::info!(port = ?self.port, remotes = self.peers.len(), "network server stopping");
        self.handshaking.clear();
        self.listener = None;
        self.port = None;
        self.peers.stop(true);
    }

    pub fn update(&mut self) {
        if !self.is_running() {
            return;
        }
        self.accept();
        self.complete_handshakes();
        self.peers.pump();
    }

    /// Gracefully disconnect one client.
    pub fn disconnect(&mut self, remote: Remote) -> Result<()> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        if !self.remotes().contains(&remote) {
            return Err(LinkError::InvalidRemote(remote.id));
        }
        self.peers.remove(remote.id, DisconnectStatus::Graceful, true);
        Ok(())
    }

    /// Port in use, or `None` while stopped.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn remote_count(&self) -> usize {
        self.peers.len()
    }

    pub fn config(&self) -> &NetworkConfig {
        self.peers.config()
    }

    pub fn poll_event(&mut self) -> Option<NetworkEvent> {
        self.peers.poll_event()
    }

    fn accept(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    match Connection::new(stream, self.peers.config().max_reliable_message) {
                        Ok(conn) => {
                            tracing::debug!(%peer_addr, "connection accepted, awaiting handshake");
                            self.handshaking.push(conn);
                        }
                        Err(e) => tracing::warn!(%peer_addr, error = %e, "failed to configure connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                    break;
                }
            }
        }
    }

    fn complete_handshakes(&mut self) {
        let now = Instant::now();
        let timeout = self.peers.config().timeout;
        let local_port = self.peers.udp_port().unwrap_or_default();

        for mut conn in std::mem::take(&mut self.handshaking) {
            let peer_addr = conn.peer_addr();
            let state = conn.fill();

            let (kind, payload) = match conn.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    match state {
                        Ok(ReadState::Open) if now.duration_since(conn.last_received()) <= timeout => {
                            self.handshaking.push(conn);
                        }
                        Ok(ReadState::Open) => tracing::debug!(%peer_addr, "handshake timed out"),
                        Ok(ReadState::Closed) => tracing::debug!(%peer_addr, "connection closed during handshake"),
                        Err(e) => tracing::debug!(%peer_addr, error = %e, "handshake read failed"),
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%peer_addr, error = %e, "undecodable handshake, closing connection");
                    conn.close(false);
                    continue;
                }
            };

            let hello = (kind == FrameKind::Handshake)
                .then(|| tcp::decode_handshake(&payload))
                .flatten();
            let Some((id, udp_port)) = hello else {
                tracing::warn!(%peer_addr, "invalid handshake, closing connection");
                conn.close(false);
                continue;
            };

            if self.peers.contains(&id) {
                tracing::warn!(remote = %id, %peer_addr, "remote reconnected, replacing stale connection");
                self.peers.remove(id, DisconnectStatus::Error, false);
            }
            conn.queue(
                FrameKind::Handshake,
                &tcp::encode_handshake(self.peers.id(), local_port),
            );
            if let Err(e) = conn.flush() {
                tracing::warn!(%peer_addr, error = %e, "handshake reply failed");
                continue;
            }
            let remote = Remote {
                id,
                addr: peer_addr,
            };
            self.peers.add(remote, conn, udp_port);
        }
    }
}

impl Network for NetworkServer {
    fn id(&self) -> Uuid {
        self.peers.id()
    }

    fn is_running(&self) -> bool {
        self.peers.is_running()
    }

    fn remotes(&self) -> Vec<Remote> {
        self.peers.remotes()
    }

    fn sender(&self) -> MessageSender {
        self.peers.sender()
    }

    fn register_message_handler(&mut self, remote: Remote, handler: MessageHandler) -> Result<bool> {
        self.peers.register_handler(remote, handler)
    }

    fn deregister_message_handler(&mut self, remote: Remote) -> Result<bool> {
        self.peers.deregister_handler(remote)
    }
}

impl Default for NetworkServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(server: &mut NetworkServer) -> Vec<NetworkEvent> {
        std::iter::from_fn(|| server.poll_event()).collect()
    }

    #[test]
    fn port_is_none_until_started() {
        let mut server = NetworkServer::new();
        assert_eq!(server.port(), None);
        assert!(!server.is_running());

        server.start_server(0).unwrap();
        assert!(server.port().is_some());
        assert!(server.is_running());

        server.stop();
        assert_eq!(server.port(), None);
        assert_eq!(
            events(&mut server),
            vec![NetworkEvent::Started, NetworkEvent::Stopped]
        );
    }

    #[test]
    fn restarting_on_same_port_is_a_no_op() {
        let mut server = NetworkServer::new();
        server.start_server(0).unwrap();
        let port = server.port().unwrap();
        server.start_server(port).unwrap();
        assert_eq!(server.port(), Some(port));
        assert_eq!(events(&mut server), vec![NetworkEvent::Started]);
    }

    #[test]
    fn unknown_remote_cannot_be_disconnected() {
        let mut server = NetworkServer::new();
        let remote = Remote {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
        };
        assert!(matches!(server.disconnect(remote), Err(LinkError::NotRunning)));
        server.start_server(0).unwrap();
        assert!(matches!(
            server.disconnect(remote),
            Err(LinkError::InvalidRemote(_))
        ));
    }
}

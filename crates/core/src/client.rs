use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::server::NetworkConfig;
use crate::session::{MessageHandler, Network, NetworkEvent, PeerSet, Remote};
use crate::transport::MessageSender;
use crate::transport::tcp::{self, Connection, FrameKind, ReadState};
use crate::transport::udp::UdpChannel;

type ConnectSlot = Arc<Mutex<Option<io::Result<TcpStream>>>>;

enum ClientState {
    /// Waiting for the next connection attempt.
    Idle { retry_at: Instant },
    /// A background thread is running `TcpStream::connect_timeout`.
    Connecting {
        slot: ConnectSlot,
        cancel: Arc<AtomicBool>,
    },
    Handshaking(Connection),
    Connected,
}

/// Connects to one [`NetworkServer`](crate::NetworkServer) and keeps the
/// connection alive.
///
/// The client is running from [`connect_to_server`](Self::connect_to_server)
/// until [`stop`](Self::stop). While running it reconnects every
/// `reconnect_interval` whenever it is not connected, so it can be started
/// before the server and survives server restarts.
///
/// TCP connects run on a short-lived thread so `update()` never blocks;
/// everything else happens inside `update()`.
pub struct NetworkClient {
    peers: PeerSet,
    endpoint: Option<SocketAddr>,
    state: ClientState,
}

impl NetworkClient {
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        Self {
            peers: PeerSet::new(config),
            endpoint: None,
            state: ClientState::Idle {
                retry_at: Instant::now(),
            },
        }
    }

    /// Start connecting to `host:port`, receiving unreliable messages on
    /// UDP `local_port` (0 picks a free port).
    ///
    /// Calling again with the endpoint already in use does nothing, even if
    /// `local_port` differs. A different endpoint stops the current session
    /// first.
    pub fn connect_to_server(&mut self, host: &str, port: u16, local_port: u16) -> Result<()> {
        let endpoint = resolve(host, port)?;
        if self.is_running() && self.endpoint == Some(endpoint) {
            return Ok(());
        }
        self.stop();

        let udp = UdpChannel::bind(local_port)?;
        self.endpoint = Some(endpoint);
        self.state = ClientState::Idle {
            retry_at: Instant::now(),
        };
        self.peers.start(udp);

        tracing::info!(%endpoint, local_port, id = %self.peers.id(), "network client started");
        Ok(())
    }

    /// Disconnect gracefully and stop reconnecting.
    pub fn stop(&mut self) {
        self.shutdown(true);
    }

    /// Drop the connection without notifying the server. The server sees an
    /// abrupt disconnect.
    pub fn abort(&mut self) {
        self.shutdown(false);
    }

    fn shutdown(&mut self, graceful: bool) {
        if !self.is_running() {
            return;
        }
        tracing::info!(endpoint = ?self.endpoint, graceful, "network client stopping");
        if let ClientState::Connecting { cancel, .. } = &self.state {
            cancel.store(true, Ordering::SeqCst);
        }
        self.state = ClientState::Idle {
            retry_at: Instant::now(),
        };
        self.endpoint = None;
        self.peers.stop(graceful);
    }

    pub fn update(&mut self) {
        if !self.is_running() {
            return;
        }
        self.advance_connection();
        self.peers.pump();

        if matches!(self.state, ClientState::Connected) && self.peers.len() == 0 {
            self.schedule_retry();
        }
    }

    /// Running but not yet (or no longer) connected.
    pub fn is_connecting(&self) -> bool {
        self.is_running() && !matches!(self.state, ClientState::Connected)
    }

    /// Server address, or `None` while stopped.
    pub fn server_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// The server, once the handshake has completed.
    pub fn server(&self) -> Option<Remote> {
        self.peers.remotes().into_iter().next()
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

    fn schedule_retry(&mut self) {
        self.state = ClientState::Idle {
            retry_at: Instant::now() + self.peers.config().reconnect_interval,
        };
    }

    fn advance_connection(&mut self) {
        let Some(endpoint) = self.endpoint else {
            return;
        };
        let now = Instant::now();
        let state = std::mem::replace(&mut self.state, ClientState::Idle { retry_at: now });

        self.state = match state {
            ClientState::Idle { retry_at } if now >= retry_at => self.begin_connect(endpoint),
            ClientState::Connecting { slot, cancel } => {
                let result = slot.lock().take();
                match result {
                    None => ClientState::Connecting { slot, cancel },
                    Some(Ok(stream)) => self.begin_handshake(stream),
                    Some(Err(e)) => {
                        tracing::debug!(%endpoint, error = %e, "connect attempt failed");
                        self.retry_state()
                    }
                }
            }
            ClientState::Handshaking(conn) => self.poll_handshake(conn, endpoint, now),
            other => other,
        };
    }

    fn retry_state(&self) -> ClientState {
        ClientState::Idle {
            retry_at: Instant::now() + self.peers.config().reconnect_interval,
        }
    }

    fn begin_connect(&self, endpoint: SocketAddr) -> ClientState {
        let slot: ConnectSlot = Arc::new(Mutex::new(None));
        let cancel = Arc::new(AtomicBool::new(false));
        let timeout = self.peers.config().connect_timeout;

        let thread_slot = slot.clone();
        let thread_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name("link-connect".into())
            .spawn(move || {
                let result = TcpStream::connect_timeout(&endpoint, timeout);
                if !thread_cancel.load(Ordering::SeqCst) {
                    *thread_slot.lock() = Some(result);
                }
            });

        match spawned {
            Ok(_) => {
                tracing::trace!(%endpoint, "connect attempt started");
                ClientState::Connecting { slot, cancel }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn connect thread");
                self.retry_state()
            }
        }
    }

    fn begin_handshake(&self, stream: TcpStream) -> ClientState {
        let mut conn = match Connection::new(stream, self.peers.config().max_reliable_message) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "failed to configure connection");
                return self.retry_state();
            }
        };
        let local_port = self.peers.udp_port().unwrap_or_default();
        conn.queue(
            FrameKind::Handshake,
            &tcp::encode_handshake(self.peers.id(), local_port),
        );
        tracing::debug!(peer_addr = %conn.peer_addr(), "connected, sending handshake");
        ClientState::Handshaking(conn)
    }

    fn poll_handshake(&mut self, mut conn: Connection, endpoint: SocketAddr, now: Instant) -> ClientState {
        if let Err(e) = conn.flush() {
            tracing::debug!(%endpoint, error = %e, "handshake write failed");
            return self.retry_state();
        }

        let state = conn.fill();
        let (kind, payload) = match conn.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return match state {
                    Ok(ReadState::Open) if now.duration_since(conn.last_received()) <= self.peers.config().timeout => {
                        ClientState::Handshaking(conn)
                    }
                    Ok(ReadState::Open) => {
                        tracing::debug!(%endpoint, "handshake timed out");
                        self.retry_state()
                    }
                    Ok(ReadState::Closed) => {
                        tracing::debug!(%endpoint, "connection closed during handshake");
                        self.retry_state()
                    }
                    Err(e) => {
                        tracing::debug!(%endpoint, error = %e, "handshake read failed");
                        self.retry_state()
                    }
                };
            }
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "undecodable handshake reply");
                conn.close(false);
                return self.retry_state();
            }
        };

        let hello = (kind == FrameKind::Handshake)
            .then(|| tcp::decode_handshake(&payload))
            .flatten();
        let Some((id, udp_port)) = hello else {
            tracing::warn!(%endpoint, "invalid handshake reply");
            conn.close(false);
            return self.retry_state();
        };
        // Frames sent right behind the reply stay buffered in `conn`.
        self.peers.add(Remote { id, addr: endpoint }, conn, udp_port);
        ClientState::Connected
    }
}

/// Resolve `host:port`, preferring IPv4 to match the UDP socket.
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses").into())
}

impl Network for NetworkClient {
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

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_without_server() {
        let mut client = NetworkClient::new();
        assert!(!client.is_connecting());
        assert_eq!(client.server_endpoint(), None);

        client.connect_to_server("127.0.0.1", 1, 0).unwrap();
        assert!(client.is_running());
        assert!(client.is_connecting());
        assert_eq!(client.server_endpoint(), Some("127.0.0.1:1".parse().unwrap()));

        client.update();
        assert_eq!(client.remote_count(), 0);

        client.stop();
        assert!(!client.is_connecting());
        assert_eq!(client.server_endpoint(), None);
        assert_eq!(client.poll_event(), Some(NetworkEvent::Started));
        assert_eq!(client.poll_event(), Some(NetworkEvent::Stopped));
    }

    #[test]
    fn same_endpoint_is_a_no_op() {
        let mut client = NetworkClient::new();
        client.connect_to_server("127.0.0.1", 1, 0).unwrap();
        client.connect_to_server("127.0.0.1", 1, 0).unwrap();
        assert_eq!(client.poll_event(), Some(NetworkEvent::Started));
        assert_eq!(client.poll_event(), None);

        client.connect_to_server("127.0.0.1", 2, 0).unwrap();
        assert_eq!(client.poll_event(), Some(NetworkEvent::Stopped));
        assert_eq!(client.poll_event(), Some(NetworkEvent::Started));
    }
}

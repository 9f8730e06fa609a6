use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use super::{DiscoveryConfig, DiscoveryInfo, MAX_END_POINTS, MAX_PACKET, Packet, ServerData};
use crate::error::{LinkError, Result};

/// Answers discovery queries for one server.
pub struct DiscoveryServer {
    config: DiscoveryConfig,
    socket: Option<UdpSocket>,
    info: Option<DiscoveryInfo>,
    /// Clients that queried recently; they are told when the server stops.
    clients: HashMap<SocketAddr, Instant>,
    buf: Vec<u8>,
}

impl DiscoveryServer {
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self {
            config,
            socket: None,
            info: None,
            clients: HashMap::new(),
            buf: vec![0u8; MAX_PACKET],
        }
    }

    /// Start answering queries for `data`, advertising `end_points`.
    ///
    /// If already running, the announced data is replaced and the socket is
    /// kept.
    pub fn start(&mut self, data: ServerData, end_points: &[SocketAddr]) -> Result<()> {
        if end_points.len() > MAX_END_POINTS {
            return Err(LinkError::TooManyEndPoints(end_points.len()));
        }
        let info = DiscoveryInfo {
            server: data,
            end_points: end_points.to_vec(),
        };

        if self.socket.is_none() {
            let socket = self.bind()?;
            tracing::info!(
                port = socket.local_addr()?.port(),
                product = info.server.product_name(),
                instance = info.server.instance_name(),
                "discovery server started"
            );
            self.socket = Some(socket);
        }
        self.info = Some(info);
        Ok(())
    }

    /// Bind the first free port of the configured range.
    fn bind(&self) -> Result<UdpSocket> {
        let mut last_error = None;
        for port in self.config.ports() {
            match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    return Ok(socket);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "empty discovery port range"))
            .into())
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// Port the server listens on, or `None` while stopped.
    pub fn port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Notify recent clients and close the socket.
    pub fn stop(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        if let Some(info) = self.info.take() {
            let shutdown = Packet::Shutdown {
                product_name: info.server.product_name().to_string(),
                id: info.server.id(),
            }
            .encode();
            for client in self.clients.keys() {
                if let Err(e) = socket.send_to(&shutdown, client) {
                    tracing::debug!(%client, error = %e, "shutdown notice not sent");
                }
            }
        }
        tracing::info!(clients = self.clients.len(), "discovery server stopped");
        self.clients.clear();
    }

    /// Answer pending queries.
    pub fn update(&mut self) {
        let (Some(socket), Some(info)) = (&self.socket, &self.info) else {
            return;
        };
        let now = Instant::now();
        let announce = Packet::Announce(info.clone()).encode();

        loop {
            let (n, from) = match socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery receive failed");
                    break;
                }
            };
            match Packet::decode(&self.buf[..n]) {
                Some(Packet::Query { product_name }) if product_name == info.server.product_name() => {
                    if self.clients.insert(from, now).is_none() {
                        tracing::debug!(client = %from, "discovery client seen");
                    }
                    if let Err(e) = socket.send_to(&announce, from) {
                        tracing::debug!(client = %from, error = %e, "announce not sent");
                    }
                }
                Some(_) => {}
                None => tracing::warn!(%from, size = n, "malformed discovery packet dropped"),
            }
        }

        let expiry = self.config.server_timeout * 2;
        self.clients
            .retain(|_, last_query| now.duration_since(*last_query) <= expiry);
    }
}

impl Default for DiscoveryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::UdpSocket;
use std::time::Instant;

use uuid::Uuid;

use super::{DiscoveryConfig, DiscoveryInfo, MAX_PACKET, Packet, validate_name};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServerFound(DiscoveryInfo),
    ServerLost(DiscoveryInfo),
}

struct Found {
    info: DiscoveryInfo,
    last_seen: Instant,
}

/// Finds servers for one product name.
pub struct DiscoveryClient {
    config: DiscoveryConfig,
    socket: Option<UdpSocket>,
    product_name: String,
    include_local: bool,
    /// In discovery order.
    servers: Vec<(Uuid, Found)>,
    last_query: Option<Instant>,
    events: VecDeque<DiscoveryEvent>,
    buf: Vec<u8>,
}

impl DiscoveryClient {
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self {
            config,
            socket: None,
            product_name: String::new(),
            include_local: false,
            servers: Vec::new(),
            last_query: None,
            events: VecDeque::new(),
            buf: vec![0u8; MAX_PACKET],
        }
    }

    /// Start looking for servers of `product_name`.
    ///
    /// Announces from loopback addresses are ignored unless
    /// `include_local` is set. Calling again while running switches the
    /// product and forgets servers found so far.
    pub fn start(&mut self, product_name: &str, include_local: bool) -> Result<()> {
        validate_name("product name", product_name)?;

        if self.socket.is_some() && self.product_name == product_name {
            self.include_local = include_local;
            return Ok(());
        }
        self.forget_all();

        if self.socket.is_none() {
            let socket = UdpSocket::bind(("0.0.0.0", 0))?;
            socket.set_nonblocking(true)?;
            socket.set_broadcast(true)?;
            self.socket = Some(socket);
        }
        self.product_name = product_name.to_string();
        self.include_local = include_local;
        self.last_query = None;
        tracing::info!(product = product_name, include_local, "discovery client started");

        self.query();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// Stop querying. Every known server is reported lost.
    pub fn stop(&mut self) {
        if self.socket.take().is_none() {
            return;
        }
        self.forget_all();
        tracing::info!(product = %self.product_name, "discovery client stopped");
    }

    /// Servers currently known, in discovery order.
    pub fn servers(&self) -> Vec<DiscoveryInfo> {
        self.servers.iter().map(|(_, f)| f.info.clone()).collect()
    }

    pub fn poll_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.pop_front()
    }

    /// Send a query when due, process answers and expire silent servers.
    pub fn update(&mut self) {
        if self.socket.is_none() {
            return;
        }
        let due = self
            .last_query
            .is_none_or(|t| t.elapsed() >= self.config.query_interval);
        if due {
            self.query();
        }
        self.receive();

        let now = Instant::now();
        let timeout = self.config.server_timeout;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.servers)
            .into_iter()
            .partition(|(_, f)| now.duration_since(f.last_seen) > timeout);
        self.servers = kept;
        for (id, found) in expired {
            tracing::debug!(server = %id, "discovery server timed out");
            self.events.push_back(DiscoveryEvent::ServerLost(found.info));
        }
    }

    fn query(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        let query = Packet::Query {
            product_name: self.product_name.clone(),
        }
        .encode();
        for addr in self.config.query_addrs() {
            if let Err(e) = socket.send_to(&query, addr) {
                tracing::trace!(%addr, error = %e, "query not sent");
            }
        }
        self.last_query = Some(Instant::now());
    }

    fn receive(&mut self) {
        loop {
            let Some(socket) = &self.socket else {
                return;
            };
            let (n, from) = match socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery receive failed");
                    return;
                }
            };
            if from.ip().is_loopback() && !self.include_local {
                continue;
            }

            match Packet::decode(&self.buf[..n]) {
                Some(Packet::Announce(info)) if info.server.product_name() == self.product_name => {
                    self.found(info);
                }
                Some(Packet::Shutdown { product_name, id }) if product_name == self.product_name => {
                    self.lost(id);
                }
                Some(_) => {}
                None => tracing::warn!(%from, size = n, "malformed discovery packet dropped"),
            }
        }
    }

    fn found(&mut self, info: DiscoveryInfo) {
        let id = info.server.id();
        let now = Instant::now();
        if let Some((_, found)) = self.servers.iter_mut().find(|(k, _)| *k == id) {
            found.last_seen = now;
            found.info = info;
            return;
        }
        tracing::debug!(
            server = %id,
            instance = info.server.instance_name(),
            version = %info.server.version(),
            "discovery server found"
        );
        self.events
            .push_back(DiscoveryEvent::ServerFound(info.clone()));
        self.servers.push((
            id,
            Found {
                info,
                last_seen: now,
            },
        ));
    }

    fn lost(&mut self, id: Uuid) {
        if let Some(index) = self.servers.iter().position(|(k, _)| *k == id) {
            let (_, found) = self.servers.remove(index);
            tracing::debug!(server = %id, "discovery server shut down");
            self.events.push_back(DiscoveryEvent::ServerLost(found.info));
        }
    }

    fn forget_all(&mut self) {
        for (_, found) in self.servers.drain(..) {
            self.events.push_back(DiscoveryEvent::ServerLost(found.info));
        }
    }
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new()
    }
}

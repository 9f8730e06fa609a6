//! UDP discovery of servers on the local network.
//!
//! Servers bind the first free port of a small well-known range; clients
//! bind any port and periodically query every port of the range on each
//! target address (the limited broadcast address by default). A server that
//! recognizes its product name answers the querier directly:
//!
//! ```text
//! client                               server
//!   |-- Query(product) --------------->  |  every query_interval
//!   |<-------------- Announce(data, eps) |
//!   |            ...                     |
//!   |<-------------- Shutdown(product,id)|  on stop
//! ```
//!
//! A client forgets a server that sent a shutdown or has not answered for
//! `server_timeout`.
//!
//! ## Packet format
//!
//! ```text
//! header:   "LK" [format version: u8 = 1] [type: u8]
//! name:     [char count: u8] [UCS-2 code unit: u16]...
//! Query:    header, product name
//! Announce: header, product name, instance name, id (16 bytes),
//!           version (4 x u16), [endpoint count: u8] endpoint...
//! endpoint: [4][IPv4: 4 bytes][port: u16] | [6][IPv6: 16 bytes][port: u16]
//! Shutdown: header, product name, id (16 bytes)
//! ```

pub mod client;
pub mod server;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::version::Version;

pub use client::{DiscoveryClient, DiscoveryEvent};
pub use server::DiscoveryServer;

/// Longest product or instance name, in UCS-2 characters.
pub const MAX_NAME_LENGTH: usize = 32;

/// Most connection end points one announce can carry.
pub const MAX_END_POINTS: usize = 255;

const MAGIC: [u8; 2] = *b"LK";
const FORMAT_VERSION: u8 = 1;
const MAX_PACKET: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// First port of the server port range.
    pub port: u16,
    /// Number of consecutive ports servers may bind.
    pub port_range: u16,
    /// Addresses queries are sent to.
    pub targets: Vec<IpAddr>,
    pub query_interval: Duration,
    /// Silence after which a client forgets a server.
    pub server_timeout: Duration,
}

impl DiscoveryConfig {
    /// Every `target:port` a query goes to.
    pub(crate) fn query_addrs(&self) -> Vec<SocketAddr> {
        self.targets
            .iter()
            .flat_map(|ip| self.ports().map(move |port| SocketAddr::new(*ip, port)))
            .collect()
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = u16> + use<> {
        let first = self.port;
        let count = self.port_range.max(1);
        (0..count).filter_map(move |i| first.checked_add(i))
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 9051,
            port_range: 8,
            targets: vec![IpAddr::V4(Ipv4Addr::BROADCAST)],
            query_interval: Duration::from_millis(250),
            server_timeout: Duration::from_secs(3),
        }
    }
}

/// Identity a server announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerData {
    product_name: String,
    instance_name: String,
    id: Uuid,
    version: Version,
}

impl ServerData {
    /// Fails if a name is empty, longer than [`MAX_NAME_LENGTH`] characters
    /// or uses characters outside the Basic Multilingual Plane, or if a
    /// version component exceeds 65535.
    pub fn new(product_name: &str, instance_name: &str, id: Uuid, version: Version) -> Result<Self> {
        validate_name("product name", product_name)?;
        validate_name("instance name", instance_name)?;
        if !version.fits_u16() {
            return Err(LinkError::InvalidVersion(version));
        }
        Ok(Self {
            product_name: product_name.to_string(),
            instance_name: instance_name.to_string(),
            id,
            version,
        })
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// A discovered server and the addresses it accepts connections on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub server: ServerData,
    pub end_points: Vec<SocketAddr>,
}

pub(crate) fn validate_name(field: &'static str, name: &str) -> Result<()> {
    if name.chars().any(|c| u32::from(c) > 0xFFFF) {
        return Err(LinkError::InvalidName {
            field,
            reason: "must be representable as UCS-2",
        });
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(LinkError::InvalidName {
            field,
            reason: "must not exceed 32 characters",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Query {
        product_name: String,
    },
    Announce(DiscoveryInfo),
    Shutdown {
        product_name: String,
        id: Uuid,
    },
}

impl Packet {
    const QUERY: u8 = 1;
    const ANNOUNCE: u8 = 2;
    const SHUTDOWN: u8 = 3;

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        match self {
            Self::Query { product_name } => {
                out.push(Self::QUERY);
                write_name(&mut out, product_name);
            }
            Self::Announce(info) => {
                out.push(Self::ANNOUNCE);
                write_name(&mut out, &info.server.product_name);
                write_name(&mut out, &info.server.instance_name);
                out.extend_from_slice(info.server.id.as_bytes());
                info.server.version.write_u16s(&mut out);
                out.push(info.end_points.len().min(MAX_END_POINTS) as u8);
                for ep in info.end_points.iter().take(MAX_END_POINTS) {
                    match ep.ip() {
                        IpAddr::V4(ip) => {
                            out.push(4);
                            out.extend_from_slice(&ip.octets());
                        }
                        IpAddr::V6(ip) => {
                            out.push(6);
                            out.extend_from_slice(&ip.octets());
                        }
                    }
                    out.extend_from_slice(&ep.port().to_be_bytes());
                }
            }
            Self::Shutdown { product_name, id } => {
                out.push(Self::SHUTDOWN);
                write_name(&mut out, product_name);
                out.extend_from_slice(id.as_bytes());
            }
        }
        out
    }

    /// `None` for anything that is not a well-formed discovery packet.
    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        let mut r = Reader { data, pos: 0 };
        if r.take(2)? != MAGIC || r.u8()? != FORMAT_VERSION {
            return None;
        }
        let packet = match r.u8()? {
            Self::QUERY => Self::Query {
                product_name: r.name()?,
            },
            Self::ANNOUNCE => {
                let product_name = r.name()?;
                let instance_name = r.name()?;
                let id = r.uuid()?;
                let version = Version::from_u16s([r.u16()?, r.u16()?, r.u16()?, r.u16()?]);
                let server = ServerData::new(&product_name, &instance_name, id, version).ok()?;
                let count = r.u8()?;
                let end_points = (0..count)
                    .map(|_| r.end_point())
                    .collect::<Option<Vec<_>>>()?;
                Self::Announce(DiscoveryInfo { server, end_points })
            }
            Self::SHUTDOWN => Self::Shutdown {
                product_name: r.name()?,
                id: r.uuid()?,
            },
            _ => return None,
        };
        (r.pos == data.len()).then_some(packet)
    }
}

/// Names are validated before they reach the encoder.
fn write_name(out: &mut Vec<u8>, name: &str) {
    let units: Vec<u16> = name.encode_utf16().take(MAX_NAME_LENGTH).collect();
    out.push(units.len() as u8);
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn uuid(&mut self) -> Option<Uuid> {
        Uuid::from_slice(self.take(16)?).ok()
    }

    fn name(&mut self) -> Option<String> {
        let count = usize::from(self.u8()?);
        if count > MAX_NAME_LENGTH {
            return None;
        }
        let units = (0..count)
            .map(|_| self.u16())
            .collect::<Option<Vec<u16>>>()?;
        String::from_utf16(&units).ok()
    }

    fn end_point(&mut self) -> Option<SocketAddr> {
        let ip = match self.u8()? {
            4 => {
                let b: [u8; 4] = self.take(4)?.try_into().ok()?;
                IpAddr::V4(Ipv4Addr::from(b))
            }
            6 => {
                let b: [u8; 16] = self.take(16)?.try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(b))
            }
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.u16()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_PRODUCT: &str = "TestProduct 09 -@#$% ばか (バカ).";
    const VALID_INSTANCE: &str = "TestInstance 09 -@#$% бвгдж.";
    const INVALID_NAME: &str = "This name is longer than 32 characters!";

    fn data() -> ServerData {
        ServerData::new(VALID_PRODUCT, VALID_INSTANCE, Uuid::nil(), Version::new(1, 1, 1, 1)).unwrap()
    }

    #[test]
    fn server_data_validation() {
        let valid = u32::from(u16::MAX) / 2;
        let invalid = u32::from(u16::MAX) * 2;

        assert!(ServerData::new(INVALID_NAME, VALID_INSTANCE, Uuid::nil(), Version::default()).is_err());
        assert!(ServerData::new(VALID_PRODUCT, INVALID_NAME, Uuid::nil(), Version::default()).is_err());
        // Only length and character range are restricted.
        let unnamed = ServerData::new("", "", Uuid::nil(), Version::default()).unwrap();
        assert_eq!(unnamed.product_name(), "");
        assert!(ServerData::new(&"x".repeat(32), VALID_INSTANCE, Uuid::nil(), Version::default()).is_ok());
        assert!(matches!(
            ServerData::new("\u{1F3A5}", VALID_INSTANCE, Uuid::nil(), Version::default()),
            Err(LinkError::InvalidName { field: "product name", .. })
        ));

        for i in 0..4 {
            let mut c = [valid; 4];
            c[i] = invalid;
            assert!(matches!(
                ServerData::new(VALID_PRODUCT, VALID_INSTANCE, Uuid::nil(), Version::new(c[0], c[1], c[2], c[3])),
                Err(LinkError::InvalidVersion(_))
            ));
        }
        assert!(
            ServerData::new(VALID_PRODUCT, VALID_INSTANCE, Uuid::nil(), Version::new(valid, valid, valid, valid))
                .is_ok()
        );
    }

    #[test]
    fn announce_round_trip() {
        let info = DiscoveryInfo {
            server: data(),
            end_points: vec![
                "192.168.1.20:9000".parse().unwrap(),
                "[fe80::1]:9000".parse().unwrap(),
            ],
        };
        let packet = Packet::Announce(info.clone());
        assert_eq!(Packet::decode(&packet.encode()), Some(Packet::Announce(info)));
    }

    #[test]
    fn query_layout() {
        let bytes = Packet::Query {
            product_name: "Cam".to_string(),
        }
        .encode();
        assert_eq!(bytes, [b'L', b'K', 1, 1, 3, 0, b'C', 0, b'a', 0, b'm']);
    }

    #[test]
    fn rejects_foreign_and_truncated_packets() {
        let bytes = Packet::Shutdown {
            product_name: VALID_PRODUCT.to_string(),
            id: Uuid::new_v4(),
        }
        .encode();
        assert!(Packet::decode(&bytes).is_some());
        assert!(Packet::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(Packet::decode(b"RTSP/1.0 200 OK").is_none());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(Packet::decode(&trailing).is_none());
    }

    #[test]
    fn query_targets_cover_port_range() {
        let config = DiscoveryConfig {
            port: 9051,
            port_range: 3,
            targets: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            ..Default::default()
        };
        let addrs = config.query_addrs();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[2], "127.0.0.1:9053".parse().unwrap());
    }
}

use std::io;
use std::net::{SocketAddr, UdpSocket};

use uuid::Uuid;

use crate::error::Result;

/// Largest message accepted on the unreliable channel.
pub const MAX_UNRELIABLE_PAYLOAD: usize = 65_435;

const DATAGRAM_MAGIC: u8 = 0xC1;
const DATAGRAM_HEADER_SIZE: usize = 17;
const MAX_DATAGRAM: usize = 65_535;

/// Unreliable unordered channel.
///
/// Each message travels as one datagram tagged with the sender's endpoint
/// id, so the receiver can attribute it to a connected remote:
///
/// ```text
/// [0xC1][sender id: 16 bytes][payload]
/// ```
///
/// The socket is bound to the same port number as the TCP listener (server)
/// or the requested local port (client) and is never blocking.
#[derive(Debug)]
pub struct UdpChannel {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpChannel {
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn send(&self, sender: Uuid, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
        let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
        datagram.push(DATAGRAM_MAGIC);
        datagram.extend_from_slice(sender.as_bytes());
        datagram.extend_from_slice(payload);
        self.socket.send_to(&datagram, addr)?;
        Ok(())
    }

    /// Receive one datagram, if any is waiting.
    ///
    /// Datagrams without the channel header are dropped and reported as
    /// `Ok(Some)` with `None` contents so the caller keeps draining.
    pub fn recv(&mut self) -> io::Result<Option<Option<(Uuid, Vec<u8>, SocketAddr)>>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((n, from)) => Ok(Some(decode(&self.buf[..n]).map(|(id, p)| (id, p.to_vec(), from)))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Windows reports ICMP port unreachable on the next receive.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(Some(None)),
            Err(e) => Err(e),
        }
    }
}

fn decode(datagram: &[u8]) -> Option<(Uuid, &[u8])> {
    if datagram.len() < DATAGRAM_HEADER_SIZE || datagram[0] != DATAGRAM_MAGIC {
        return None;
    }
    let id = Uuid::from_slice(&datagram[1..DATAGRAM_HEADER_SIZE]).ok()?;
    Some((id, &datagram[DATAGRAM_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn decode_rejects_foreign_datagrams() {
        assert!(decode(&[0xC1; 10]).is_none());
        assert!(decode(&[0x00; 40]).is_none());

        let id = Uuid::new_v4();
        let mut datagram = vec![DATAGRAM_MAGIC];
        datagram.extend_from_slice(id.as_bytes());
        datagram.extend_from_slice(b"abc");
        assert_eq!(decode(&datagram), Some((id, &b"abc"[..])));
    }

    #[test]
    fn loopback_round_trip() {
        let mut a = UdpChannel::bind(0).unwrap();
        let b = UdpChannel::bind(0).unwrap();
        let id = Uuid::new_v4();
        let to = SocketAddr::from(([127, 0, 0, 1], a.local_port().unwrap()));
        b.send(id, &[7; 1000], to).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(Some((sender, payload, _))) = a.recv().unwrap() {
                assert_eq!(sender, id);
                assert_eq!(payload, vec![7; 1000]);
                break;
            }
            assert!(Instant::now() < deadline, "datagram not received");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

//! Reliable ordered channel: length-prefixed frames over TCP.
//!
//! ```text
//! +--------+-------------------+------------------+
//! | kind:8 | length:32 (BE)    | payload ...      |
//! +--------+-------------------+------------------+
//! ```
//!
//! | Kind | Payload                                   |
//! |------|-------------------------------------------|
//! | 1    | Handshake: 16-byte endpoint id, UDP port:16 |
//! | 2    | Data: message bytes                       |
//! | 3    | Heartbeat: empty                          |
//! | 4    | Disconnect: empty, sent on graceful close |

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use uuid::Uuid;

const FRAME_HEADER_SIZE: usize = 5;
const READ_CHUNK: usize = 64 * 1024;
const HANDSHAKE_SIZE: usize = 18;
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake = 1,
    Data = 2,
    Heartbeat = 3,
    Disconnect = 4,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Handshake),
            2 => Some(Self::Data),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Append one frame to `out`.
pub fn encode_frame(kind: FrameKind, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(FRAME_HEADER_SIZE + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Handshake payload announcing the sender's id and UDP port.
pub fn encode_handshake(id: Uuid, udp_port: u16) -> [u8; HANDSHAKE_SIZE] {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    buf[..16].copy_from_slice(id.as_bytes());
    buf[16..].copy_from_slice(&udp_port.to_be_bytes());
    buf
}

pub fn decode_handshake(payload: &[u8]) -> Option<(Uuid, u16)> {
    if payload.len() != HANDSHAKE_SIZE {
        return None;
    }
    let id = Uuid::from_slice(&payload[..16]).ok()?;
    let port = u16::from_be_bytes([payload[16], payload[17]]);
    Some((id, port))
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, if any.
    ///
    /// Fails with `InvalidData` on an unknown kind or a length above the
    /// configured maximum; the connection must be dropped afterwards.
    pub fn next_frame(&mut self) -> io::Result<Option<(FrameKind, Vec<u8>)>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let kind = FrameKind::from_u8(self.buf[0])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown frame kind"))?;
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum message size",
            ));
        }
        if self.buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.buf.drain(..FRAME_HEADER_SIZE + len);
        Ok(Some((kind, payload)))
    }
}

/// Result of pumping a connection's read side.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadState {
    Open,
    Closed,
}

/// Non-blocking framed TCP connection.
///
/// Writes are buffered and drained by [`flush`](Self::flush); reads are
/// decoded into frames by [`poll_read`](Self::poll_read). Both update the
/// activity timestamps used for heartbeats and timeouts.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    decoder: FrameDecoder,
    write_buf: Vec<u8>,
    last_received: Instant,
    last_sent: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, max_payload: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let now = Instant::now();
        Ok(Self {
            stream,
            peer_addr,
            decoder: FrameDecoder::new(max_payload + FRAME_HEADER_SIZE),
            write_buf: Vec::new(),
            last_received: now,
            last_sent: now,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn queue(&mut self, kind: FrameKind, payload: &[u8]) {
        encode_frame(kind, payload, &mut self.write_buf);
    }

    /// Read everything currently available and append decoded frames to `frames`.
    pub fn poll_read(&mut self, frames: &mut Vec<(FrameKind, Vec<u8>)>) -> io::Result<ReadState> {
        let state = self.fill()?;
        while let Some(frame) = self.decoder.next_frame()? {
            frames.push(frame);
        }
        Ok(state)
    }

    /// Move every byte the socket has ready into the frame decoder.
    pub fn fill(&mut self) -> io::Result<ReadState> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadState::Closed),
                Ok(n) => {
                    self.last_received = Instant::now();
                    self.decoder.extend(&chunk[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Open),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode one buffered frame. Later frames stay buffered for the next
    /// [`poll_read`](Self::poll_read).
    pub fn next_frame(&mut self) -> io::Result<Option<(FrameKind, Vec<u8>)>> {
        self.decoder.next_frame()
    }

    /// Write as much of the pending output as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.write_buf.drain(..n);
                    self.last_sent = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a disconnect frame, give pending output a short blocking window
    /// to drain, then shut the socket down.
    pub fn close(mut self, graceful: bool) {
        if graceful {
            self.queue(FrameKind::Disconnect, &[]);
            let drained = self
                .stream
                .set_nonblocking(false)
                .and_then(|_| self.stream.set_write_timeout(Some(CLOSE_WRITE_TIMEOUT)))
                .and_then(|_| self.stream.write_all(&self.write_buf));
            if let Err(e) = drained {
                tracing::debug!(peer_addr = %self.peer_addr, error = %e, "pending output dropped on close");
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut wire = Vec::new();
        encode_frame(FrameKind::Data, b"hello", &mut wire);
        encode_frame(FrameKind::Heartbeat, &[], &mut wire);

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&wire[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&wire[3..]);
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some((FrameKind::Data, b"hello".to_vec()))
        );
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some((FrameKind::Heartbeat, vec![]))
        );
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_kind_and_oversized_frames() {
        let mut decoder = FrameDecoder::new(4);
        decoder.extend(&[9, 0, 0, 0, 0]);
        assert!(decoder.next_frame().is_err());

        let mut decoder = FrameDecoder::new(4);
        let mut wire = Vec::new();
        encode_frame(FrameKind::Data, &[0; 5], &mut wire);
        decoder.extend(&wire);
        assert_eq!(
            decoder.next_frame().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn handshake_layout() {
        let id = Uuid::new_v4();
        let payload = encode_handshake(id, 9000);
        assert_eq!(&payload[16..], &[0x23, 0x28]);
        assert_eq!(decode_handshake(&payload), Some((id, 9000)));
        assert_eq!(decode_handshake(&payload[..17]), None);
    }
}

use std::time::Duration;

use crate::error::{LinkError, ParseErrorKind, Result};

const FIXED_HEADER_SIZE: usize = 12;
const RTP_VERSION: u8 = 2;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            CSRC list (CC x 32 bits)  /  extension (if X)      |
/// ```
///
/// [`parse`](Self::parse) skips the CSRC list and header extension and
/// strips padding, returning the bare payload that the payload parsers
/// consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Last packet of a frame / access unit (RFC 6184 §5.1, RFC 2435 §3).
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence: 0,
            timestamp: 0,
            ssrc,
        }
    }

    /// Split an RTP packet into its header and payload.
    pub fn parse(packet: &[u8]) -> Result<(Self, &[u8])> {
        if packet.len() < FIXED_HEADER_SIZE {
            return Err(LinkError::too_short(FIXED_HEADER_SIZE, packet.len()));
        }
        let version = packet[0] >> 6;
        if version != RTP_VERSION {
            return Err(LinkError::parse(ParseErrorKind::InvalidRtpHeader(
                "version is not 2",
            )));
        }
        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = usize::from(packet[0] & 0x0F);

        let header = Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7F,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };

        let mut offset = FIXED_HEADER_SIZE + csrc_count * 4;
        if extension {
            // §5.3.1: 16-bit profile field, 16-bit length in 32-bit words
            let words = super::bits::read_u16_be(packet, offset + 2).ok_or(LinkError::parse(
                ParseErrorKind::InvalidRtpHeader("truncated header extension"),
            ))?;
            offset += 4 + usize::from(words) * 4;
        }

        let mut end = packet.len();
        if padding {
            let pad = usize::from(packet[end - 1]);
            if pad == 0 || pad > end {
                return Err(LinkError::parse(ParseErrorKind::InvalidRtpHeader(
                    "invalid padding length",
                )));
            }
            end -= pad;
        }

        if offset > end {
            return Err(LinkError::parse(ParseErrorKind::InvalidRtpHeader(
                "header longer than packet",
            )));
        }
        Ok((header, &packet[offset..end]))
    }

    /// Serialize as a 12-byte fixed header without CSRCs, extension or padding.
    pub fn write(&self) -> [u8; FIXED_HEADER_SIZE] {
        let mut header = [0u8; FIXED_HEADER_SIZE];
        header[0] = RTP_VERSION << 6;
        header[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Time elapsed since `first_timestamp` for a stream clocked at `clock_rate` Hz.
    ///
    /// Uses wrapping arithmetic, so a stream that runs past the 32-bit
    /// timestamp boundary keeps increasing offsets.
    pub fn time_offset(&self, first_timestamp: u32, clock_rate: u32) -> Duration {
        if clock_rate == 0 {
            return Duration::ZERO;
        }
        let ticks = u64::from(self.timestamp.wrapping_sub(first_timestamp));
        Duration::from_nanos(ticks * 1_000_000_000 / u64::from(clock_rate))
    }
}

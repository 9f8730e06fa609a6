use std::time::Duration;

use super::bits::{self, BitReader};
use super::{AacCodecInfo, FrameClock, FrameKind, FrameSink, RawFrame};
use crate::error::{LinkError, ParseErrorKind, Result};

/// MPEG-4 AAC depacketizer (RFC 3640, AAC-hbr / AAC-lbr).
///
/// ```text
/// [AU-headers-length: u16 bits][AU-header]...[padding][AU]...
/// AU-header: [AU-size: size_length][AU-Index / AU-Index-delta]
/// ```
///
/// One frame is emitted per access unit. Interleaving is not reordered:
/// access units are emitted in payload order.
#[derive(Debug)]
pub struct AacPayloadParser {
    info: AacCodecInfo,
    clock: FrameClock,
    sink: FrameSink,
}

impl AacPayloadParser {
    pub fn new(info: AacCodecInfo) -> Self {
        Self {
            info,
            clock: FrameClock::new(),
            sink: FrameSink::default(),
        }
    }

    pub fn set_frame_handler(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        self.sink.set(handler);
    }

    pub fn parse(&mut self, time_offset: Option<Duration>, payload: &[u8], _marker_bit: bool) -> Result<()> {
        let timestamp = self.clock.timestamp(time_offset);
        let kind = FrameKind::Aac {
            config: &self.info.config,
        };

        if self.info.size_length == 0 {
            self.sink.emit(RawFrame {
                timestamp,
                payload,
                kind,
            });
            return Ok(());
        }

        let headers_bits = bits::read_u16_be(payload, 0)
            .ok_or_else(|| LinkError::too_short(2, payload.len()))? as usize;
        let headers_bytes = headers_bits.div_ceil(8);
        let section = payload
            .get(2..2 + headers_bytes)
            .ok_or_else(|| LinkError::parse(ParseErrorKind::MalformedAuHeaders))?;

        let sizes = au_sizes(&self.info, section, headers_bits)?;
        let mut offset = 2 + headers_bytes;
        for size in sizes {
            let au = payload
                .get(offset..offset + size)
                .ok_or_else(|| LinkError::parse(ParseErrorKind::MalformedAuHeaders))?;
            offset += size;
            self.sink.emit(RawFrame {
                timestamp,
                payload: au,
                kind,
            });
        }
        Ok(())
    }

    pub fn reset_state(&mut self) {}
}

fn au_sizes(info: &AacCodecInfo, section: &[u8], headers_bits: usize) -> Result<Vec<usize>> {
    let mut reader = BitReader::new(section);
    let mut consumed = 0usize;
    let mut sizes = Vec::new();

    while consumed < headers_bits {
        let index_bits = if sizes.is_empty() {
            info.index_length
        } else {
            info.index_delta_length
        };
        let header_bits = usize::from(info.size_length) + usize::from(index_bits);
        if consumed + header_bits > headers_bits {
            return Err(LinkError::parse(ParseErrorKind::MalformedAuHeaders));
        }
        let size = reader
            .read_bits(u32::from(info.size_length))
            .ok_or_else(|| LinkError::parse(ParseErrorKind::MalformedAuHeaders))?;
        reader
            .read_bits(u32::from(index_bits))
            .ok_or_else(|| LinkError::parse(ParseErrorKind::MalformedAuHeaders))?;
        consumed += header_bits;
        sizes.push(size as usize);
    }
    Ok(sizes)
}

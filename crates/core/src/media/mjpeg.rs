use std::time::{Duration, SystemTime};

use super::bits;
use super::{FrameClock, FrameKind, FrameSink, RawFrame};
use crate::error::{LinkError, ParseErrorKind, Result};

/// RFC 2435 §3.1 main JPEG header.
const JPEG_HEADER_SIZE: usize = 8;

const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Luma then chroma quantizers for quality 50 (RFC 2435 Appendix A, zigzag order).
const DEFAULT_QUANTIZERS: [u8; 128] = [
    16, 11, 12, 14, 12, 10, 16, 14, 13, 14, 18, 17, 16, 19, 24, 40, //
    26, 24, 22, 22, 24, 49, 35, 37, 29, 40, 58, 51, 61, 60, 57, 51, //
    56, 55, 64, 72, 92, 78, 64, 68, 87, 69, 55, 56, 80, 109, 81, 87, //
    95, 98, 103, 104, 103, 62, 77, 113, 121, 112, 100, 120, 92, 101, 103, 99, //
    17, 18, 18, 24, 21, 24, 47, 26, 26, 47, 99, 66, 56, 66, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, 99, //
];

const LUM_DC_CODELENS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const LUM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const LUM_AC_CODELENS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
const LUM_AC_SYMBOLS: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

const CHM_DC_CODELENS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const CHM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const CHM_AC_CODELENS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
const CHM_AC_SYMBOLS: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

/// Scale the default luma/chroma quantizers by a JPEG quality `factor`.
///
/// Uses the libjpeg scaling: `factor` is clamped to `1..=99`, then
/// `q = 5000 / factor` below 50 and `q = 200 - 2 * factor` otherwise. Each
/// coefficient becomes `(default * q + 50) / 100`, clamped to `1..=255`.
pub fn quantization_tables(factor: i32) -> [u8; 128] {
    let factor = factor.clamp(1, 99);
    let q = if factor < 50 {
        5000 / factor
    } else {
        200 - factor * 2
    };

    let mut tables = [0u8; 128];
    for (out, &default) in tables.iter_mut().zip(DEFAULT_QUANTIZERS.iter()) {
        *out = ((i32::from(default) * q + 50) / 100).clamp(1, 255) as u8;
    }
    tables
}

/// Fields of the RFC 2435 headers that determine the synthesized JFIF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeaderParams {
    kind: u8,
    q: u8,
    width: u16,
    height: u16,
    dri: u16,
}

/// MJPEG RTP depacketizer (RFC 2435).
///
/// Reassembles JPEG fragments into complete JFIF images. RTP/JPEG strips
/// all JPEG headers, so a header is synthesized from the RTP/JPEG fields:
///
/// ```text
/// SOI | APP0 (JFIF 1.1) | [DRI] | DQT x1..2 | SOF0 | DHT x4 | SOS | scan data... | EOI
/// ```
///
/// The synthesized header is cached and only rebuilt when type, Q, width,
/// height, restart interval or the quantization tables change.
///
/// A frame is emitted when a fragment with the marker bit set has been
/// appended, or when a new first fragment arrives while a previous image is
/// still buffered. A fragment carrying a different time offset discards any
/// pending bytes without emitting them.
#[derive(Debug)]
pub struct MjpegPayloadParser {
    clock: FrameClock,
    sink: FrameSink,
    frame: Vec<u8>,
    /// Timestamp of the image being assembled in `frame`.
    frame_timestamp: SystemTime,
    params: Option<HeaderParams>,
    quant_tables: Vec<u8>,
    header: Vec<u8>,
    header_generation: u64,
    previous_offset: Option<Duration>,
}

impl Default for MjpegPayloadParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegPayloadParser {
    pub fn new() -> Self {
        Self {
            clock: FrameClock::new(),
            sink: FrameSink::default(),
            frame: Vec::with_capacity(64 * 1024),
            frame_timestamp: SystemTime::UNIX_EPOCH,
            params: None,
            quant_tables: Vec::new(),
            header: Vec::new(),
            header_generation: 0,
            previous_offset: None,
        }
    }

    pub fn with_clock(mut self, clock: FrameClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_frame_handler(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        self.sink.set(handler);
    }

    /// The currently cached JFIF header.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Number of times the JFIF header has been synthesized.
    pub fn header_generation(&self) -> u64 {
        self.header_generation
    }

    pub fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &[u8],
        marker_bit: bool,
    ) -> Result<()> {
        if payload.len() < JPEG_HEADER_SIZE {
            return Err(LinkError::too_short(JPEG_HEADER_SIZE, payload.len()));
        }
        let timestamp = self.clock.timestamp(time_offset);

        if self.previous_offset != time_offset && !self.frame.is_empty() {
            tracing::trace!(pending = self.frame.len(), "new time offset, discarding partial image");
            self.frame.clear();
        }
        self.previous_offset = time_offset;

        let fragment_offset = bits::read_u24_be(payload, 1).unwrap_or_default();
        let mut params = HeaderParams {
            kind: payload[4],
            q: payload[5],
            width: u16::from(payload[6]) * 8,
            height: u16::from(payload[7]) * 8,
            dri: 0,
        };
        let mut offset = JPEG_HEADER_SIZE;

        // Restart marker header (§3.1.7)
        if params.kind > 63 {
            params.dri = bits::read_u16_be(payload, offset)
                .ok_or_else(|| LinkError::too_short(offset + 2, payload.len()))?;
            offset += 4;
        }
        if offset > payload.len() {
            let size = payload.len() as isize - offset as isize;
            return Err(LinkError::parse(ParseErrorKind::InvalidPayloadSize(size)));
        }

        if fragment_offset == 0 {
            if !self.frame.is_empty() {
                self.generate_frame();
            }

            let mut tables_changed = false;
            // Quantization table header (§3.1.8)
            if params.q > 127 && payload.get(offset) == Some(&0) {
                let length = bits::read_u16_be(payload, offset + 2)
                    .ok_or_else(|| LinkError::too_short(offset + 4, payload.len()))?
                    as usize;
                offset += 4;
                let tables = payload
                    .get(offset..offset + length)
                    .ok_or_else(|| LinkError::too_short(offset + length, payload.len()))?;
                // A zero length means the tables of an earlier frame still apply.
                if length > 0 && tables != self.quant_tables.as_slice() {
                    self.quant_tables.clear();
                    self.quant_tables.extend_from_slice(tables);
                    tables_changed = true;
                }
                offset += length;
            }

            if tables_changed || self.params != Some(params) {
                self.params = Some(params);
                self.rebuild_header(params);
            }
            self.frame.extend_from_slice(&self.header);
            self.frame_timestamp = timestamp;
        }

        if fragment_offset != 0 && self.frame.is_empty() {
            tracing::trace!(fragment_offset, "missed image start, dropping fragment");
            return Ok(());
        }

        self.frame.extend_from_slice(&payload[offset..]);

        if marker_bit {
            self.generate_frame();
        }
        Ok(())
    }

    pub fn reset_state(&mut self) {
        self.frame.clear();
    }

    fn generate_frame(&mut self) {
        if !bits::ends_with(&self.frame, &END_MARKER) {
            self.frame.extend_from_slice(&END_MARKER);
        }
        tracing::trace!(size = self.frame.len(), "jpeg frame complete");
        self.sink.emit(RawFrame {
            timestamp: self.frame_timestamp,
            payload: &self.frame,
            kind: FrameKind::Jpeg,
        });
        self.frame.clear();
    }

    fn rebuild_header(&mut self, params: HeaderParams) {
        // Q values 128..=255 signal in-band tables; keep them once received.
        if params.q <= 127 || self.quant_tables.is_empty() {
            self.quant_tables.clear();
            self.quant_tables
                .extend_from_slice(&quantization_tables(i32::from(params.q)));
        }

        self.header.clear();
        write_jfif_header(&mut self.header, params, &self.quant_tables);
        self.header_generation += 1;
        tracing::debug!(
            kind = params.kind,
            q = params.q,
            width = params.width,
            height = params.height,
            dri = params.dri,
            size = self.header.len(),
            "jpeg header regenerated"
        );
    }
}

fn write_jfif_header(out: &mut Vec<u8>, params: HeaderParams, quant_tables: &[u8]) {
    let table_count = if (quant_tables.len() / 2) * 2 > 64 { 2 } else { 1 };

    out.extend_from_slice(&[0xFF, 0xD8]);
    out.extend_from_slice(&[
        0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00,
        0x01, 0x00, 0x00,
    ]);

    if params.dri > 0 {
        out.extend_from_slice(&[0xFF, 0xDD, 0x00, 0x04]);
        out.extend_from_slice(&params.dri.to_be_bytes());
    }

    if table_count == 1 {
        write_dqt(out, 0, quant_tables);
    } else {
        let (luma, chroma) = quant_tables.split_at(quant_tables.len() / 2);
        write_dqt(out, 0, luma);
        write_dqt(out, 1, chroma);
    }

    let chroma_table = if table_count == 1 { 0x00 } else { 0x01 };
    out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
    out.extend_from_slice(&params.height.to_be_bytes());
    out.extend_from_slice(&params.width.to_be_bytes());
    out.extend_from_slice(&[
        0x03,
        0x01,
        if params.kind & 1 != 0 { 0x22 } else { 0x21 },
        0x00,
        0x02,
        0x11,
        chroma_table,
        0x03,
        0x11,
        chroma_table,
    ]);

    write_dht(out, 0, 0, &LUM_DC_CODELENS, &LUM_DC_SYMBOLS);
    write_dht(out, 0, 1, &LUM_AC_CODELENS, &LUM_AC_SYMBOLS);
    write_dht(out, 1, 0, &CHM_DC_CODELENS, &CHM_DC_SYMBOLS);
    write_dht(out, 1, 1, &CHM_AC_CODELENS, &CHM_AC_SYMBOLS);

    out.extend_from_slice(&[
        0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00,
    ]);
}

fn write_dqt(out: &mut Vec<u8>, table_no: u8, table: &[u8]) {
    out.extend_from_slice(&[0xFF, 0xDB]);
    out.extend_from_slice(&(table.len() as u16 + 3).to_be_bytes());
    out.push(table_no);
    out.extend_from_slice(table);
}

fn write_dht(out: &mut Vec<u8>, table_no: u8, class: u8, codelens: &[u8], symbols: &[u8]) {
    out.extend_from_slice(&[0xFF, 0xC4]);
    out.extend_from_slice(&((3 + codelens.len() + symbols.len()) as u16).to_be_bytes());
    out.push((class << 4) | table_no);
    out.extend_from_slice(codelens);
    out.extend_from_slice(symbols);
}

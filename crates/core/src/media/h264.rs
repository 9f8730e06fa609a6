use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use super::bits::{self, BitReader};
use super::slicer::{self, START_CODE};
use super::{FrameClock, FrameKind, FrameSink, H264CodecInfo, RawFrame};
use crate::error::{LinkError, ParseErrorKind, Result};

const NAL_NON_IDR_SLICE: u8 = 1;
const NAL_IDR_SLICE: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

const NAL_STAP_A: u8 = 24;
const NAL_STAP_B: u8 = 25;
const NAL_MTAP16: u8 = 26;
const NAL_MTAP24: u8 = 27;
const NAL_FU_A: u8 = 28;
const NAL_FU_B: u8 = 29;

/// Header byte plus profile, constraint flags and level precede the SPS id.
const SPS_MIN_SIZE: usize = 5;
/// The PPS id directly follows the header byte.
const PPS_MIN_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Unknown,
    Intra,
    Predicted,
}

impl FrameType {
    fn from_slice_type(slice_type: u32) -> Self {
        match slice_type {
            0 | 5 => Self::Predicted,
            2 | 7 => Self::Intra,
            _ => Self::Unknown,
        }
    }
}

/// H.264 access unit assembler.
///
/// Accepts NAL units either with an Annex-B start code (possibly several in
/// one buffer) or as bare NAL units, tracks SPS/PPS by id, and emits one
/// Annex-B access unit per [`try_generate_frame`](Self::try_generate_frame).
///
/// Units with `nal_ref_idc == 0` and SEI units are not forwarded. Nothing is
/// emitted before the first intra frame, or while no parameter sets are
/// known.
#[derive(Debug)]
pub struct H264Parser {
    sps: BTreeMap<u32, Vec<u8>>,
    pps: BTreeMap<u32, Vec<u8>>,
    sps_pps: Vec<u8>,
    sps_size: usize,
    sps_pps_dirty: bool,
    slice_type: Option<u32>,
    wait_for_intra: bool,
    frame: Vec<u8>,
}

impl Default for H264Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Parser {
    pub fn new() -> Self {
        Self {
            sps: BTreeMap::new(),
            pps: BTreeMap::new(),
            sps_pps: Vec::new(),
            sps_size: 0,
            sps_pps_dirty: false,
            slice_type: None,
            wait_for_intra: true,
            frame: Vec::new(),
        }
    }

    /// Feed one buffer of NAL data.
    ///
    /// When `generate_frame` is set, the buffered access unit is emitted to
    /// `sink` once the buffer has been processed.
    pub fn parse(
        &mut self,
        payload: &[u8],
        generate_frame: bool,
        timestamp: SystemTime,
        sink: &mut FrameSink,
    ) -> Result<()> {
        if bits::starts_with(payload, &START_CODE) {
            for unit in slicer::slices(payload) {
                self.process_nal_unit(unit, true)?;
            }
        } else {
            self.process_nal_unit(payload, false)?;
        }

        if generate_frame {
            self.try_generate_frame(timestamp, sink);
        }
        Ok(())
    }

    /// Register out-of-band parameter sets given in Annex-B form.
    ///
    /// Units other than SPS and PPS are ignored.
    pub fn add_parameter_sets(&mut self, annex_b: &[u8]) -> Result<()> {
        let mut start = bits::index_of(annex_b, &START_CODE, 0);
        while let Some(s) = start {
            let body = s + START_CODE.len();
            let next = bits::index_of(annex_b, &START_CODE, body);
            let unit = &annex_b[body..next.unwrap_or(annex_b.len())];
            match unit.first().map(|h| h & 0x1F) {
                Some(NAL_SPS) | Some(NAL_PPS) => self.process_nal_unit(unit, false)?,
                _ => {}
            }
            start = next;
        }
        Ok(())
    }

    /// Emit the buffered access unit, if it can be emitted, and clear the buffer.
    pub fn try_generate_frame(&mut self, timestamp: SystemTime, sink: &mut FrameSink) {
        if self.frame.is_empty() {
            return;
        }
        self.rebuild_parameter_sets();

        let Some(slice_type) = self.slice_type else {
            tracing::trace!("no slice header seen, dropping access unit");
            self.frame.clear();
            return;
        };
        if self.sps_pps.is_empty() {
            tracing::trace!("no parameter sets known, dropping access unit");
            self.frame.clear();
            return;
        }

        let frame_type = FrameType::from_slice_type(slice_type);
        self.slice_type = None;

        let kind = match frame_type {
            FrameType::Predicted if !self.wait_for_intra => FrameKind::H264Predicted,
            FrameType::Intra => {
                self.wait_for_intra = false;
                FrameKind::H264Intra {
                    sps_pps: &self.sps_pps,
                    sps_size: self.sps_size,
                }
            }
            _ => {
                tracing::trace!(slice_type, "waiting for intra frame");
                self.frame.clear();
                return;
            }
        };

        sink.emit(RawFrame {
            timestamp,
            payload: &self.frame,
            kind,
        });
        self.frame.clear();
    }

    /// Drop the partial access unit and wait for the next intra frame.
    /// Known parameter sets are kept.
    pub fn reset_state(&mut self) {
        self.frame.clear();
        self.slice_type = None;
        self.wait_for_intra = true;
    }

    /// SPS units followed by PPS units, each with a start code.
    pub fn parameter_sets(&mut self) -> &[u8] {
        self.rebuild_parameter_sets();
        &self.sps_pps
    }

    /// Byte length of the SPS part of [`parameter_sets`](Self::parameter_sets).
    pub fn sps_size(&mut self) -> usize {
        self.rebuild_parameter_sets();
        self.sps_size
    }

    fn process_nal_unit(&mut self, unit: &[u8], has_start_code: bool) -> Result<()> {
        let offset = if has_start_code { START_CODE.len() } else { 0 };
        let nal = &unit[offset.min(unit.len())..];
        let Some(&header) = nal.first() else {
            return Err(LinkError::too_short(offset + 1, unit.len()));
        };

        let nal_type = header & 0x1F;
        if !(1..24).contains(&nal_type) {
            return Err(LinkError::parse(ParseErrorKind::InvalidNalUnitType(nal_type)));
        }

        match nal_type {
            NAL_SPS => {
                self.update_parameter_set(nal, SPS_MIN_SIZE);
                return Ok(());
            }
            NAL_PPS => {
                self.update_parameter_set(nal, PPS_MIN_SIZE);
                return Ok(());
            }
            NAL_NON_IDR_SLICE | NAL_IDR_SLICE if self.slice_type.is_none() => {
                self.slice_type = read_slice_type(nal);
            }
            _ => {}
        }

        let nri = (header >> 5) & 0x3;
        if nri == 0 || nal_type == NAL_SEI {
            return Ok(());
        }

        if !has_start_code {
            self.frame.extend_from_slice(&START_CODE);
        }
        self.frame.extend_from_slice(unit);
        Ok(())
    }

    fn update_parameter_set(&mut self, nal: &[u8], min_size: usize) {
        if nal.len() < min_size {
            tracing::trace!(len = nal.len(), min_size, "parameter set too short");
            return;
        }
        let Some(id) = BitReader::new(&nal[min_size - 1..]).read_ue() else {
            tracing::trace!("unreadable parameter set id");
            return;
        };

        let table = if nal[0] & 0x1F == NAL_SPS {
            &mut self.sps
        } else {
            &mut self.pps
        };
        if table.get(&id).is_some_and(|known| known.as_slice() == nal) {
            return;
        }
        table.insert(id, nal.to_vec());
        self.sps_pps_dirty = true;
        tracing::debug!(nal_type = nal[0] & 0x1F, id, len = nal.len(), "parameter set updated");
    }

    fn rebuild_parameter_sets(&mut self) {
        if !self.sps_pps_dirty {
            return;
        }
        self.sps_pps.clear();
        for sps in self.sps.values() {
            self.sps_pps.extend_from_slice(&START_CODE);
            self.sps_pps.extend_from_slice(sps);
        }
        self.sps_size = self.sps_pps.len();
        for pps in self.pps.values() {
            self.sps_pps.extend_from_slice(&START_CODE);
            self.sps_pps.extend_from_slice(pps);
        }
        self.sps_pps_dirty = false;
    }
}

/// `slice_type` from a slice header: skip `first_mb_in_slice`, read `slice_type`.
fn read_slice_type(nal: &[u8]) -> Option<u32> {
    let mut reader = BitReader::new(nal.get(1..)?);
    reader.read_ue()?;
    reader.read_ue()
}

/// H.264 RTP depacketizer (RFC 6184).
///
/// Handles single NAL unit packets (§5.6), STAP-A aggregation (§5.7.1) and
/// FU-A fragmentation (§5.8). Payloads that already carry Annex-B start
/// codes are passed through to the [`H264Parser`] as-is.
///
/// ```text
/// FU indicator:  [F|NRI|Type=28]
/// FU header:     [S|E|R|NAL_Type]
/// ```
///
/// STAP-B, MTAP16, MTAP24 and FU-B are rejected with
/// [`ParseErrorKind::UnsupportedPacketization`].
///
/// An access unit is emitted when a packet with the marker bit set has been
/// processed.
#[derive(Debug)]
pub struct H264PayloadParser {
    parser: H264Parser,
    clock: FrameClock,
    sink: FrameSink,
    fragment: Vec<u8>,
    in_fragment: bool,
}

impl H264PayloadParser {
    /// Create a parser seeded with the out-of-band parameter sets of `info`.
    pub fn new(info: &H264CodecInfo) -> Result<Self> {
        let mut parser = H264Parser::new();
        parser.add_parameter_sets(&info.sps_pps)?;
        Ok(Self {
            parser,
            clock: FrameClock::new(),
            sink: FrameSink::default(),
            fragment: Vec::new(),
            in_fragment: false,
        })
    }

    pub fn with_clock(mut self, clock: FrameClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_frame_handler(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        self.sink.set(handler);
    }

    pub fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &[u8],
        marker_bit: bool,
    ) -> Result<()> {
        let timestamp = self.clock.timestamp(time_offset);
        let Some(&indicator) = payload.first() else {
            return Err(LinkError::too_short(1, 0));
        };

        if bits::starts_with(payload, &START_CODE) {
            return self
                .parser
                .parse(payload, marker_bit, timestamp, &mut self.sink);
        }

        match indicator & 0x1F {
            NAL_STAP_A => self.parse_stap_a(payload, marker_bit, timestamp),
            NAL_FU_A => self.parse_fu_a(payload, marker_bit, timestamp),
            t @ (NAL_STAP_B | NAL_MTAP16 | NAL_MTAP24 | NAL_FU_B) => Err(LinkError::parse(
                ParseErrorKind::UnsupportedPacketization(t),
            )),
            _ => self
                .parser
                .parse(payload, marker_bit, timestamp, &mut self.sink),
        }
    }

    pub fn reset_state(&mut self) {
        self.parser.reset_state();
        self.fragment.clear();
        self.in_fragment = false;
    }

    /// `[STAP-A hdr][size u16][NALU][size u16][NALU]...`
    fn parse_stap_a(&mut self, payload: &[u8], marker_bit: bool, timestamp: SystemTime) -> Result<()> {
        let mut offset = 1;
        while offset < payload.len() {
            let size = bits::read_u16_be(payload, offset)
                .ok_or_else(|| LinkError::too_short(offset + 2, payload.len()))?
                as usize;
            offset += 2;
            let unit = payload
                .get(offset..offset + size)
                .ok_or_else(|| LinkError::too_short(offset + size, payload.len()))?;
            if !unit.is_empty() {
                self.parser.parse(unit, false, timestamp, &mut self.sink)?;
            }
            offset += size;
        }

        if marker_bit {
            self.parser.try_generate_frame(timestamp, &mut self.sink);
        }
        Ok(())
    }

    fn parse_fu_a(&mut self, payload: &[u8], marker_bit: bool, timestamp: SystemTime) -> Result<()> {
        if payload.len() < 2 {
            return Err(LinkError::too_short(2, payload.len()));
        }
        let indicator = payload[0];
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            self.fragment.clear();
            self.fragment.push((indicator & 0xE0) | (header & 0x1F));
            self.in_fragment = true;
        } else if !self.in_fragment {
            tracing::trace!("FU-A continuation without start, dropping");
            return Ok(());
        }

        self.fragment.extend_from_slice(&payload[2..]);

        if end {
            self.in_fragment = false;
            self.parser
                .parse(&self.fragment, marker_bit, timestamp, &mut self.sink)?;
            self.fragment.clear();
        } else if marker_bit {
            tracing::trace!("marker bit on unfinished FU-A, dropping fragment");
            self.fragment.clear();
            self.in_fragment = false;
        }
        Ok(())
    }
}

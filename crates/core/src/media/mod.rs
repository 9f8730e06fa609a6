//! RTP payload depacketization and frame reconstruction.
//!
//! Each payload parser consumes the payload of one RTP packet at a time and
//! emits zero or more [`RawFrame`]s to its registered handler:
//!
//! ```text
//! RTP payload + time offset + marker bit
//!        │
//!        ▼
//! PayloadParser (per codec) ──► RawFrame { timestamp, payload, kind } ──► frame sink
//! ```
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | MJPEG | [`mjpeg`] | [RFC 2435](https://tools.ietf.org/html/rfc2435) |
//! | AAC | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) |
//! | G.711 / G.726 / PCM | [`audio`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) |
//!
//! ## Buffer ownership
//!
//! Video parsers own a growable accumulation buffer that is reused across
//! frames. Emitted frames borrow from it, so a [`RawFrame`] is only valid for
//! the duration of the handler call; copy the payload out if it must outlive
//! the call.
//!
//! Parsers are single-writer state: one parser per stream, fed from one
//! thread at a time.

pub mod aac;
pub mod audio;
pub mod bits;
pub mod codec;
pub mod h264;
pub mod mjpeg;
pub mod rtp;
pub mod sdp;
pub mod slicer;

use std::fmt;
use std::time::{Duration, SystemTime};

pub use codec::{
    AacCodecInfo, CodecInfo, G711CodecInfo, G711Law, G726CodecInfo, H264CodecInfo, PcmCodecInfo,
};

use crate::error::Result;
use aac::AacPayloadParser;
use audio::{G711PayloadParser, G726PayloadParser, PcmPayloadParser};
use h264::H264PayloadParser;
use mjpeg::MjpegPayloadParser;

/// A fully reconstructed media frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    /// Absolute presentation time.
    pub timestamp: SystemTime,
    /// Encoded frame bytes (Annex-B access unit, complete JPEG, audio samples).
    pub payload: &'a [u8],
    pub kind: FrameKind<'a>,
}

/// Codec-specific frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    /// H.264 intra frame, with every known SPS and PPS attached so a decoder
    /// can initialize from this frame alone.
    H264Intra {
        /// Annex-B SPS NAL units followed by Annex-B PPS NAL units.
        sps_pps: &'a [u8],
        /// Byte length of the SPS part of `sps_pps`.
        sps_size: usize,
    },
    /// H.264 prediction frame.
    H264Predicted,
    /// Complete JFIF image (SOI to EOI).
    Jpeg,
    /// One AAC access unit.
    Aac { config: &'a [u8] },
    G711 {
        law: G711Law,
        sample_rate: u32,
        channels: u16,
    },
    G726 {
        bits_per_coded_sample: u32,
        sample_rate: u32,
        channels: u16,
    },
    Pcm {
        sample_rate: u32,
        bits_per_sample: u16,
        channels: u16,
    },
}

/// Callback receiving every frame a parser emits.
pub type FrameHandler = Box<dyn for<'a> FnMut(RawFrame<'a>) + Send>;

/// Holder for an optional [`FrameHandler`].
#[derive(Default)]
pub struct FrameSink {
    handler: Option<FrameHandler>,
}

impl FrameSink {
    pub fn new(handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) -> Self {
        Self {
            handler: Some(Box::new(handler)),
        }
    }

    pub fn set(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Hand `frame` to the handler. Frames are dropped if none is set.
    pub fn emit(&mut self, frame: RawFrame<'_>) {
        if let Some(handler) = self.handler.as_mut() {
            handler(frame);
        }
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Maps RTP time offsets to absolute timestamps.
///
/// The base time is latched from the wall clock the first time a known
/// offset is resolved. An unknown offset (`None`) maps to "now".
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameClock {
    base: Option<SystemTime>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a fixed base, for deterministic timestamps.
    pub fn with_base(base: SystemTime) -> Self {
        Self { base: Some(base) }
    }

    pub fn base(&self) -> Option<SystemTime> {
        self.base
    }

    pub fn timestamp(&mut self, offset: Option<Duration>) -> SystemTime {
        match offset {
            None => SystemTime::now(),
            Some(offset) => resolve(offset, *self.base.get_or_insert_with(SystemTime::now)),
        }
    }
}

/// Absolute time of a frame `offset` after `base`.
pub fn resolve(offset: Duration, base: SystemTime) -> SystemTime {
    base + offset
}

/// Payload parser for one negotiated codec.
///
/// The set of codecs is closed, so dispatch is a `match` over this enum.
#[derive(Debug)]
pub enum PayloadParser {
    H264(H264PayloadParser),
    Mjpeg(MjpegPayloadParser),
    Aac(AacPayloadParser),
    G711(G711PayloadParser),
    G726(G726PayloadParser),
    Pcm(PcmPayloadParser),
}

impl PayloadParser {
    /// Build the parser matching `codec`.
    ///
    /// Fails only if H.264 out-of-band parameter sets are malformed.
    pub fn from_codec(codec: &CodecInfo) -> Result<Self> {
        tracing::debug!(codec = codec.name(), "creating payload parser");
        Ok(match codec {
            CodecInfo::H264(info) => Self::H264(H264PayloadParser::new(info)?),
            CodecInfo::Mjpeg => Self::Mjpeg(MjpegPayloadParser::new()),
            CodecInfo::Aac(info) => Self::Aac(AacPayloadParser::new(info.clone())),
            CodecInfo::G711(info) => Self::G711(G711PayloadParser::new(*info)),
            CodecInfo::G726(info) => Self::G726(G726PayloadParser::new(*info)),
            CodecInfo::Pcm(info) => Self::Pcm(PcmPayloadParser::new(*info)),
        })
    }

    /// Consume one RTP payload.
    ///
    /// `time_offset` is the stream-relative RTP time, or `None` if unknown.
    /// `marker_bit` is the RTP marker, which closes an access unit / image.
    ///
    /// On error the caller should [`reset_state`](Self::reset_state) before
    /// feeding further payloads.
    pub fn parse(
        &mut self,
        time_offset: Option<Duration>,
        payload: &[u8],
        marker_bit: bool,
    ) -> Result<()> {
        match self {
            Self::H264(p) => p.parse(time_offset, payload, marker_bit),
            Self::Mjpeg(p) => p.parse(time_offset, payload, marker_bit),
            Self::Aac(p) => p.parse(time_offset, payload, marker_bit),
            Self::G711(p) => p.parse(time_offset, payload, marker_bit),
            Self::G726(p) => p.parse(time_offset, payload, marker_bit),
            Self::Pcm(p) => p.parse(time_offset, payload, marker_bit),
        }
    }

    /// Discard any partially assembled frame.
    pub fn reset_state(&mut self) {
        match self {
            Self::H264(p) => p.reset_state(),
            Self::Mjpeg(p) => p.reset_state(),
            Self::Aac(p) => p.reset_state(),
            Self::G711(p) => p.reset_state(),
            Self::G726(p) => p.reset_state(),
            Self::Pcm(p) => p.reset_state(),
        }
    }

    pub fn set_frame_handler(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        match self {
            Self::H264(p) => p.set_frame_handler(handler),
            Self::Mjpeg(p) => p.set_frame_handler(handler),
            Self::Aac(p) => p.set_frame_handler(handler),
            Self::G711(p) => p.set_frame_handler(handler),
            Self::G726(p) => p.set_frame_handler(handler),
            Self::Pcm(p) => p.set_frame_handler(handler),
        }
    }
}

//! 1:1 audio payload parsers (RFC 3551).
//!
//! Every RTP payload is one audio frame. These parsers hold no reassembly
//! state, so `reset_state` is a no-op.

use std::time::Duration;

use super::{FrameClock, FrameKind, FrameSink, G711CodecInfo, G726CodecInfo, PcmCodecInfo, RawFrame};
use crate::error::Result;

/// G.711 mu-law / A-law parser.
#[derive(Debug)]
pub struct G711PayloadParser {
    info: G711CodecInfo,
    clock: FrameClock,
    sink: FrameSink,
}

impl G711PayloadParser {
    pub fn new(info: G711CodecInfo) -> Self {
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
        self.sink.emit(RawFrame {
            timestamp,
            payload,
            kind: FrameKind::G711 {
                law: self.info.law,
                sample_rate: self.info.sample_rate,
                channels: self.info.channels,
            },
        });
        Ok(())
    }

    pub fn reset_state(&mut self) {}
}

/// G.726 ADPCM parser.
#[derive(Debug)]
pub struct G726PayloadParser {
    info: G726CodecInfo,
    clock: FrameClock,
    sink: FrameSink,
}

impl G726PayloadParser {
    pub fn new(info: G726CodecInfo) -> Self {
        Self {
            info,
            clock: FrameClock::new(),
            sink: FrameSink::default(),
        }
    }

    pub fn set_frame_handler(&mut self, handler: impl for<'a> FnMut(RawFrame<'a>) + Send + 'static) {
        self.sink.set(handler);
    }

    /// Bits per coded sample, e.g. 4 for G.726-32 at 8 kHz.
    pub fn bits_per_coded_sample(&self) -> u32 {
        self.info
            .bitrate
            .checked_div(self.info.sample_rate)
            .unwrap_or_default()
    }

    pub fn parse(&mut self, time_offset: Option<Duration>, payload: &[u8], _marker_bit: bool) -> Result<()> {
        let timestamp = self.clock.timestamp(time_offset);
        let bits_per_coded_sample = self.bits_per_coded_sample();
        self.sink.emit(RawFrame {
            timestamp,
            payload,
            kind: FrameKind::G726 {
                bits_per_coded_sample,
                sample_rate: self.info.sample_rate,
                channels: self.info.channels,
            },
        });
        Ok(())
    }

    pub fn reset_state(&mut self) {}
}

/// Linear PCM (L8 / L16 / L24) parser.
#[derive(Debug)]
pub struct PcmPayloadParser {
    info: PcmCodecInfo,
    clock: FrameClock,
    sink: FrameSink,
}

impl PcmPayloadParser {
    pub fn new(info: PcmCodecInfo) -> Self {
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
        self.sink.emit(RawFrame {
            timestamp,
            payload,
            kind: FrameKind::Pcm {
                sample_rate: self.info.sample_rate,
                bits_per_sample: self.info.bits_per_sample,
                channels: self.info.channels,
            },
        });
        Ok(())
    }

    pub fn reset_state(&mut self) {}
}

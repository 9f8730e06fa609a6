//! Negotiated codec parameters.
//!
//! [`CodecInfo`] is a closed set: every variant has exactly one payload
//! parser, selected by [`PayloadParser::from_codec`](super::PayloadParser::from_codec).

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::slicer::START_CODE;
use crate::error::{LinkError, Result};

/// Codec parameters negotiated for one RTP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecInfo {
    H264(H264CodecInfo),
    Mjpeg,
    Aac(AacCodecInfo),
    G711(G711CodecInfo),
    G726(G726CodecInfo),
    Pcm(PcmCodecInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H264CodecInfo {
    /// Out-of-band parameter sets in Annex-B form (each prefixed with a
    /// start code), usually decoded from `sprop-parameter-sets`.
    pub sps_pps: Vec<u8>,
}

/// AAC-hbr parameters (RFC 3640 §3.3.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AacCodecInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// AudioSpecificConfig (ISO/IEC 14496-3).
    pub config: Vec<u8>,
    pub size_length: u8,
    pub index_length: u8,
    pub index_delta_length: u8,
}

impl AacCodecInfo {
    /// AAC-hbr defaults: 13-bit sizes, 3-bit indices.
    pub fn hbr(sample_rate: u32, channels: u16, config: Vec<u8>) -> Self {
        Self {
            sample_rate,
            channels,
            config,
            size_length: 13,
            index_length: 3,
            index_delta_length: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    MuLaw,
    ALaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct G711CodecInfo {
    pub law: G711Law,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct G726CodecInfo {
    /// Bits per second (16000, 24000, 32000 or 40000).
    pub bitrate: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmCodecInfo {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl CodecInfo {
    /// Map an SDP `a=rtpmap` encoding (plus optional `a=fmtp` parameters) to
    /// codec parameters.
    ///
    /// Unknown encodings fail with [`LinkError::UnsupportedCodec`].
    pub fn from_rtpmap(
        encoding: &str,
        clock_rate: u32,
        channels: Option<u16>,
        fmtp: Option<&str>,
    ) -> Result<Self> {
        let channels = channels.unwrap_or(1);
        let upper = encoding.to_ascii_uppercase();

        let info = match upper.as_str() {
            "H264" => {
                let mut sps_pps = Vec::new();
                if let Some(sets) = fmtp_value(fmtp, "sprop-parameter-sets") {
                    for set in sets.split(',').filter(|s| !s.is_empty()) {
                        match BASE64_STANDARD.decode(set) {
                            Ok(nal) => {
                                sps_pps.extend_from_slice(&START_CODE);
                                sps_pps.extend_from_slice(&nal);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "ignoring undecodable sprop-parameter-set")
                            }
                        }
                    }
                }
                CodecInfo::H264(H264CodecInfo { sps_pps })
            }
            "JPEG" => CodecInfo::Mjpeg,
            "MPEG4-GENERIC" => {
                let config = fmtp_value(fmtp, "config")
                    .and_then(|c| hex::decode(c).ok())
                    .unwrap_or_default();
                let mut info = AacCodecInfo::hbr(clock_rate, channels, config);
                if let Some(v) = fmtp_number(fmtp, "sizelength") {
                    info.size_length = v;
                }
                if let Some(v) = fmtp_number(fmtp, "indexlength") {
                    info.index_length = v;
                }
                if let Some(v) = fmtp_number(fmtp, "indexdeltalength") {
                    info.index_delta_length = v;
                }
                CodecInfo::Aac(info)
            }
            "PCMU" | "PCMA" => CodecInfo::G711(G711CodecInfo {
                law: if upper == "PCMU" {
                    G711Law::MuLaw
                } else {
                    G711Law::ALaw
                },
                sample_rate: clock_rate,
                channels,
            }),
            "L8" | "L16" | "L24" => CodecInfo::Pcm(PcmCodecInfo {
                sample_rate: clock_rate,
                bits_per_sample: upper[1..].parse().unwrap_or(16),
                channels,
            }),
            other => match other.strip_prefix("G726-").and_then(|k| k.parse::<u32>().ok()) {
                Some(kbps) => CodecInfo::G726(G726CodecInfo {
                    bitrate: kbps * 1000,
                    sample_rate: clock_rate,
                    channels,
                }),
                None => return Err(LinkError::UnsupportedCodec(encoding.to_string())),
            },
        };

        tracing::debug!(encoding, clock_rate, "codec selected");
        Ok(info)
    }

    /// Short human-readable codec name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::H264(_) => "H264",
            Self::Mjpeg => "JPEG",
            Self::Aac(_) => "AAC",
            Self::G711(g) if g.law == G711Law::MuLaw => "PCMU",
            Self::G711(_) => "PCMA",
            Self::G726(_) => "G726",
            Self::Pcm(_) => "PCM",
        }
    }
}

/// Look up a `key=value` entry in an fmtp parameter list (case-insensitive key).
fn fmtp_value<'a>(fmtp: Option<&'a str>, key: &str) -> Option<&'a str> {
    fmtp?.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
    })
}

fn fmtp_number(fmtp: Option<&str>, key: &str) -> Option<u8> {
    fmtp_value(fmtp, key)?.parse().ok()
}

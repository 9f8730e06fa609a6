//! SDP media section parsing (RFC 4566 / RFC 8866).
//!
//! Extracts what the payload parsers need from a session description:
//!
//! ```text
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;sprop-...      ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! Only the first payload type of each `m=` line is considered. Static
//! payload types (RFC 3551 table 4/5) are resolved without an `a=rtpmap`.

use super::CodecInfo;
use crate::error::{LinkError, Result};

/// One `m=` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMedia {
    /// `audio`, `video`, ...
    pub media: String,
    pub port: u16,
    pub payload_type: u8,
    pub encoding: Option<String>,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtp: Option<String>,
    pub control: Option<String>,
}

impl SdpMedia {
    /// Codec parameters for this media section.
    pub fn codec_info(&self) -> Result<CodecInfo> {
        match (&self.encoding, static_payload(self.payload_type)) {
            (Some(encoding), _) => CodecInfo::from_rtpmap(
                encoding,
                self.clock_rate,
                self.channels,
                self.fmtp.as_deref(),
            ),
            (None, Some((encoding, clock_rate, channels))) => {
                CodecInfo::from_rtpmap(encoding, clock_rate, Some(channels), self.fmtp.as_deref())
            }
            (None, None) => Err(LinkError::UnsupportedCodec(format!(
                "payload type {}",
                self.payload_type
            ))),
        }
    }

    /// RTP clock rate, falling back to the static payload table when no
    /// `a=rtpmap` was given.
    pub fn rtp_clock_rate(&self) -> u32 {
        match (&self.encoding, static_payload(self.payload_type)) {
            (None, Some((_, clock_rate, _))) => clock_rate,
            _ => self.clock_rate,
        }
    }
}

/// Parse every media section of an SDP body.
///
/// Lines that do not parse are skipped.
pub fn parse_media(sdp: &str) -> Vec<SdpMedia> {
    let mut sections: Vec<SdpMedia> = Vec::new();

    for line in sdp.lines().map(str::trim) {
        if let Some(m) = line.strip_prefix("m=") {
            let mut parts = m.split_whitespace();
            let media = parts.next().unwrap_or_default().to_string();
            let port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let payload_type = parts.nth(1).and_then(|p| p.parse().ok()).unwrap_or(0);
            sections.push(SdpMedia {
                media,
                port,
                payload_type,
                ..Default::default()
            });
            continue;
        }

        let Some(current) = sections.last_mut() else {
            continue;
        };
        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };

        if let Some(rtpmap) = attr.strip_prefix("rtpmap:") {
            let Some((pt, desc)) = rtpmap.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>() != Ok(current.payload_type) {
                continue;
            }
            let mut fields = desc.trim().split('/');
            current.encoding = fields.next().map(str::to_string);
            current.clock_rate = fields.next().and_then(|c| c.parse().ok()).unwrap_or(0);
            current.channels = fields.next().and_then(|c| c.parse().ok());
        } else if let Some(fmtp) = attr.strip_prefix("fmtp:") {
            let Some((pt, params)) = fmtp.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>() == Ok(current.payload_type) {
                current.fmtp = Some(params.trim().to_string());
            }
        } else if let Some(control) = attr.strip_prefix("control:") {
            current.control = Some(control.trim().to_string());
        }
    }

    tracing::debug!(count = sections.len(), "parsed SDP media sections");
    sections
}

/// RFC 3551 static payload types this crate can depacketize.
fn static_payload(payload_type: u8) -> Option<(&'static str, u32, u16)> {
    match payload_type {
        0 => Some(("PCMU", 8000, 1)),
        8 => Some(("PCMA", 8000, 1)),
        10 => Some(("L16", 44100, 2)),
        11 => Some(("L16", 44100, 1)),
        26 => Some(("JPEG", 90000, 1)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{G711CodecInfo, G711Law};

    const SDP: &str = "v=0\r\n\
        o=- 1234567890 1 IN IP4 192.168.1.100\r\n\
        s=Virtual Camera\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHg==,aM48gA==\r\n\
        a=control:track1\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:track2\r\n";

    #[test]
    fn parses_video_and_audio_sections() {
        let media = parse_media(SDP);
        assert_eq!(media.len(), 2);

        assert_eq!(media[0].media, "video");
        assert_eq!(media[0].payload_type, 96);
        assert_eq!(media[0].encoding.as_deref(), Some("H264"));
        assert_eq!(media[0].clock_rate, 90000);
        assert_eq!(media[0].control.as_deref(), Some("track1"));
        assert!(matches!(media[0].codec_info().unwrap(), CodecInfo::H264(h) if !h.sps_pps.is_empty()));

        assert_eq!(media[1].payload_type, 0);
        assert_eq!(
            media[1].codec_info().unwrap(),
            CodecInfo::G711(G711CodecInfo {
                law: G711Law::MuLaw,
                sample_rate: 8000,
                channels: 1
            })
        );
        assert_eq!(media[1].rtp_clock_rate(), 8000);
        assert_eq!(media[0].rtp_clock_rate(), 90000);
    }

    #[test]
    fn unknown_dynamic_payload_is_unsupported() {
        let media = parse_media("m=video 0 RTP/AVP 97\r\n");
        assert!(matches!(
            media[0].codec_info(),
            Err(LinkError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn attributes_before_media_are_ignored() {
        assert!(parse_media("v=0\r\na=rtpmap:96 H264/90000\r\n").is_empty());
    }
}

//! Error types for the companion-link library.

use std::fmt;

use crate::transport::ChannelType;
use crate::version::Version;

/// Errors that can occur in the companion-link library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Parsing**: [`Parse`](Self::Parse): malformed RTP payloads. The caller
///   should call `reset_state()` on the parser and keep the stream alive.
/// - **Configuration**: [`UnsupportedCodec`](Self::UnsupportedCodec),
///   [`InvalidName`](Self::InvalidName), [`InvalidVersion`](Self::InvalidVersion),
///   [`TooManyEndPoints`](Self::TooManyEndPoints),
///   [`InvalidProtocolName`](Self::InvalidProtocolName), raised at construction.
/// - **Protocol usage**: [`ProtocolReadOnly`](Self::ProtocolReadOnly),
///   [`MessageAlreadyAdded`](Self::MessageAlreadyAdded) and friends:
///   programmer errors against a [`Protocol`](crate::protocol::Protocol).
/// - **Network usage**: [`InvalidRemote`](Self::InvalidRemote),
///   [`MessageTooLarge`](Self::MessageTooLarge), [`NotRunning`](Self::NotRunning).
/// - **Transport**: [`Io`](Self::Io) for socket failures while starting.
///
/// Peer timeouts and abrupt disconnects are not errors; they are reported as
/// [`NetworkEvent::RemoteDisconnected`](crate::session::NetworkEvent).
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An RTP payload could not be parsed.
    #[error("payload parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No payload parser exists for the negotiated encoding.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A discovery name is empty, too long, or not representable as UCS-2.
    #[error("invalid {field}: {reason}")]
    InvalidName {
        field: &'static str,
        reason: &'static str,
    },

    /// A version component does not fit the 16-bit wire encoding.
    #[error("invalid version {0}: every component must fit in 16 bits")]
    InvalidVersion(Version),

    /// More connection end points were given than an announce can carry.
    #[error("too many end points: {0} (at most 255)")]
    TooManyEndPoints(usize),

    /// Protocol names must contain a non-whitespace character.
    #[error("protocol name must not be empty or whitespace")]
    InvalidProtocolName,

    /// Attempted to add a message to an inverse or deserialized protocol.
    #[error("protocol is read-only")]
    ProtocolReadOnly,

    /// The message is already registered with a protocol.
    #[error("message {0:?} already belongs to a protocol")]
    MessageAlreadyAdded(String),

    /// Another message in the protocol uses the same ID.
    #[error("a message with ID {0:?} is already registered")]
    DuplicateMessageId(String),

    /// All 65536 message codes are in use.
    #[error("protocol cannot hold more than 65536 messages")]
    ProtocolFull,

    /// No message with the given ID exists in the protocol.
    #[error("no message with ID {0:?}")]
    MessageNotFound(String),

    /// A message exists under the ID but is of a different kind.
    #[error("message {id:?} is a {actual}, not a {expected}")]
    MessageKindMismatch {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A data message exists under the ID but carries another payload type.
    #[error("message {id:?} carries {actual}, not {expected}")]
    MessageTypeMismatch {
        id: String,
        expected: &'static str,
        actual: String,
    },

    /// A sender was used before its protocol was bound with `set_network`.
    #[error("message {0:?} is not bound to a network")]
    NotBound(String),

    /// A serialized protocol could not be decoded.
    #[error("malformed protocol: {0}")]
    MalformedProtocol(&'static str),

    /// A binary message payload failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// The remote is not connected to this network instance.
    #[error("remote {0} is not connected")]
    InvalidRemote(uuid::Uuid),

    /// The message does not fit the channel it was sent on.
    #[error("{size} byte message exceeds the {max} byte limit of the {channel:?} channel")]
    MessageTooLarge {
        size: usize,
        max: usize,
        channel: ChannelType,
    },

    /// The network instance has not been started.
    #[error("network is not running")]
    NotRunning,

    /// A different message handler is already registered for the remote.
    #[error("a different message handler is registered for remote {0}")]
    HandlerConflict(uuid::Uuid),
}

/// Specific kind of payload parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// NAL unit type outside `1..=23`.
    InvalidNalUnitType(u8),
    /// RFC 6184 packetization mode that is not implemented (STAP-B, MTAP, FU-B).
    UnsupportedPacketization(u8),
    /// Payload shorter than the fixed header it must carry.
    PayloadTooShort { needed: usize, actual: usize },
    /// MJPEG header fields claim more bytes than the payload holds.
    InvalidPayloadSize(isize),
    /// RFC 3640 AU header section is truncated or inconsistent.
    MalformedAuHeaders,
    /// RTP fixed header is invalid (RFC 3550 §5.1).
    InvalidRtpHeader(&'static str),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNalUnitType(t) => write!(f, "invalid nal unit type: {t}"),
            Self::UnsupportedPacketization(t) => {
                write!(f, "unsupported packetization mode: {t}")
            }
            Self::PayloadTooShort { needed, actual } => {
                write!(f, "payload too short: need {needed} bytes, got {actual}")
            }
            Self::InvalidPayloadSize(size) => write!(f, "invalid payload size: {size}"),
            Self::MalformedAuHeaders => write!(f, "malformed AU header section"),
            Self::InvalidRtpHeader(reason) => write!(f, "invalid RTP header: {reason}"),
        }
    }
}

impl LinkError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }

    pub(crate) fn too_short(needed: usize, actual: usize) -> Self {
        Self::parse(ParseErrorKind::PayloadTooShort { needed, actual })
    }
}

/// Convenience alias for `Result<T, LinkError>`.
pub type Result<T> = std::result::Result<T, LinkError>;

//! Media depacketization and peer networking for virtual camera companion apps.
//!
//! - [`media`]: turns RTP payloads back into timestamped H.264, JPEG and
//!   audio frames.
//! - [`NetworkServer`] / [`NetworkClient`]: poll-driven peer transport with
//!   a reliable ordered channel and an unreliable unordered one.
//! - [`protocol`]: typed messages bound to a connected remote.
//! - [`discovery`]: finds servers on the local network by product name.
//!
//! Nothing in this crate owns a runtime. Parsers run on the caller's thread
//! and networking advances only when the host calls `update()`.

pub mod client;
pub mod discovery;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;

pub use client::NetworkClient;
pub use error::{LinkError, ParseErrorKind, Result};
pub use media::{CodecInfo, FrameKind, PayloadParser, RawFrame};
pub use server::{NetworkConfig, NetworkServer};
pub use session::{DisconnectStatus, MessageHandler, Network, NetworkEvent, Remote};
pub use transport::{ChannelType, Message, MessageSender};
pub use version::Version;

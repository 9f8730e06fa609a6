//! Typed message registry carried over a [`Network`] connection.
//!
//! A [`Protocol`] is a named, versioned list of messages. Each message has a
//! string id chosen by the application and a dense `u16` code assigned when
//! it is added; only the code travels on the wire:
//!
//! ```text
//! [code: u16 BE][body]
//! ```
//!
//! Event bodies are empty. Data and texture bodies are postcard-encoded.
//!
//! The server usually defines the protocol and the client uses
//! [`create_inverse`](Protocol::create_inverse) (or a deserialized copy
//! received from the server), so every sender on one side has a receiver
//! with the same code on the other.
//!
//! ## Schema format
//!
//! ```text
//! name:    u16 length + UTF-8
//! version: 4 x u16
//! count:   u32
//! count x [code: u16][kind: u8][channel: u8][options: u8]
//!         [id: u16 length + UTF-8][type name: u16 length + UTF-8]
//! ```
//!
//! All integers are big-endian.

pub mod binary;
pub mod event;
pub mod message;
pub mod texture;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{LinkError, Result};
use crate::media::bits;
use crate::session::{MessageHandler, Network, Remote};
use crate::transport::{ChannelType, Message};
use crate::version::Version;

pub use binary::{BinaryReceiver, BinarySender};
pub use event::{EventReceiver, EventSender};
pub use message::{DataOptions, MessageKind, MessageRef, ProtocolMessage};
pub use texture::{FilterMode, PixelFormat, TextureData, TextureReceiver, TextureSender};

use binary::type_name_of;
use message::MessageCore;
use texture::TEXTURE_TYPE_NAME;

/// Number of distinct message codes.
pub const MAX_MESSAGES: usize = 1 << 16;

type MessageTable = Arc<RwLock<Vec<Arc<MessageCore>>>>;

/// A named, versioned collection of messages.
///
/// Protocols built with [`new`](Self::new) accept messages through
/// [`add`](Self::add). Inverse and deserialized protocols are read-only.
pub struct Protocol {
    name: String,
    version: Version,
    read_only: bool,
    messages: MessageTable,
    by_id: HashMap<String, u16>,
    dispatch: MessageHandler,
}

impl Protocol {
    pub fn new(name: &str, version: Version) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(LinkError::InvalidProtocolName);
        }
        if !version.fits_u16() {
            return Err(LinkError::InvalidVersion(version));
        }
        Ok(Self::build(name.to_string(), version, false, Vec::new()))
    }

    fn build(name: String, version: Version, read_only: bool, cores: Vec<Arc<MessageCore>>) -> Self {
        let by_id = cores
            .iter()
            .enumerate()
            .map(|(code, core)| (core.id.clone(), code as u16))
            .collect();
        let messages: MessageTable = Arc::new(RwLock::new(cores));
        let dispatch = dispatcher(name.clone(), messages.clone());
        Self {
            name,
            version,
            read_only,
            messages,
            by_id,
            dispatch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages in code order.
    pub fn iter(&self) -> impl Iterator<Item = MessageRef> + use<> {
        let refs: Vec<MessageRef> = self
            .messages
            .read()
            .iter()
            .map(|core| MessageRef { core: core.clone() })
            .collect();
        refs.into_iter()
    }

    /// Add `message` and return the code assigned to it.
    pub fn add(&mut self, message: &impl ProtocolMessage) -> Result<u16> {
        if self.read_only {
            return Err(LinkError::ProtocolReadOnly);
        }
        let core = message.message().core;
        if core.is_added() {
            return Err(LinkError::MessageAlreadyAdded(core.id.clone()));
        }
        if self.by_id.contains_key(&core.id) {
            return Err(LinkError::DuplicateMessageId(core.id.clone()));
        }
        let mut messages = self.messages.write();
        if messages.len() >= MAX_MESSAGES {
            return Err(LinkError::ProtocolFull);
        }

        let code = messages.len() as u16;
        core.claim(code)?;
        self.by_id.insert(core.id.clone(), code);
        tracing::trace!(protocol = %self.name, id = %core.id, code, kind = ?core.kind, "message added");
        messages.push(core);
        Ok(code)
    }

    pub fn get(&self, id: &str) -> Option<MessageRef> {
        self.core(id).ok().map(|core| MessageRef { core })
    }

    fn core(&self, id: &str) -> Result<Arc<MessageCore>> {
        let code = self
            .by_id
            .get(id)
            .ok_or_else(|| LinkError::MessageNotFound(id.to_string()))?;
        self.messages
            .read()
            .get(usize::from(*code))
            .cloned()
            .ok_or_else(|| LinkError::MessageNotFound(id.to_string()))
    }

    fn lookup(&self, id: &str, kind: MessageKind, type_name: &'static str) -> Result<Arc<MessageCore>> {
        let core = self.core(id)?;
        if core.kind != kind {
            return Err(LinkError::MessageKindMismatch {
                id: id.to_string(),
                expected: kind.name(),
                actual: core.kind.name(),
            });
        }
        if core.type_name != type_name {
            return Err(LinkError::MessageTypeMismatch {
                id: id.to_string(),
                expected: if type_name.is_empty() { "event" } else { type_name },
                actual: core.type_name.clone(),
            });
        }
        Ok(core)
    }

    pub fn get_event_sender(&self, id: &str) -> Result<EventSender> {
        self.lookup(id, MessageKind::EventSender, "")
            .map(EventSender::from_core)
    }

    pub fn get_event_receiver(&self, id: &str) -> Result<EventReceiver> {
        self.lookup(id, MessageKind::EventReceiver, "")
            .map(EventReceiver::from_core)
    }

    pub fn get_data_sender<T: Serialize>(&self, id: &str) -> Result<BinarySender<T>> {
        self.lookup(id, MessageKind::DataSender, type_name_of::<T>())
            .map(BinarySender::from_core)
    }

    pub fn get_data_receiver<T: DeserializeOwned + 'static>(&self, id: &str) -> Result<BinaryReceiver<T>> {
        self.lookup(id, MessageKind::DataReceiver, type_name_of::<T>())
            .map(BinaryReceiver::from_core)
    }

    pub fn get_texture_sender(&self, id: &str) -> Result<TextureSender> {
        self.lookup(id, MessageKind::TextureSender, TEXTURE_TYPE_NAME)
            .map(TextureSender::from_core)
    }

    pub fn get_texture_receiver(&self, id: &str) -> Result<TextureReceiver> {
        self.lookup(id, MessageKind::TextureReceiver, TEXTURE_TYPE_NAME)
            .map(TextureReceiver::from_core)
    }

    /// Read-only copy where every sender is a receiver and vice versa.
    pub fn create_inverse(&self) -> Self {
        let cores = self
            .messages
            .read()
            .iter()
            .enumerate()
            .map(|(code, core)| core.mirrored(core.kind.inverse(), code as u16))
            .collect();
        Self::build(self.name.clone(), self.version, true, cores)
    }

    /// Bind every message to `remote` on `network`.
    ///
    /// One protocol can be bound to any number of remotes, on one or several
    /// networks. Senders send to every bound remote and receivers get
    /// messages from all of them. Bindings to remotes that have disconnected
    /// are dropped on the next send; a sender with no live binding fails with
    /// [`LinkError::NotBound`].
    ///
    /// Binding the same protocol to the same remote again only resets the
    /// remote's only-changed state. Binding while another handler is
    /// registered for the remote fails with [`LinkError::HandlerConflict`].
    pub fn set_network<N: Network + ?Sized>(&self, network: &mut N, remote: Remote) -> Result<()> {
        if !network.register_message_handler(remote, self.dispatch.clone())? {
            return Err(LinkError::HandlerConflict(remote.id));
        }
        let sender = network.sender();
        for core in self.messages.read().iter() {
            core.bind(sender.clone(), remote);
        }
        tracing::debug!(protocol = %self.name, remote = %remote.id, "protocol bound to remote");
        Ok(())
    }

    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        let messages = self.messages.read();
        let mut out = Vec::new();
        write_str(&mut out, &self.name)?;
        self.version.write_u16s(&mut out);
        out.extend_from_slice(&(messages.len() as u32).to_be_bytes());
        for (code, core) in messages.iter().enumerate() {
            out.extend_from_slice(&(code as u16).to_be_bytes());
            out.push(core.kind.to_u8());
            out.push(core.channel.to_u8());
            out.push(core.options.to_u8());
            write_str(&mut out, &core.id)?;
            write_str(&mut out, &core.type_name)?;
        }
        writer.write_all(&out)?;
        Ok(())
    }

    /// Read a protocol written by [`serialize`](Self::serialize). The result
    /// is read-only.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let name = read_str(reader)?;
        if name.trim().is_empty() {
            return Err(LinkError::InvalidProtocolName);
        }
        let version = Version::from_u16s([
            read_u16(reader)?,
            read_u16(reader)?,
            read_u16(reader)?,
            read_u16(reader)?,
        ]);
        let count = read_u32(reader)? as usize;
        if count > MAX_MESSAGES {
            return Err(LinkError::MalformedProtocol("message count exceeds 65536"));
        }

        let mut cores = Vec::with_capacity(count);
        let mut seen = HashMap::with_capacity(count);
        for index in 0..count {
            let code = read_u16(reader)?;
            if usize::from(code) != index {
                return Err(LinkError::MalformedProtocol("message codes are not sequential"));
            }
            let mut flags = [0u8; 3];
            read_exact(reader, &mut flags)?;
            let kind = MessageKind::from_u8(flags[0])
                .ok_or(LinkError::MalformedProtocol("unknown message kind"))?;
            let channel = ChannelType::from_u8(flags[1])
                .ok_or(LinkError::MalformedProtocol("unknown channel type"))?;
            let options = DataOptions::from_u8(flags[2]);
            let id = read_str(reader)?;
            let type_name = read_str(reader)?;
            if seen.insert(id.clone(), code).is_some() {
                return Err(LinkError::DuplicateMessageId(id));
            }

            cores.push(MessageCore::owned(&id, kind, channel, options, &type_name, code));
        }

        tracing::debug!(protocol = %name, %version, messages = count, "protocol deserialized");
        Ok(Self::build(name, version, true, cores))
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("read_only", &self.read_only)
            .field("messages", &self.len())
            .finish()
    }
}

/// Routes incoming messages to the receiver registered under their code.
fn dispatcher(protocol: String, messages: MessageTable) -> MessageHandler {
    Arc::new(move |message: Message| {
        let Some(code) = bits::read_u16_be(&message.data, 0) else {
            tracing::warn!(%protocol, remote = %message.remote.id, "message without code dropped");
            return;
        };
        let core = messages.read().get(usize::from(code)).cloned();
        match core {
            Some(core) if core.kind.is_receiver() => core.receive(&message.data[2..]),
            Some(core) => tracing::warn!(%protocol, code, id = %core.id, "message for a local sender dropped"),
            None => tracing::warn!(%protocol, code, "message with unknown code dropped"),
        }
    })
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| LinkError::MalformedProtocol("string longer than 65535 bytes"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => LinkError::MalformedProtocol("unexpected end of data"),
        _ => LinkError::Io(e),
    })
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_str<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u16(reader)?;
    let mut buf = vec![0u8; usize::from(len)];
    read_exact(reader, &mut buf)?;
    String::from_utf8(buf).map_err(|_| LinkError::MalformedProtocol("string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> Protocol {
        Protocol::new("TestProtocol", Version::default()).unwrap()
    }

    /// One message of each kind, in a fixed order.
    fn full_protocol() -> Protocol {
        let mut p = protocol();
        p.add(&EventSender::new("EventSender")).unwrap();
        p.add(&EventReceiver::new("EventReceiver")).unwrap();
        p.add(&BinarySender::<i32>::new("DataSender")).unwrap();
        p.add(&BinaryReceiver::<i32>::new("DataReceiver")).unwrap();
        p.add(&TextureSender::new("TextureSender")).unwrap();
        p.add(&TextureReceiver::new("TextureReceiver")).unwrap();
        p
    }

    #[test]
    fn name_and_version_validated() {
        assert!(matches!(
            Protocol::new("", Version::default()),
            Err(LinkError::InvalidProtocolName)
        ));
        assert!(matches!(
            Protocol::new("  ", Version::default()),
            Err(LinkError::InvalidProtocolName)
        ));
        assert!(matches!(
            Protocol::new("P", Version::new(0, 70000, 0, 0)),
            Err(LinkError::InvalidVersion(_))
        ));

        let p = Protocol::new("TestProtocol", Version::new(2, 5, 3, 8)).unwrap();
        assert!(!p.is_read_only());
        assert_eq!(p.name(), "TestProtocol");
        assert_eq!(p.version(), Version::new(2, 5, 3, 8));
    }

    #[test]
    fn add_assigns_sequential_codes() {
        let mut p = protocol();
        let a = EventSender::new("A");
        let b = EventSender::new("B");
        assert!(p.is_empty());
        assert_eq!(a.message().code(), None);

        assert_eq!(p.add(&a).unwrap(), 0);
        assert_eq!(p.add(&b).unwrap(), 1);
        assert_eq!(p.len(), 2);
        assert_eq!(p.iter().next(), Some(a.message()));
        assert_eq!(a.message().code(), Some(0));
    }

    #[test]
    fn add_rejects_duplicates_and_reuse() {
        let mut p = protocol();
        let sender = EventSender::new("TestMessage");
        p.add(&sender).unwrap();

        assert!(matches!(
            p.add(&EventReceiver::new("TestMessage")),
            Err(LinkError::DuplicateMessageId(_))
        ));
        assert!(matches!(
            p.add(&sender),
            Err(LinkError::MessageAlreadyAdded(_))
        ));

        let mut other = Protocol::new("Other", Version::default()).unwrap();
        assert!(matches!(
            other.add(&sender),
            Err(LinkError::MessageAlreadyAdded(_))
        ));
        assert!(other.is_empty());
    }

    #[test]
    fn concurrent_adds_have_one_owner() {
        let sender = EventSender::new("Shared");
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let sender = sender.clone();
                    scope.spawn(move || {
                        let mut p = Protocol::new(&format!("P{i}"), Version::default()).unwrap();
                        match p.add(&sender) {
                            Ok(_) => 1,
                            Err(LinkError::MessageAlreadyAdded(_)) => 0,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(sender.message().code(), Some(0));
    }

    #[test]
    fn capacity_is_65536_messages() {
        let mut p = protocol();
        for i in 0..MAX_MESSAGES {
            p.add(&EventSender::new(&format!("M{i}"))).unwrap();
        }
        assert_eq!(p.len(), MAX_MESSAGES);
        assert!(matches!(
            p.add(&EventSender::new("Overflow")),
            Err(LinkError::ProtocolFull)
        ));
    }

    #[test]
    fn inverse_is_read_only() {
        let mut inverse = protocol().create_inverse();
        assert!(inverse.is_read_only());
        assert!(matches!(
            inverse.add(&EventSender::new("M")),
            Err(LinkError::ProtocolReadOnly)
        ));
    }

    #[test]
    fn getters_check_kind_and_type() {
        let p = full_protocol();
        assert!(p.get_event_sender("EventSender").is_ok());
        assert!(matches!(
            p.get_event_sender("EventReceiver"),
            Err(LinkError::MessageKindMismatch { .. })
        ));
        assert!(matches!(
            p.get_event_sender("Missing"),
            Err(LinkError::MessageNotFound(_))
        ));
        assert!(p.get_data_sender::<i32>("DataSender").is_ok());
        assert!(matches!(
            p.get_data_sender::<i64>("DataSender"),
            Err(LinkError::MessageTypeMismatch { .. })
        ));
        assert!(p.get_data_receiver::<i32>("DataReceiver").is_ok());
        assert!(p.get_data_receiver::<i32>("DataSender").is_err());
        assert!(p.get_texture_sender("TextureSender").is_ok());
        assert!(p.get_texture_receiver("TextureReceiver").is_ok());
        assert!(p.get_texture_receiver("TextureSender").is_err());
    }

    #[test]
    fn getter_returns_the_added_message() {
        let mut p = protocol();
        let sender = BinarySender::<u32>::new("Value");
        p.add(&sender).unwrap();
        assert_eq!(p.get_data_sender::<u32>("Value").unwrap(), sender);
    }

    #[test]
    fn inverse_mirrors_directions() {
        let p = full_protocol();
        let inverse = p.create_inverse();
        assert_eq!(inverse.name(), p.name());
        assert_eq!(inverse.len(), p.len());
        assert!(inverse.get_event_receiver("EventSender").is_ok());
        assert!(inverse.get_event_sender("EventReceiver").is_ok());
        assert!(inverse.get_data_receiver::<i32>("DataSender").is_ok());
        assert!(inverse.get_data_sender::<i32>("DataReceiver").is_ok());
        assert!(inverse.get_texture_receiver("TextureSender").is_ok());

        let twice = inverse.create_inverse();
        assert!(twice.is_read_only());
        for (a, b) in p.iter().zip(twice.iter()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.kind(), b.kind());
            assert_eq!(a.code(), b.code());
        }
        assert!(twice.get_event_sender("EventSender").is_ok());
        assert!(twice.get_data_sender::<i32>("DataSender").is_ok());
    }

    #[test]
    fn serialize_round_trip() {
        let mut p = Protocol::new("TestProtocol", Version::new(1, 2, 3, 4)).unwrap();
        p.add(&EventSender::with_channel("Ping", ChannelType::UnreliableUnordered))
            .unwrap();
        p.add(&BinaryReceiver::<f32>::with_options(
            "Focus",
            ChannelType::ReliableOrdered,
            DataOptions {
                only_send_changed: false,
            },
        ))
        .unwrap();

        let mut bytes = Vec::new();
        p.serialize(&mut bytes).unwrap();
        assert_eq!(&bytes[..2], &[0, 12]);
        assert_eq!(&bytes[2..14], b"TestProtocol");
        assert_eq!(&bytes[14..22], &[0, 1, 0, 2, 0, 3, 0, 4]);
        assert_eq!(&bytes[22..26], &[0, 0, 0, 2]);

        let copy = Protocol::deserialize(&mut bytes.as_slice()).unwrap();
        assert!(copy.is_read_only());
        assert_eq!(copy.name(), "TestProtocol");
        assert_eq!(copy.version(), Version::new(1, 2, 3, 4));
        assert_eq!(copy.len(), 2);

        let ping = copy.get("Ping").unwrap();
        assert_eq!(ping.channel(), ChannelType::UnreliableUnordered);
        assert_eq!(ping.code(), Some(0));
        let focus = copy.get("Focus").unwrap();
        assert!(!focus.options().only_send_changed);
        assert!(copy.get_data_receiver::<f32>("Focus").is_ok());
    }

    #[test]
    fn deserialize_rejects_bad_input() {
        let mut bytes = Vec::new();
        full_protocol().serialize(&mut bytes).unwrap();

        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            Protocol::deserialize(&mut &truncated[..]),
            Err(LinkError::MalformedProtocol(_))
        ));
        assert!(Protocol::deserialize(&mut &[][..]).is_err());

        // kind byte of the first message
        let mut bad_kind = bytes.clone();
        bad_kind[2 + 12 + 8 + 4 + 2] = 9;
        assert!(matches!(
            Protocol::deserialize(&mut bad_kind.as_slice()),
            Err(LinkError::MalformedProtocol("unknown message kind"))
        ));
    }

    #[test]
    fn unbound_sender_fails() {
        let p = full_protocol();
        let sender = p.get_event_sender("EventSender").unwrap();
        assert!(matches!(sender.send(), Err(LinkError::NotBound(_))));
    }

    #[test]
    fn dispatch_routes_by_code() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let p = full_protocol();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        p.get_event_receiver("EventReceiver")
            .unwrap()
            .add_handler(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let remote = Remote {
            id: uuid::Uuid::new_v4(),
            addr: "127.0.0.1:1".parse().unwrap(),
        };
        let deliver = |data: Vec<u8>| {
            (p.dispatch)(Message::new(remote, ChannelType::ReliableOrdered, data));
        };
        deliver(vec![0, 1]);
        deliver(vec![0, 0]);
        deliver(vec![0xFF, 0xFF]);
        deliver(vec![0]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{LinkError, Result};
use crate::session::Remote;
use crate::transport::{ChannelType, Message, MessageSender};

/// Direction and payload category of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    EventSender,
    EventReceiver,
    DataSender,
    DataReceiver,
    TextureSender,
    TextureReceiver,
}

impl MessageKind {
    /// The kind seen from the other end of the connection.
    pub fn inverse(self) -> Self {
        match self {
            Self::EventSender => Self::EventReceiver,
            Self::EventReceiver => Self::EventSender,
            Self::DataSender => Self::DataReceiver,
            Self::DataReceiver => Self::DataSender,
            Self::TextureSender => Self::TextureReceiver,
            Self::TextureReceiver => Self::TextureSender,
        }
    }

    pub fn is_receiver(self) -> bool {
        matches!(
            self,
            Self::EventReceiver | Self::DataReceiver | Self::TextureReceiver
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EventSender => "event sender",
            Self::EventReceiver => "event receiver",
            Self::DataSender => "data sender",
            Self::DataReceiver => "data receiver",
            Self::TextureSender => "texture sender",
            Self::TextureReceiver => "texture receiver",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::EventSender => 0,
            Self::EventReceiver => 1,
            Self::DataSender => 2,
            Self::DataReceiver => 3,
            Self::TextureSender => 4,
            Self::TextureReceiver => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::EventSender,
            1 => Self::EventReceiver,
            2 => Self::DataSender,
            3 => Self::DataReceiver,
            4 => Self::TextureSender,
            5 => Self::TextureReceiver,
            _ => return None,
        })
    }
}

/// Per-message send behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOptions {
    /// Skip sends whose encoded value equals the last value sent to the
    /// same remote.
    pub only_send_changed: bool,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            only_send_changed: true,
        }
    }
}

impl DataOptions {
    const ONLY_SEND_CHANGED: u8 = 0x01;

    pub(crate) fn to_u8(self) -> u8 {
        if self.only_send_changed {
            Self::ONLY_SEND_CHANGED
        } else {
            0
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        Self {
            only_send_changed: value & Self::ONLY_SEND_CHANGED != 0,
        }
    }
}

pub(crate) type BodyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One remote a message is bound to.
struct Binding {
    sender: MessageSender,
    remote: Remote,
    /// Last body sent to `remote`, kept for messages that only send changes.
    last_sent: Option<Vec<u8>>,
}

/// State shared by every handle to one protocol message.
pub(crate) struct MessageCore {
    pub(crate) id: String,
    pub(crate) kind: MessageKind,
    pub(crate) channel: ChannelType,
    pub(crate) options: DataOptions,
    /// Payload type name for data messages, empty for events.
    pub(crate) type_name: String,
    code: OnceLock<u16>,
    added: AtomicBool,
    bindings: Mutex<Vec<Binding>>,
    handlers: Mutex<Vec<BodyHandler>>,
}

impl MessageCore {
    pub(crate) fn new(
        id: &str,
        kind: MessageKind,
        channel: ChannelType,
        options: DataOptions,
        type_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self::unowned(id, kind, channel, options, type_name))
    }

    /// A message already owned by a protocol under `code`.
    pub(crate) fn owned(
        id: &str,
        kind: MessageKind,
        channel: ChannelType,
        options: DataOptions,
        type_name: &str,
        code: u16,
    ) -> Arc<Self> {
        let mut core = Self::unowned(id, kind, channel, options, type_name);
        core.code = OnceLock::from(code);
        core.added = AtomicBool::new(true);
        Arc::new(core)
    }

    fn unowned(
        id: &str,
        kind: MessageKind,
        channel: ChannelType,
        options: DataOptions,
        type_name: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind,
            channel,
            options,
            type_name: type_name.to_string(),
            code: OnceLock::new(),
            added: AtomicBool::new(false),
            bindings: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Same message seen from the other end, already owned by a protocol.
    pub(crate) fn mirrored(&self, kind: MessageKind, code: u16) -> Arc<Self> {
        Self::owned(&self.id, kind, self.channel, self.options, &self.type_name, code)
    }

    pub(crate) fn code(&self) -> Option<u16> {
        self.code.get().copied()
    }

    pub(crate) fn is_added(&self) -> bool {
        self.added.load(Ordering::SeqCst)
    }

    /// Take ownership for a protocol under `code`. Only the first claim
    /// succeeds.
    pub(crate) fn claim(&self, code: u16) -> Result<()> {
        if self
            .added
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LinkError::MessageAlreadyAdded(self.id.clone()));
        }
        self.code
            .set(code)
            .map_err(|_| LinkError::MessageAlreadyAdded(self.id.clone()))
    }

    /// Bind to `remote`, replacing an earlier binding to the same remote id.
    pub(crate) fn bind(&self, sender: MessageSender, remote: Remote) {
        let mut bindings = self.bindings.lock();
        bindings.retain(|b| b.remote.id != remote.id);
        bindings.push(Binding {
            sender,
            remote,
            last_sent: None,
        });
    }

    /// Send `body` prefixed with the message code to every bound remote.
    pub(crate) fn send(&self, body: &[u8]) -> Result<()> {
        self.fan_out(body, false)
    }

    /// Like [`send`](Self::send), but skip remotes that already received an
    /// identical body when the message only sends changes.
    pub(crate) fn send_if_changed(&self, body: &[u8]) -> Result<()> {
        self.fan_out(body, self.options.only_send_changed)
    }

    fn fan_out(&self, body: &[u8], skip_unchanged: bool) -> Result<()> {
        let code = self
            .code()
            .ok_or_else(|| LinkError::NotBound(self.id.clone()))?;
        let mut bindings = self.bindings.lock();
        bindings.retain(|b| {
            let live = b.sender.is_connected(&b.remote);
            if !live {
                tracing::debug!(id = %self.id, remote = %b.remote.id, "binding to departed remote dropped");
            }
            live
        });
        if bindings.is_empty() {
            return Err(LinkError::NotBound(self.id.clone()));
        }

        let mut data = Vec::with_capacity(2 + body.len());
        data.extend_from_slice(&code.to_be_bytes());
        data.extend_from_slice(body);
        for binding in bindings.iter_mut() {
            if skip_unchanged && binding.last_sent.as_deref() == Some(body) {
                tracing::trace!(id = %self.id, remote = %binding.remote.id, "unchanged value not sent");
                continue;
            }
            binding
                .sender
                .send(Message::new(binding.remote, self.channel, data.clone()))?;
            if self.options.only_send_changed {
                binding.last_sent = Some(body.to_vec());
            }
        }
        Ok(())
    }

    pub(crate) fn add_handler(&self, handler: BodyHandler) {
        self.handlers.lock().push(handler);
    }

    pub(crate) fn clear_handlers(&self) {
        self.handlers.lock().clear();
    }

    pub(crate) fn receive(&self, body: &[u8]) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler(body);
        }
    }
}

/// Type-erased handle to a message registered with a protocol.
#[derive(Clone)]
pub struct MessageRef {
    pub(crate) core: Arc<MessageCore>,
}

impl MessageRef {
    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn kind(&self) -> MessageKind {
        self.core.kind
    }

    pub fn channel(&self) -> ChannelType {
        self.core.channel
    }

    pub fn options(&self) -> DataOptions {
        self.core.options
    }

    /// Code assigned by the protocol, or `None` before the message is added.
    pub fn code(&self) -> Option<u16> {
        self.core.code()
    }

    pub fn type_name(&self) -> &str {
        &self.core.type_name
    }
}

impl PartialEq for MessageRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for MessageRef {}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRef")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("code", &self.core.code())
            .finish()
    }
}

/// Anything that can be added to a [`Protocol`](super::Protocol).
pub trait ProtocolMessage {
    fn message(&self) -> MessageRef;
}

impl ProtocolMessage for MessageRef {
    fn message(&self) -> MessageRef {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_is_an_involution() {
        for code in 0..6 {
            let kind = MessageKind::from_u8(code).unwrap();
            assert_eq!(kind.inverse().inverse(), kind);
            assert_ne!(kind.is_receiver(), kind.inverse().is_receiver());
            assert_eq!(kind.to_u8(), code);
        }
        assert_eq!(MessageKind::from_u8(6), None);
    }

    #[test]
    fn options_flags() {
        assert_eq!(DataOptions::default().to_u8(), 1);
        assert!(!DataOptions::from_u8(0).only_send_changed);
    }

    #[test]
    fn unbound_send_fails() {
        let core = MessageCore::new(
            "Ping",
            MessageKind::EventSender,
            ChannelType::ReliableOrdered,
            DataOptions::default(),
            "",
        );
        assert!(!core.is_added());
        core.claim(0).unwrap();
        assert!(core.is_added());
        assert_eq!(core.code(), Some(0));
        assert!(matches!(core.claim(1), Err(LinkError::MessageAlreadyAdded(_))));
        assert_eq!(core.code(), Some(0));
        assert!(matches!(core.send(&[]), Err(LinkError::NotBound(id)) if id == "Ping"));
    }
}

use std::sync::Arc;

use super::message::{DataOptions, MessageCore, MessageKind, MessageRef, ProtocolMessage};
use crate::error::Result;
use crate::transport::ChannelType;

/// Sends a payload-less notification.
#[derive(Clone)]
pub struct EventSender {
    core: Arc<MessageCore>,
}

impl EventSender {
    pub fn new(id: &str) -> Self {
        Self::with_channel(id, ChannelType::ReliableOrdered)
    }

    pub fn with_channel(id: &str, channel: ChannelType) -> Self {
        Self {
            core: MessageCore::new(
                id,
                MessageKind::EventSender,
                channel,
                DataOptions {
                    only_send_changed: false,
                },
                "",
            ),
        }
    }

    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn send(&self) -> Result<()> {
        self.core.send(&[])
    }
}

/// Invokes handlers when the matching [`EventSender`] fires.
#[derive(Clone)]
pub struct EventReceiver {
    core: Arc<MessageCore>,
}

impl EventReceiver {
    pub fn new(id: &str) -> Self {
        Self::with_channel(id, ChannelType::ReliableOrdered)
    }

    pub fn with_channel(id: &str, channel: ChannelType) -> Self {
        Self {
            core: MessageCore::new(
                id,
                MessageKind::EventReceiver,
                channel,
                DataOptions {
                    only_send_changed: false,
                },
                "",
            ),
        }
    }

    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Handlers run inside the network's `update()`.
    pub fn add_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.core.add_handler(Arc::new(move |_: &[u8]| handler()));
    }

    pub fn clear_handlers(&self) {
        self.core.clear_handlers();
    }
}

impl ProtocolMessage for EventSender {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl ProtocolMessage for EventReceiver {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl PartialEq for EventSender {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl PartialEq for EventReceiver {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventSender").field(&self.core.id).finish()
    }
}

impl std::fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventReceiver").field(&self.core.id).finish()
    }
}

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::message::{DataOptions, MessageCore, MessageKind, MessageRef, ProtocolMessage};
use crate::error::Result;
use crate::transport::ChannelType;

/// Name recorded in the protocol schema for payload type `T`.
pub(crate) fn type_name_of<T>() -> &'static str {
    std::any::type_name::<T>()
}

/// Sends values of `T`, encoded with postcard.
pub struct BinarySender<T> {
    core: Arc<MessageCore>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> BinarySender<T> {
    /// Reliable sender that skips unchanged values.
    pub fn new(id: &str) -> Self {
        Self::with_options(id, ChannelType::ReliableOrdered, DataOptions::default())
    }

    pub fn with_options(id: &str, channel: ChannelType, options: DataOptions) -> Self {
        Self::from_core(MessageCore::new(
            id,
            MessageKind::DataSender,
            channel,
            options,
            type_name_of::<T>(),
        ))
    }

    pub fn send(&self, value: &T) -> Result<()> {
        let body = postcard::to_stdvec(value)?;
        self.core.send_if_changed(&body)
    }
}

impl<T> BinarySender<T> {
    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn options(&self) -> DataOptions {
        self.core.options
    }
}

/// Receives values of `T` sent by a matching [`BinarySender`].
pub struct BinaryReceiver<T> {
    core: Arc<MessageCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + 'static> BinaryReceiver<T> {
    pub fn new(id: &str) -> Self {
        Self::with_options(id, ChannelType::ReliableOrdered, DataOptions::default())
    }

    pub fn with_options(id: &str, channel: ChannelType, options: DataOptions) -> Self {
        Self::from_core(MessageCore::new(
            id,
            MessageKind::DataReceiver,
            channel,
            options,
            type_name_of::<T>(),
        ))
    }

    /// Register `handler` for decoded values. Bodies that fail to decode are
    /// logged and dropped.
    pub fn add_handler(&self, handler: impl Fn(T) + Send + Sync + 'static) {
        let id = self.core.id.clone();
        self.core
            .add_handler(Arc::new(move |body: &[u8]| match postcard::from_bytes::<T>(body) {
                Ok(value) => handler(value),
                Err(e) => tracing::warn!(%id, error = %e, "failed to decode message body"),
            }));
    }
}

impl<T> BinaryReceiver<T> {
    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn clear_handlers(&self) {
        self.core.clear_handlers();
    }
}

impl<T> ProtocolMessage for BinarySender<T> {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl<T> ProtocolMessage for BinaryReceiver<T> {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl<T> Clone for BinarySender<T> {
    fn clone(&self) -> Self {
        Self::from_core(self.core.clone())
    }
}

impl<T> Clone for BinaryReceiver<T> {
    fn clone(&self) -> Self {
        Self::from_core(self.core.clone())
    }
}

impl<T> PartialEq for BinarySender<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T> PartialEq for BinaryReceiver<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T> std::fmt::Debug for BinarySender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinarySender")
            .field("id", &self.core.id)
            .field("type", &self.core.type_name)
            .finish()
    }
}

impl<T> std::fmt::Debug for BinaryReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryReceiver")
            .field("id", &self.core.id)
            .field("type", &self.core.type_name)
            .finish()
    }
}

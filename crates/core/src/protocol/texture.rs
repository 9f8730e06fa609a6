use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::message::{DataOptions, MessageCore, MessageKind, MessageRef, ProtocolMessage};
use crate::error::Result;
use crate::transport::ChannelType;

pub(crate) const TEXTURE_TYPE_NAME: &str = "TextureData";

/// Pixel layout of [`TextureData::pixels`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Rgba8Unorm,
    Rgb8Unorm,
    R8Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::R8Unorm => 1,
            Self::Rgb8Unorm => 3,
            Self::Rgba8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    Point,
    #[default]
    Bilinear,
    Trilinear,
}

/// An uncompressed texture with its full mip chain.
///
/// `pixels` holds mip 0 first, each level half the size of the previous one
/// (rounded down, at least 1x1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mip_count: u32,
    pub filter: FilterMode,
    pub pixels: Vec<u8>,
    pub metadata: String,
}

impl TextureData {
    /// Byte length `pixels` must have for the dimensions, format and mip count.
    pub fn expected_len(&self) -> usize {
        let (mut w, mut h) = (self.width as usize, self.height as usize);
        let mut total = 0;
        for _ in 0..self.mip_count {
            total += w * h * self.format.bytes_per_pixel();
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        total
    }

    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == self.expected_len()
    }
}

/// Sends [`TextureData`].
#[derive(Clone)]
pub struct TextureSender {
    core: Arc<MessageCore>,
}

impl TextureSender {
    pub fn new(id: &str) -> Self {
        Self::with_options(id, ChannelType::ReliableOrdered, DataOptions::default())
    }

    pub fn with_options(id: &str, channel: ChannelType, options: DataOptions) -> Self {
        Self::from_core(MessageCore::new(
            id,
            MessageKind::TextureSender,
            channel,
            options,
            TEXTURE_TYPE_NAME,
        ))
    }

    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn send(&self, texture: &TextureData) -> Result<()> {
        self.core.send_if_changed(&postcard::to_stdvec(texture)?)
    }
}

/// Receives [`TextureData`] sent by a matching [`TextureSender`].
#[derive(Clone)]
pub struct TextureReceiver {
    core: Arc<MessageCore>,
}

impl TextureReceiver {
    pub fn new(id: &str) -> Self {
        Self::from_core(MessageCore::new(
            id,
            MessageKind::TextureReceiver,
            ChannelType::ReliableOrdered,
            DataOptions::default(),
            TEXTURE_TYPE_NAME,
        ))
    }

    pub(crate) fn from_core(core: Arc<MessageCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Textures whose pixel buffer does not match their dimensions are dropped.
    pub fn add_handler(&self, handler: impl Fn(TextureData) + Send + Sync + 'static) {
        let id = self.core.id.clone();
        self.core.add_handler(Arc::new(move |body: &[u8]| {
            match postcard::from_bytes::<TextureData>(body) {
                Ok(texture) if texture.is_consistent() => handler(texture),
                Ok(texture) => tracing::warn!(
                    %id,
                    expected = texture.expected_len(),
                    actual = texture.pixels.len(),
                    "texture pixel buffer size mismatch"
                ),
                Err(e) => tracing::warn!(%id, error = %e, "failed to decode texture"),
            }
        }));
    }

    pub fn clear_handlers(&self) {
        self.core.clear_handlers();
    }
}

impl ProtocolMessage for TextureSender {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl ProtocolMessage for TextureReceiver {
    fn message(&self) -> MessageRef {
        MessageRef {
            core: self.core.clone(),
        }
    }
}

impl std::fmt::Debug for TextureSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TextureSender").field(&self.core.id).finish()
    }
}

impl std::fmt::Debug for TextureReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TextureReceiver").field(&self.core.id).finish()
    }
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Channels kept in every decoded frame
pub const COLOR_CHANNELS: usize = 3;

/// Pixel layouts the graph may hand us. Four-byte layouts carry their
/// padding (or alpha) byte last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Bgrx,
    Rgbx,
    Bgra,
    Rgba,
    Bgr,
    Rgb,
}

/// Byte order of the three color channels in a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    Bgr,
    Rgb,
}

impl WireFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgrx | Self::Rgbx | Self::Bgra | Self::Rgba => 4,
            Self::Bgr | Self::Rgb => 3,
        }
    }

    pub fn channel_order(self) -> ChannelOrder {
        match self {
            Self::Bgrx | Self::Bgra | Self::Bgr => ChannelOrder::Bgr,
            Self::Rgbx | Self::Rgba | Self::Rgb => ChannelOrder::Rgb,
        }
    }

    /// Caps name used when negotiating with GStreamer
    pub fn caps_name(self) -> &'static str {
        match self {
            Self::Bgrx => "BGRx",
            Self::Rgbx => "RGBx",
            Self::Bgra => "BGRA",
            Self::Rgba => "RGBA",
            Self::Bgr => "BGR",
            Self::Rgb => "RGB",
        }
    }
}

/// Frame dimensions fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes a buffer in `format` must carry to hold one full frame
    pub fn wire_len(&self, format: WireFormat) -> usize {
        self.pixels() * format.bytes_per_pixel()
    }

    /// Bytes of the decoded three-channel frame
    pub fn decoded_len(&self) -> usize {
        self.pixels() * COLOR_CHANNELS
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
}

/// A validated frame that owns its pixels. Immutable once published.
#[derive(Clone)]
pub struct DecodedFrame {
    /// Row-major, three bytes per pixel
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Arrival time of the inbound buffer it was copied from
    pub timestamp: Instant,
}

impl DecodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Smallest and largest byte value in the frame
    pub fn value_range(&self) -> Option<(u8, u8)> {
        self.data.iter().fold(None, |range, &v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Copies the color channels of `src` into a new buffer, dropping the
/// trailing padding byte of four-byte layouts. Channel order is preserved.
pub fn strip_padding(src: &[u8], format: WireFormat) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    if bpp == COLOR_CHANNELS {
        return src.to_vec();
    }

    let mut out = Vec::with_capacity(src.len() / bpp * COLOR_CHANNELS);
    for px in src.chunks_exact(bpp) {
        out.extend_from_slice(&px[..COLOR_CHANNELS]);
    }
    out
}

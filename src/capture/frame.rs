use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// Raw video frame as produced by a capture source
#[derive(Clone)]
pub struct Frame {
    /// Planar pixel data, immutable and cheap to share
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Position in the source's output, starting at 1
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats handled by the software path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 4:2:0, full-resolution Y then quarter-resolution U and V
    I420,
}

impl PixelFormat {
    /// Byte size of one frame
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }
}

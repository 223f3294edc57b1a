pub mod convert;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_stream;
pub mod test_pattern;

pub use frame::{Frame, PixelFormat};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_stream::GstStreamBackend;
pub use test_pattern::TestPatternBackend;

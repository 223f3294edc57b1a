pub mod context;
pub mod interceptor;
pub mod lifecycle;
pub mod params;

pub use context::{PipelineContext, Snapshot, SnapshotBuffer};
pub use interceptor::{FrameInterceptor, FrameVerdict};
pub use lifecycle::{LoopStopper, MediaBackend, PipelineState, StreamPipeline};
pub use params::{AppliedChanges, ParamApplier, StreamControl, StreamParams};

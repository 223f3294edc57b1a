//! Software test-pattern backend.
//!
//! Same two-branch shape as the GStreamer pipeline without a media
//! framework: a generated I420 source feeds a continuous branch that tracks
//! what would be sent to the RTP destination, and a still branch that
//! JPEG-encodes only the frames the interceptor lets through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info, warn};

use crate::capture::convert;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::ControlError;
use crate::pipeline::{
    FrameInterceptor, FrameVerdict, LoopStopper, MediaBackend, ParamApplier, StreamControl,
    StreamParams,
};
use crate::StreamConfig;

/// Quality used when none is configured
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
/// Highest bitrate (kbps) the simulated encoder accepts
pub const MAX_BITRATE: u32 = 2_048_000;

/// Counters and active parameters, shared with observers
#[derive(Debug, Default)]
pub struct TestPatternStats {
    frames: AtomicU64,
    bytes_sent: AtomicU64,
    encodes: AtomicU64,
    reconfigurations: AtomicU64,
    active: Mutex<StreamParams>,
}

impl TestPatternStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Frames that went through the JPEG encoder
    pub fn encodes(&self) -> u64 {
        self.encodes.load(Ordering::Acquire)
    }

    /// Live reconfiguration calls that changed a value
    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations.load(Ordering::Acquire)
    }

    pub fn active_params(&self) -> StreamParams {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Simulated encoder/sink properties
#[derive(Debug, Clone)]
pub struct TestPatternControl {
    stats: Arc<TestPatternStats>,
}

impl StreamControl for TestPatternControl {
    fn bitrate(&self) -> u32 {
        self.stats.active_params().bitrate
    }

    fn set_bitrate(&self, kbps: u32) -> std::result::Result<(), ControlError> {
        if kbps > MAX_BITRATE {
            return Err(ControlError {
                element: "test-encoder".into(),
                property: "bitrate",
                value: kbps.to_string(),
            });
        }
        self.stats.reconfigurations.fetch_add(1, Ordering::AcqRel);
        self.stats
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bitrate = kbps;
        Ok(())
    }

    fn destination(&self) -> (String, u16) {
        let active = self.stats.active_params();
        (active.host, active.port)
    }

    fn set_destination(&self, host: &str, port: u16) -> std::result::Result<(), ControlError> {
        self.stats.reconfigurations.fetch_add(1, Ordering::AcqRel);
        let mut active = self.stats.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.host = host.to_owned();
        active.port = port;
        Ok(())
    }
}

struct ChannelStopper(flume::Sender<()>);

impl LoopStopper for ChannelStopper {
    fn stop(&self) {
        // A full channel already carries a pending stop
        let _ = self.0.try_send(());
    }
}

pub struct TestPatternBackend {
    config: StreamConfig,
    stats: Arc<TestPatternStats>,
    interceptor: Option<FrameInterceptor>,
    stop_tx: flume::Sender<()>,
    stop_rx: flume::Receiver<()>,
    sequence: u64,
}

impl TestPatternBackend {
    pub fn new(config: StreamConfig) -> Self {
        let (stop_tx, stop_rx) = flume::bounded(1);
        Self {
            config,
            stats: Arc::default(),
            interceptor: None,
            stop_tx,
            stop_rx,
            sequence: 0,
        }
    }

    pub fn stats(&self) -> Arc<TestPatternStats> {
        self.stats.clone()
    }

    fn control(&self) -> TestPatternControl {
        TestPatternControl {
            stats: self.stats.clone(),
        }
    }

    /// Moving diagonal gradient with slowly cycling chroma
    fn next_frame(&mut self) -> Frame {
        self.sequence += 1;
        let (width, height) = (self.config.width, self.config.height);
        let (w, h) = (width as usize, height as usize);
        let shift = (self.sequence * 4) as usize;

        let mut data = Vec::with_capacity(PixelFormat::I420.frame_size(width, height));
        for row in 0..h {
            data.extend((0..w).map(|col| ((row + col + shift) & 0xff) as u8));
        }
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        let u = (self.sequence % 256) as u8;
        data.extend(std::iter::repeat(u).take(chroma));
        data.extend(std::iter::repeat(255 - u).take(chroma));

        Frame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                format: PixelFormat::I420,
            }),
            timestamp: Instant::now(),
        }
    }

    fn encode_jpeg(&self, frame: &Frame) -> Result<Vec<u8>> {
        let rgb = convert::to_rgb(frame)?;
        let quality = self
            .config
            .jpeg_quality
            .unwrap_or(DEFAULT_JPEG_QUALITY)
            .clamp(1, 100);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            &rgb,
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }

    fn push_frame(&mut self, interceptor: &FrameInterceptor) {
        let frame = self.next_frame();

        // Continuous branch
        self.stats.frames.fetch_add(1, Ordering::AcqRel);
        self.stats
            .bytes_sent
            .fetch_add(frame.data.len() as u64, Ordering::AcqRel);

        // Still branch
        if interceptor.before_encode() == FrameVerdict::Drop {
            return;
        }
        self.stats.encodes.fetch_add(1, Ordering::AcqRel);
        match self.encode_jpeg(&frame) {
            Ok(jpeg) => {
                debug!(
                    "Encoded test frame {} in {:?} ({} bytes)",
                    frame.meta.sequence,
                    frame.timestamp.elapsed(),
                    jpeg.len()
                );
                interceptor.after_encode(&jpeg)
            }
            Err(e) => interceptor.capture_failed(&format!("{e:#}")),
        }
    }
}

impl MediaBackend for TestPatternBackend {
    fn build(&mut self, params: &StreamParams, interceptor: FrameInterceptor) -> Result<()> {
        let StreamConfig {
            width, height, fps, ..
        } = self.config;
        if width == 0 || height == 0 || fps == 0 {
            return Err(eyre!(
                "Invalid test pattern format {}x{}@{}",
                width,
                height,
                fps
            ));
        }
        *self
            .stats
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = params.clone();
        self.interceptor = Some(interceptor);
        info!("Test pattern: I420 {}x{}@{}fps", width, height, fps);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        if self.interceptor.is_none() {
            return Err(eyre!("Test pattern pipeline was not built"));
        }
        Ok(())
    }

    fn stopper(&self) -> Box<dyn LoopStopper> {
        Box::new(ChannelStopper(self.stop_tx.clone()))
    }

    fn run(&mut self, applier: ParamApplier, interval: Duration) {
        let Some(interceptor) = self.interceptor.clone() else {
            warn!("Test pattern run without a built pipeline");
            return;
        };
        let control = self.control();
        let frame_interval = Duration::from_secs(1) / self.config.fps;
        let mut next_apply = Instant::now() + interval;

        loop {
            match self.stop_rx.recv_timeout(frame_interval) {
                Err(flume::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            }
            self.push_frame(&interceptor);
            if Instant::now() >= next_apply {
                applier.apply(&control);
                next_apply = Instant::now() + interval;
            }
        }
    }

    fn teardown(&mut self) {
        self.interceptor = None;
        while self.stop_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::SnapshotError;
    use crate::pipeline::{PipelineState, StreamPipeline};

    fn config() -> StreamConfig {
        StreamConfig {
            width: 64,
            height: 48,
            fps: 200,
            apply_interval_ms: 20,
            ..StreamConfig::default()
        }
    }

    fn start(config: StreamConfig) -> (StreamPipeline, Arc<TestPatternStats>) {
        let mut pipeline =
            StreamPipeline::new(config.default_params().unwrap(), config.apply_interval());
        let backend = TestPatternBackend::new(config);
        let stats = backend.stats();
        pipeline.start(backend).unwrap();
        (pipeline, stats)
    }

    fn decode(jpeg: &[u8]) -> (u16, u16) {
        let mut decoder = jpeg_decoder::Decoder::new(jpeg);
        decoder.decode().unwrap();
        let info = decoder.info().unwrap();
        (info.width, info.height)
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn concurrent_requests_get_fresh_jpegs() {
        let (pipeline, stats) = start(config());
        assert_eq!(stats.active_params().destination(), "localhost:20000");
        assert_eq!(stats.active_params().bitrate, 256);

        let ctx = pipeline.context().clone();
        let callers: Vec<_> = (0..2)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let observed = ctx.current_frame();
                    (observed, ctx.request_snapshot().unwrap())
                })
            })
            .collect();
        let results: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();

        let latest_observed = results.iter().map(|(observed, _)| *observed).max().unwrap();
        for (observed, snapshot) in &results {
            assert!(snapshot.frame() >= *observed);
            assert_eq!(&snapshot.data()[..2], &[0xff, 0xd8]);
            assert_eq!(decode(snapshot.data()), (64, 48));
        }
        assert!(ctx.snapshot_frame().unwrap() >= latest_observed);
        assert!(stats.encodes() <= stats.frames());
    }

    #[test]
    fn snapshot_latency_is_bounded_by_frame_period() {
        let config = StreamConfig {
            fps: 50,
            ..config()
        };
        let frame_period = Duration::from_secs(1) / config.fps;
        let (pipeline, _stats) = start(config);
        pipeline.request_snapshot().unwrap();

        let latencies: Vec<Duration> = (0..10)
            .map(|_| {
                let requested = Instant::now();
                pipeline.request_snapshot().unwrap();
                requested.elapsed()
            })
            .collect();

        let mean = latencies.iter().sum::<Duration>() / latencies.len() as u32;
        let worst = latencies.iter().max().copied().unwrap();
        assert!(
            mean < frame_period * 2 + Duration::from_millis(20),
            "mean snapshot latency {mean:?} at {frame_period:?} per frame"
        );
        assert!(worst < Duration::from_millis(250), "worst latency {worst:?}");
    }

    #[test]
    fn frames_are_sequenced_and_sized() {
        let mut backend = TestPatternBackend::new(StreamConfig {
            width: 5,
            height: 3,
            ..config()
        });
        let first = backend.next_frame();
        let second = backend.next_frame();
        assert_eq!(first.meta.sequence, 1);
        assert_eq!(second.meta.sequence, 2);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(second.data.len(), PixelFormat::I420.frame_size(5, 3));
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn idle_pipeline_encodes_nothing() {
        let (pipeline, stats) = start(config());
        assert!(wait_until(Duration::from_secs(2), || stats.frames() >= 10));
        assert_eq!(stats.encodes(), 0);
        assert!(stats.bytes_sent() > 0);

        pipeline.request_snapshot().unwrap();
        assert_eq!(stats.encodes(), 1);
    }

    #[test]
    fn staged_parameters_go_live_once() {
        let (pipeline, stats) = start(config());
        pipeline.update_parameters(512, "10.0.0.5", 30000).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            stats.active_params() == StreamParams::new(512, "10.0.0.5", 30000).unwrap()
        }));
        let reconfigurations = stats.reconfigurations();
        assert_eq!(reconfigurations, 2);

        pipeline.update_parameters(512, "10.0.0.5", 30000).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.reconfigurations(), reconfigurations);
    }

    #[test]
    fn out_of_range_bitrate_is_retried_not_fatal() {
        let (pipeline, stats) = start(config());
        pipeline.update_parameters(MAX_BITRATE + 1, "localhost", 20001).unwrap();
        assert!(wait_until(Duration::from_secs(2), || stats.active_params().port == 20001));
        assert_eq!(stats.active_params().bitrate, 256);
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.update_parameters(1024, "localhost", 20001).unwrap();
        assert!(wait_until(Duration::from_secs(2), || stats.active_params().bitrate == 1024));
    }

    #[test]
    fn teardown_before_first_frame_cancels_request() {
        let config = StreamConfig {
            fps: 1,
            ..config()
        };
        let (mut pipeline, _stats) = start(config);
        let ctx = pipeline.context().clone();
        let waiter = thread::spawn(move || ctx.request_snapshot());
        while !pipeline.context().snapshot_requested() {
            thread::yield_now();
        }
        pipeline.stop();
        assert_eq!(waiter.join().unwrap(), Err(SnapshotError::Stopped));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn zero_fps_fails_startup() {
        let config = StreamConfig { fps: 0, ..config() };
        let mut pipeline =
            StreamPipeline::new(config.default_params().unwrap(), config.apply_interval());
        assert!(pipeline.start(TestPatternBackend::new(config)).is_err());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}

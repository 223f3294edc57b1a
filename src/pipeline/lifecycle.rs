//! Pipeline lifecycle: `Created → Starting → Running → Stopping → Stopped`.
//!
//! A single dedicated worker thread owns the media backend. It builds the
//! topology, drives the event loop (which hosts the parameter applier and
//! dispatches the frame interceptor) and tears everything down.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::Result;
use tracing::{error, info, warn};

use crate::error::{ParamsError, PipelineError, SnapshotError};
use crate::pipeline::{FrameInterceptor, ParamApplier, PipelineContext, Snapshot, StreamParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Stops a backend's event loop from another thread
pub trait LoopStopper: Send + Sync {
    /// Must take effect even when called before the loop started running
    fn stop(&self);
}

/// A media framework binding driven by the pipeline worker.
///
/// Every method is called on the worker thread only.
pub trait MediaBackend: Send + 'static {
    /// Construct the two-branch topology with `params` active and the
    /// interceptor attached around the still-image encoder
    fn build(&mut self, params: &StreamParams, interceptor: FrameInterceptor) -> Result<()>;

    /// Transition to the playing state; an error aborts startup
    fn play(&mut self) -> Result<()>;

    fn stopper(&self) -> Box<dyn LoopStopper>;

    /// Drive the event loop until stopped, running `applier` every `interval`
    fn run(&mut self, applier: ParamApplier, interval: Duration);

    /// Return to the idle state and release framework resources
    fn teardown(&mut self);
}

/// Owner of the live pipeline and entry point for caller threads
pub struct StreamPipeline {
    ctx: Arc<PipelineContext>,
    state: Arc<Mutex<PipelineState>>,
    apply_interval: Duration,
    worker: Option<JoinHandle<()>>,
    stopper: Option<Box<dyn LoopStopper>>,
}

impl StreamPipeline {
    pub fn new(defaults: StreamParams, apply_interval: Duration) -> Self {
        Self {
            ctx: PipelineContext::new(defaults),
            state: Arc::new(Mutex::new(PipelineState::Created)),
            apply_interval,
            worker: None,
            stopper: None,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.ctx.request_snapshot()
    }

    pub fn update_parameters(&self, bitrate: u32, host: &str, port: u16) -> Result<(), ParamsError> {
        self.ctx.update_parameters(bitrate, host, port)
    }

    /// Spawn the worker and wait for it to reach `Running`.
    ///
    /// Topology and state-change failures are returned here; failures after
    /// that point are only logged by the worker.
    pub fn start<B: MediaBackend>(&mut self, backend: B) -> Result<(), PipelineError> {
        let state = self.state();
        if state != PipelineState::Created {
            return Err(PipelineError::AlreadyStarted(state));
        }
        let interceptor = self.ctx.attach_interceptor()?;
        let (ready_tx, ready_rx) = flume::bounded(1);

        let worker = Worker {
            backend,
            ctx: self.ctx.clone(),
            state: self.state.clone(),
            apply_interval: self.apply_interval,
        };
        set_state(&self.state, PipelineState::Starting);
        let handle = thread::Builder::new()
            .name("cloudcam-pipeline".into())
            .spawn(move || worker.run(interceptor, ready_tx))
            .map_err(|e| {
                self.ctx.shutdown();
                set_state(&self.state, PipelineState::Stopped);
                PipelineError::Spawn(e)
            })?;

        match ready_rx.recv() {
            Ok(Ok(stopper)) => {
                self.stopper = Some(stopper);
                self.worker = Some(handle);
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(PipelineError::Startup(reason))
            }
            Err(_) => {
                let _ = handle.join();
                self.ctx.shutdown();
                set_state(&self.state, PipelineState::Stopped);
                Err(PipelineError::WorkerExited)
            }
        }
    }

    /// Stop the event loop, wait for teardown and wake pending snapshot
    /// requests. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stopper) = self.stopper.take() {
            stopper.stop();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Pipeline worker panicked");
            }
        }
        // Covers never-started pipelines and a worker that died mid-run
        self.ctx.shutdown();
        set_state(&self.state, PipelineState::Stopped);
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

type Ready = flume::Sender<std::result::Result<Box<dyn LoopStopper>, String>>;

struct Worker<B> {
    backend: B,
    ctx: Arc<PipelineContext>,
    state: Arc<Mutex<PipelineState>>,
    apply_interval: Duration,
}

impl<B: MediaBackend> Worker<B> {
    fn run(mut self, interceptor: FrameInterceptor, ready: Ready) {
        let params = self.ctx.staged_params();
        info!(
            "Building stream pipeline: {}kbps to {}",
            params.bitrate,
            params.destination()
        );

        let started = self
            .backend
            .build(&params, interceptor)
            .and_then(|()| self.backend.play());
        if let Err(e) = started {
            error!("Pipeline failed to start: {:?}", e);
            self.backend.teardown();
            self.ctx.shutdown();
            set_state(&self.state, PipelineState::Stopped);
            let _ = ready.send(Err(format!("{e:#}")));
            return;
        }

        set_state(&self.state, PipelineState::Running);
        if ready.send(Ok(self.backend.stopper())).is_err() {
            warn!("Pipeline owner went away during startup");
        }
        info!("Stream pipeline running");

        self.backend
            .run(ParamApplier::new(self.ctx.clone()), self.apply_interval);

        set_state(&self.state, PipelineState::Stopping);
        self.backend.teardown();
        self.ctx.shutdown();
        set_state(&self.state, PipelineState::Stopped);
        info!("Stream pipeline finished");
    }
}

fn set_state(state: &Mutex<PipelineState>, next: PipelineState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *current != next {
        info!("Pipeline state {:?} -> {:?}", *current, next);
        *current = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use color_eyre::eyre::eyre;

    use super::*;
    use crate::pipeline::{FrameVerdict, StreamControl};

    /// Scripted backend: emits one frame per loop tick and records calls
    #[derive(Default)]
    struct ScriptedBackend {
        fail_build: bool,
        fail_play: bool,
        interceptor: Option<FrameInterceptor>,
        stop: Arc<AtomicBool>,
        teardowns: Arc<AtomicU32>,
    }

    struct FlagStopper(Arc<AtomicBool>);

    impl LoopStopper for FlagStopper {
        fn stop(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct NoControl;

    impl StreamControl for NoControl {
        fn bitrate(&self) -> u32 {
            256
        }
        fn set_bitrate(&self, _: u32) -> std::result::Result<(), crate::error::ControlError> {
            Ok(())
        }
        fn destination(&self) -> (String, u16) {
            ("localhost".into(), 20000)
        }
        fn set_destination(&self, _: &str, _: u16) -> std::result::Result<(), crate::error::ControlError> {
            Ok(())
        }
    }

    impl MediaBackend for ScriptedBackend {
        fn build(&mut self, _: &StreamParams, interceptor: FrameInterceptor) -> Result<()> {
            if self.fail_build {
                return Err(eyre!("no such element: x264enc"));
            }
            self.interceptor = Some(interceptor);
            Ok(())
        }

        fn play(&mut self) -> Result<()> {
            if self.fail_play {
                return Err(eyre!("state change failed"));
            }
            Ok(())
        }

        fn stopper(&self) -> Box<dyn LoopStopper> {
            Box::new(FlagStopper(self.stop.clone()))
        }

        fn run(&mut self, applier: ParamApplier, _: Duration) {
            let interceptor = self.interceptor.take().unwrap();
            while !self.stop.load(Ordering::SeqCst) {
                if interceptor.before_encode() == FrameVerdict::Pass {
                    interceptor.after_encode(b"\xff\xd8\xff\xd9");
                }
                applier.apply(&NoControl);
                thread::sleep(Duration::from_millis(2));
            }
        }

        fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline() -> StreamPipeline {
        StreamPipeline::new(StreamParams::default(), Duration::from_millis(10))
    }

    #[test]
    fn runs_serves_snapshots_and_stops() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.state(), PipelineState::Created);
        let backend = ScriptedBackend::default();
        let teardowns = backend.teardowns.clone();

        pipeline.start(backend).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        let snapshot = pipeline.request_snapshot().unwrap();
        assert_eq!(snapshot.data().as_ref(), b"\xff\xd8\xff\xd9");

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.request_snapshot(), Err(SnapshotError::Stopped));
        pipeline.stop();
    }

    #[test]
    fn build_failure_is_reported_synchronously() {
        let mut pipeline = pipeline();
        let err = pipeline
            .start(ScriptedBackend {
                fail_build: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Startup(ref reason) if reason.contains("x264enc")));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(pipeline.request_snapshot(), Err(SnapshotError::Stopped));
    }

    #[test]
    fn play_failure_never_reaches_running() {
        let mut pipeline = pipeline();
        let backend = ScriptedBackend {
            fail_play: true,
            ..Default::default()
        };
        let teardowns = backend.teardowns.clone();
        assert!(matches!(pipeline.start(backend), Err(PipelineError::Startup(_))));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cannot_start_twice() {
        let mut pipeline = pipeline();
        pipeline.start(ScriptedBackend::default()).unwrap();
        let err = pipeline.start(ScriptedBackend::default()).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStarted(PipelineState::Running)));

        pipeline.stop();
        let err = pipeline.start(ScriptedBackend::default()).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStarted(PipelineState::Stopped)));
    }

    #[test]
    fn stopping_unstarted_pipeline_releases_waiters() {
        let mut pipeline = pipeline();
        let ctx = pipeline.context().clone();
        let waiter = thread::spawn(move || ctx.request_snapshot());
        while !pipeline.context().snapshot_requested() {
            thread::yield_now();
        }
        pipeline.stop();
        assert_eq!(waiter.join().unwrap(), Err(SnapshotError::Stopped));
    }
}

//! GStreamer streaming pipeline with an on-demand JPEG snapshot branch

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ControlError;
use crate::pipeline::{
    FrameInterceptor, FrameVerdict, LoopStopper, MediaBackend, ParamApplier, StreamControl,
    StreamParams,
};
use crate::utils;
use crate::StreamConfig;

/// Live H.264/RTP stream plus a JPEG branch gated by the frame interceptor
pub struct GstStreamBackend {
    config: StreamConfig,
    main_loop: glib::MainLoop,
    pipeline: Option<gst::Pipeline>,
    control: Option<GstStreamControl>,
    probes: Vec<(gst::Pad, gst::PadProbeId)>,
}

impl GstStreamBackend {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            main_loop: glib::MainLoop::new(None, false),
            pipeline: None,
            control: None,
            probes: Vec::new(),
        }
    }

    /// Build the two-branch launch description
    fn build_pipeline_string(config: &StreamConfig) -> String {
        let source = utils::resolve_source(&config.source);
        let quality = config
            .jpeg_quality
            .map(|q| format!(" quality={}", q.min(100)))
            .unwrap_or_default();

        format!(
            "{} name=source ! \
             capsfilter name=source-filter caps=\"video/x-raw,format=I420,width={},height={},framerate={}/1\" ! \
             timeoverlay name=overlay ! \
             tee name=tee \
             tee. ! queue max-size-buffers=2 leaky=downstream ! \
             x264enc name=x264-encoder tune=zerolatency ! \
             capsfilter name=enc-filter caps=\"video/x-h264,profile=baseline\" ! \
             rtph264pay name=rtph264 config-interval=1 pt=96 ! \
             udpsink name=udpsink \
             tee. ! queue max-size-buffers=2 leaky=downstream ! \
             jpegenc name=jpeg-encoder{} ! \
             fakesink name=jpeg-sink sync=false async=false",
            source, config.width, config.height, config.fps, quality
        )
    }

    fn element(pipeline: &gst::Pipeline, name: &str) -> Result<gst::Element> {
        pipeline
            .by_name(name)
            .ok_or_else(|| eyre!("Failed to find {} element", name))
    }

    /// Attach the interceptor around the JPEG encoder
    fn attach_probes(&mut self, jpegenc: &gst::Element, interceptor: FrameInterceptor) -> Result<()> {
        let sink_pad = jpegenc
            .static_pad("sink")
            .ok_or_else(|| eyre!("jpegenc has no sink pad"))?;
        let src_pad = jpegenc
            .static_pad("src")
            .ok_or_else(|| eyre!("jpegenc has no src pad"))?;

        let pre = interceptor.clone();
        let pre_id = sink_pad
            .add_probe(gst::PadProbeType::BUFFER, move |_, _| match pre.before_encode() {
                FrameVerdict::Pass => gst::PadProbeReturn::Ok,
                FrameVerdict::Drop => gst::PadProbeReturn::Drop,
            })
            .ok_or_else(|| eyre!("Failed to add pre-encode probe"))?;
        self.probes.push((sink_pad, pre_id));

        let post = interceptor;
        let post_id = src_pad
            .add_probe(gst::PadProbeType::BUFFER, move |_, info| {
                if let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data {
                    match buffer.map_readable() {
                        Ok(map) => post.after_encode(map.as_slice()),
                        Err(_) => post.capture_failed("failed to map encoded JPEG buffer"),
                    }
                }
                gst::PadProbeReturn::Ok
            })
            .ok_or_else(|| eyre!("Failed to add post-encode probe"))?;
        self.probes.push((src_pad, post_id));
        Ok(())
    }

    fn handle_bus_message(main_loop: &glib::MainLoop, msg: &gst::Message) {
        use gst::MessageView;

        match msg.view() {
            MessageView::Eos(..) => {
                info!("End of stream");
                main_loop.quit();
            }
            MessageView::Error(err) => {
                error!(
                    "Error from {:?}: {} ({:?})",
                    err.src().map(|s| s.path_string()),
                    err.error(),
                    err.debug()
                );
                main_loop.quit();
            }
            MessageView::Warning(warning) => {
                warn!(
                    "Warning from {:?}: {} ({:?})",
                    warning.src().map(|s| s.path_string()),
                    warning.error(),
                    warning.debug()
                );
            }
            _ => {}
        }
    }
}

impl MediaBackend for GstStreamBackend {
    fn build(&mut self, params: &StreamParams, interceptor: FrameInterceptor) -> Result<()> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        let pipeline_str = Self::build_pipeline_string(&self.config);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre!("Failed to create pipeline"))?;

        let control = GstStreamControl {
            encoder: Self::element(&pipeline, "x264-encoder")?,
            sink: Self::element(&pipeline, "udpsink")?,
        };
        control.set_bitrate(params.bitrate)?;
        control.set_destination(&params.host, params.port)?;

        let jpegenc = Self::element(&pipeline, "jpeg-encoder")?;
        self.attach_probes(&jpegenc, interceptor)?;

        self.control = Some(control);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| eyre!("Pipeline was not built"))?;

        info!("Starting GStreamer pipeline");
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start pipeline: {:?}", e))?;

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(success) => {
                debug!("Pipeline state change: {:?}", success);
                Ok(())
            }
            Err(e) => Err(eyre!("Failed to go into PLAYING state: {:?}", e)),
        }
    }

    fn stopper(&self) -> Box<dyn LoopStopper> {
        Box::new(MainLoopStopper(self.main_loop.clone()))
    }

    fn run(&mut self, applier: ParamApplier, interval: Duration) {
        let (Some(pipeline), Some(control)) = (self.pipeline.clone(), self.control.clone()) else {
            warn!("GStreamer run without a built pipeline");
            return;
        };

        let watch = pipeline.bus().map(|bus| {
            let main_loop = self.main_loop.clone();
            bus.add_watch(move |_, msg| {
                Self::handle_bus_message(&main_loop, msg);
                glib::ControlFlow::Continue
            })
        });
        let _watch = match watch {
            Some(Ok(guard)) => Some(guard),
            Some(Err(e)) => {
                warn!("Failed to watch pipeline bus: {}", e);
                None
            }
            None => None,
        };

        let timer = glib::timeout_add(interval, move || {
            applier.apply(&control);
            glib::ControlFlow::Continue
        });

        info!("GStreamer pipeline started");
        self.main_loop.run();
        timer.remove();
    }

    fn teardown(&mut self) {
        for (pad, id) in self.probes.drain(..) {
            pad.remove_probe(id);
        }
        if let Some(pipeline) = self.pipeline.take() {
            info!("Stopping GStreamer pipeline");
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
        self.control = None;
    }
}

/// Quits the main loop from any thread, even before it starts running
struct MainLoopStopper(glib::MainLoop);

impl LoopStopper for MainLoopStopper {
    fn stop(&self) {
        let main_loop = self.0.clone();
        glib::idle_add_once(move || main_loop.quit());
    }
}

/// `x264enc.bitrate` and `udpsink.host`/`udpsink.port`
#[derive(Clone)]
pub struct GstStreamControl {
    encoder: gst::Element,
    sink: gst::Element,
}

impl GstStreamControl {
    fn rejected(element: &gst::Element, property: &'static str, value: impl ToString) -> ControlError {
        ControlError {
            element: element.name().to_string(),
            property,
            value: value.to_string(),
        }
    }
}

impl StreamControl for GstStreamControl {
    fn bitrate(&self) -> u32 {
        self.encoder.property::<u32>("bitrate")
    }

    fn set_bitrate(&self, kbps: u32) -> std::result::Result<(), ControlError> {
        let in_range = self
            .encoder
            .find_property("bitrate")
            .as_ref()
            .and_then(|pspec| pspec.downcast_ref::<glib::ParamSpecUInt>())
            .is_some_and(|spec| (spec.minimum()..=spec.maximum()).contains(&kbps));
        if !in_range {
            return Err(Self::rejected(&self.encoder, "bitrate", kbps));
        }
        self.encoder.set_property("bitrate", kbps);
        Ok(())
    }

    fn destination(&self) -> (String, u16) {
        let host = self
            .sink
            .property::<Option<String>>("host")
            .unwrap_or_default();
        let port = self.sink.property::<i32>("port");
        (host, u16::try_from(port).unwrap_or_default())
    }

    fn set_destination(&self, host: &str, port: u16) -> std::result::Result<(), ControlError> {
        let port = i32::from(port);
        let in_range = self
            .sink
            .find_property("port")
            .as_ref()
            .and_then(|pspec| pspec.downcast_ref::<glib::ParamSpecInt>())
            .is_some_and(|spec| (spec.minimum()..=spec.maximum()).contains(&port));
        if !in_range {
            return Err(Self::rejected(&self.sink, "port", port));
        }
        self.sink.set_property("host", host);
        self.sink.set_property("port", port);
        Ok(())
    }
}

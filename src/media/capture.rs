use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::stream::{FrameSource, LocalStream, MediaProvider};
use crate::config::{MediaConfig, MediaSource};
use crate::error::{ProctorError, Result};

const STARTUP_TIMEOUT_SECS: u64 = 5;
const JPEG_QUALITY: i32 = 80;

struct EncodedChunk {
    data: Vec<u8>,
    duration: Duration,
}

/// Captures camera and microphone through GStreamer, encoding VP8/Opus
/// for the peer tracks and keeping the latest JPEG for frame analysis.
pub struct CameraProvider {
    config: MediaConfig,
    stream_id: String,
}

impl CameraProvider {
    pub fn new(config: MediaConfig, stream_id: impl Into<String>) -> Self {
        Self {
            config,
            stream_id: stream_id.into(),
        }
    }

    fn build(&self) -> Result<LocalStream> {
        gst::init().map_err(|e| ProctorError::MediaAccess(format!("GStreamer init failed: {}", e)))?;

        let pipeline = gst::Pipeline::new();

        let video_src = match self.config.source {
            MediaSource::Device => make("v4l2src")?,
            MediaSource::Test => make("videotestsrc")?,
        };
        match self.config.source {
            MediaSource::Device => video_src.set_property("device", self.config.video_device.as_str()),
            MediaSource::Test => video_src.set_property("is-live", true),
        }

        let videoconvert = make("videoconvert")?;
        let videoscale = make("videoscale")?;
        let video_caps = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw")
                    .field("width", self.config.width as i32)
                    .field("height", self.config.height as i32)
                    .field("framerate", gst::Fraction::new(self.config.framerate as i32, 1))
                    .build(),
            )
            .build()
            .map_err(|e| ProctorError::media(format!("Failed to create capsfilter: {}", e)))?;
        let tee = make("tee")?;

        // Peer branch
        let vp8_queue = make("queue")?;
        let vp8enc = gst::ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("cpu-used", 4i32)
            .property("keyframe-max-dist", 30i32)
            .build()
            .map_err(|e| ProctorError::media(format!("Failed to create vp8enc: {}", e)))?;
        let vp8_sink = appsink("vp8_sink", None)?;

        // Snapshot branch: only the newest frame is kept
        let jpeg_queue = gst::ElementFactory::make("queue")
            .property_from_str("leaky", "downstream")
            .property("max-size-buffers", 1u32)
            .build()
            .map_err(|e| ProctorError::media(format!("Failed to create queue: {}", e)))?;
        let jpegenc = gst::ElementFactory::make("jpegenc")
            .property("quality", JPEG_QUALITY)
            .build()
            .map_err(|e| ProctorError::media(format!("Failed to create jpegenc: {}", e)))?;
        let jpeg_sink = appsink("jpeg_sink", Some(1))?;

        let audio_src = match self.config.source {
            MediaSource::Device => make("autoaudiosrc")?,
            MediaSource::Test => {
                let src = make("audiotestsrc")?;
                src.set_property("is-live", true);
                src
            }
        };
        let audioconvert = make("audioconvert")?;
        let audioresample = make("audioresample")?;
        let opusenc = make("opusenc")?;
        let opus_sink = appsink("opus_sink", None)?;

        pipeline
            .add_many([
                &video_src,
                &videoconvert,
                &videoscale,
                &video_caps,
                &tee,
                &vp8_queue,
                &vp8enc,
                vp8_sink.upcast_ref(),
                &jpeg_queue,
                &jpegenc,
                jpeg_sink.upcast_ref(),
                &audio_src,
                &audioconvert,
                &audioresample,
                &opusenc,
                opus_sink.upcast_ref(),
            ])
            .map_err(|e| ProctorError::media(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([&video_src, &videoconvert, &videoscale, &video_caps, &tee])
            .map_err(|e| ProctorError::media(format!("Failed to link video source: {}", e)))?;
        gst::Element::link_many([&tee, &vp8_queue, &vp8enc, vp8_sink.upcast_ref()])
            .map_err(|e| ProctorError::media(format!("Failed to link VP8 branch: {}", e)))?;
        gst::Element::link_many([&tee, &jpeg_queue, &jpegenc, jpeg_sink.upcast_ref()])
            .map_err(|e| ProctorError::media(format!("Failed to link JPEG branch: {}", e)))?;
        gst::Element::link_many([
            &audio_src,
            &audioconvert,
            &audioresample,
            &opusenc,
            opus_sink.upcast_ref(),
        ])
        .map_err(|e| ProctorError::media(format!("Failed to link audio branch: {}", e)))?;

        let (video_track, audio_track) = LocalStream::create_tracks(&self.stream_id);
        let frame_duration = Duration::from_millis(1000 / u64::from(self.config.framerate.max(1)));
        let pumps = vec![
            pump(&vp8_sink, video_track.clone(), frame_duration),
            pump(&opus_sink, audio_track.clone(), Duration::from_millis(20)),
        ];

        if let Err(e) = start(&pipeline) {
            let _ = pipeline.set_state(gst::State::Null);
            for task in pumps {
                task.abort();
            }
            return Err(e);
        }

        tracing::info!(
            source = ?self.config.source,
            device = %self.config.video_device,
            width = self.config.width,
            height = self.config.height,
            "Local media capture started"
        );

        let frames: Arc<dyn FrameSource> = Arc::new(AppSinkFrames {
            sink: jpeg_sink,
            last: SyncMutex::new(None),
        });

        Ok(
            LocalStream::new(video_track, Some(audio_track), Some(frames)).with_release(move || {
                if let Err(e) = pipeline.set_state(gst::State::Null) {
                    tracing::warn!(error = %e, "Failed to stop capture pipeline");
                }
                for task in pumps {
                    task.abort();
                }
            }),
        )
    }
}

impl MediaProvider for CameraProvider {
    fn acquire(&self) -> BoxFuture<'_, Result<LocalStream>> {
        Box::pin(async move { self.build() })
    }
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| ProctorError::media(format!("Failed to create {}: {}", factory, e)))
}

fn appsink(name: &str, max_buffers: Option<u32>) -> Result<gst_app::AppSink> {
    let mut builder = gst::ElementFactory::make("appsink")
        .name(name)
        .property("sync", false);
    if let Some(max) = max_buffers {
        builder = builder.property("max-buffers", max).property("drop", true);
    }
    builder
        .build()
        .map_err(|e| ProctorError::media(format!("Failed to create appsink: {}", e)))?
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| ProctorError::media("Failed to cast to AppSink"))
}

/// A denied or missing device surfaces here as a failed state change.
fn start(pipeline: &gst::Pipeline) -> Result<()> {
    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| ProctorError::MediaAccess(format!("Failed to start capture: {}", e)))?;

    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STARTUP_TIMEOUT_SECS));
    if result.is_ok() {
        return Ok(());
    }

    let detail = pipeline
        .bus()
        .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
        .and_then(|msg| match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "capture device did not start".to_string());
    Err(ProctorError::MediaAccess(detail))
}

/// Moves encoded buffers from a GStreamer streaming thread onto a track.
fn pump(
    sink: &gst_app::AppSink,
    track: Arc<TrackLocalStaticSample>,
    fallback_duration: Duration,
) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EncodedChunk>();

    sink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                let duration = buffer
                    .duration()
                    .map(|d| Duration::from_nanos(d.nseconds()))
                    .unwrap_or(fallback_duration);

                tx.send(EncodedChunk {
                    data: map.as_slice().to_vec(),
                    duration,
                })
                .map_err(|_| gst::FlowError::Flushing)?;
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let sample = Sample {
                data: chunk.data.into(),
                duration: chunk.duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!(error = %e, "Dropped media sample");
            }
        }
    })
}

struct AppSinkFrames {
    sink: gst_app::AppSink,
    last: SyncMutex<Option<Vec<u8>>>,
}

impl FrameSource for AppSinkFrames {
    fn snapshot(&self) -> Option<Vec<u8>> {
        let fresh = self
            .sink
            .try_pull_sample(gst::ClockTime::ZERO)
            .and_then(|sample| sample.buffer_owned())
            .and_then(|buffer| {
                let map = buffer.map_readable().ok()?;
                Some(map.as_slice().to_vec())
            });

        let mut last = self.last.lock().ok()?;
        if let Some(frame) = fresh {
            *last = Some(frame);
        }
        last.clone()
    }
}

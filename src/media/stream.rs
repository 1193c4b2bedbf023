use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use futures::future::BoxFuture;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;
use crate::room::webrtc_utils::{audio_capability, video_capability};

/// Source of still frames for automated analysis.
pub trait FrameSource: Send + Sync {
    /// Latest JPEG-encoded frame, or `None` when no frame has arrived yet.
    fn snapshot(&self) -> Option<Vec<u8>>;
}

/// Acquires the local camera and microphone.
pub trait MediaProvider: Send + Sync {
    fn acquire(&self) -> BoxFuture<'_, Result<LocalStream>>;
}

type Release = Box<dyn FnOnce() + Send>;

/// The local capture, shared read-only by every peer that transmits it.
/// Only the room coordinator starts and stops it.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalStreamInner>,
}

struct LocalStreamInner {
    video: Arc<TrackLocalStaticSample>,
    audio: Option<Arc<TrackLocalStaticSample>>,
    frames: Option<Arc<dyn FrameSource>>,
    release: SyncMutex<Option<Release>>,
    stopped: AtomicBool,
}

impl LocalStream {
    pub fn new(
        video: Arc<TrackLocalStaticSample>,
        audio: Option<Arc<TrackLocalStaticSample>>,
        frames: Option<Arc<dyn FrameSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalStreamInner {
                video,
                audio,
                frames,
                release: SyncMutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Runs `release` exactly once when the stream stops or is dropped.
    pub fn with_release<F>(self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut slot) = self.inner.release.lock() {
            *slot = Some(Box::new(release));
        }
        self
    }

    /// VP8 and Opus tracks labelled with `stream_id`.
    pub fn create_tracks(
        stream_id: &str,
    ) -> (Arc<TrackLocalStaticSample>, Arc<TrackLocalStaticSample>) {
        let video = Arc::new(TrackLocalStaticSample::new(
            video_capability(),
            "video".to_owned(),
            stream_id.to_owned(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            audio_capability(),
            "audio".to_owned(),
            stream_id.to_owned(),
        ));
        (video, audio)
    }

    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut tracks = vec![self.inner.video.clone()];
        if let Some(audio) = &self.inner.audio {
            tracks.push(audio.clone());
        }
        tracks
    }

    pub fn frames(&self) -> Option<Arc<dyn FrameSource>> {
        self.inner.frames.clone()
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl LocalStreamInner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let release = self.release.lock().ok().and_then(|mut slot| slot.take());
        if let Some(release) = release {
            release();
        }
        tracing::info!("Local media stopped");
    }
}

impl Drop for LocalStreamInner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_release_runs_once() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = released.clone();
        let (video, audio) = LocalStream::create_tracks("stream");
        let stream = LocalStream::new(video, Some(audio), None).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let shared = stream.clone();
        assert_eq!(shared.tracks().len(), 2);
        stream.stop();
        shared.stop();
        assert!(!shared.is_live());
        drop(stream);
        drop(shared);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_capture() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = released.clone();
        let (video, _) = LocalStream::create_tracks("stream");
        let stream = LocalStream::new(video, None, None).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(stream.tracks().len(), 1);
        drop(stream);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::error::{Error, MediaErrorKind};

/// The local capture handle, shared read-only by every negotiation session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LocalMedia {
    pub stream_id: String,
    #[derivative(Debug = "ignore")]
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Where local camera and microphone tracks come from.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Opens the capture. Called lazily, the first time a peer needs local media.
    async fn acquire(&self) -> Result<LocalMedia, Error>;

    /// Called once when the room ends, after every session has been evicted.
    async fn release(&self, media: Arc<LocalMedia>) {
        tracing::debug!("releasing local media {}", media.stream_id);
    }
}

/// Opus audio and VP8 video tracks fed with already encoded samples.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SampleMediaSource {
    stream_id: String,
    audio: bool,
    video: bool,
    #[derivative(Debug = "ignore")]
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl SampleMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: true,
            video: true,
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.audio = enabled;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    /// Pushes one encoded sample into the acquired track of the given kind.
    pub async fn write_sample(&self, kind: RTPCodecType, sample: &Sample) -> Result<(), Error> {
        let track = {
            let tracks = self.tracks.lock().await;
            tracks.iter().find(|t| t.kind() == kind).cloned()
        };
        let track = track.ok_or_else(|| {
            Error::new_media(
                format!("{} track is not acquired", kind),
                MediaErrorKind::DeviceUnavailableError,
            )
        })?;
        track.write_sample(sample).await?;
        Ok(())
    }

    fn new_track(&self, mime_type: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            Uuid::new_v4().to_string(),
            self.stream_id.clone(),
        ))
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, Error> {
        if !self.audio && !self.video {
            return Err(Error::new_media(
                "neither audio nor video capture is enabled".to_owned(),
                MediaErrorKind::DeviceUnavailableError,
            ));
        }

        let mut created = Vec::new();
        if self.audio {
            created.push(self.new_track(MIME_TYPE_OPUS));
        }
        if self.video {
            created.push(self.new_track(MIME_TYPE_VP8));
        }

        let tracks = created
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TrackLocal + Send + Sync>)
            .collect();
        *self.tracks.lock().await = created;

        tracing::info!("local media {} acquired", self.stream_id);
        Ok(LocalMedia::new(self.stream_id.clone(), tracks))
    }

    async fn release(&self, media: Arc<LocalMedia>) {
        self.tracks.lock().await.clear();
        tracing::info!("local media {} released", media.stream_id);
    }
}

/// For participants that only watch: no local tracks at all.
#[derive(Debug, Default)]
pub struct ReceiveOnlyMediaSource;

#[async_trait]
impl MediaSource for ReceiveOnlyMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, Error> {
        Ok(LocalMedia::new(Uuid::new_v4().to_string(), vec![]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_sample_source_creates_audio_and_video() {
        let source = SampleMediaSource::new("alice");
        let media = source.acquire().await.unwrap();
        assert_eq!(media.stream_id, "alice");
        let kinds: Vec<RTPCodecType> = media.tracks().iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![RTPCodecType::Audio, RTPCodecType::Video]);
        assert!(media.tracks().iter().all(|t| t.stream_id() == "alice"));
    }

    #[tokio::test]
    async fn test_sample_source_without_devices_fails() {
        let source = SampleMediaSource::new("alice")
            .with_audio(false)
            .with_video(false);
        assert!(source.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_write_before_acquire_fails() {
        let source = SampleMediaSource::new("alice").with_audio(false);
        let err = source
            .write_sample(RTPCodecType::Video, &Sample::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaError(_)));
    }

    #[tokio::test]
    async fn test_release_forgets_tracks() {
        let source = SampleMediaSource::new("alice").with_video(false);
        let media = Arc::new(source.acquire().await.unwrap());
        source.release(media).await;
        assert!(source
            .write_sample(RTPCodecType::Audio, &Sample::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_receive_only_has_no_tracks() {
        let media = ReceiveOnlyMediaSource.acquire().await.unwrap();
        assert!(media.is_empty());
    }
}

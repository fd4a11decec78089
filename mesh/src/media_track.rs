use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use webrtc::{rtp_transceiver::rtp_codec::RTPCodecType, track::track_remote::TrackRemote};

use crate::envelope::ParticipantId;

/// A media track received from a remote participant.
///
/// Implemented for [`TrackRemote`]; use [`RemoteTrack::as_any`] to downcast and
/// read RTP from it.
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> RTPCodecType;
    fn as_any(&self) -> &dyn Any;
}

impl RemoteTrack for TrackRemote {
    fn id(&self) -> String {
        TrackRemote::id(self)
    }

    fn stream_id(&self) -> String {
        TrackRemote::stream_id(self)
    }

    fn kind(&self) -> RTPCodecType {
        TrackRemote::kind(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for dyn RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// The media stream a remote participant sends us. Published once per
/// negotiation session; later tracks of the same stream are added in place.
pub struct RemoteStream {
    pub id: String,
    pub participant_id: ParticipantId,
    tracks: Mutex<Vec<Arc<dyn RemoteTrack>>>,
}

impl RemoteStream {
    pub(crate) fn new(participant_id: ParticipantId, track: Arc<dyn RemoteTrack>) -> Self {
        Self {
            id: track.stream_id(),
            participant_id,
            tracks: Mutex::new(vec![track]),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn RemoteTrack>> {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `false` when a track with the same id is already part of the stream.
    pub(crate) fn add_track(&self, track: Arc<dyn RemoteTrack>) -> bool {
        let mut tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        let id = track.id();
        if tracks.iter().any(|t| t.id() == id) {
            return false;
        }
        tracks.push(track);
        true
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("participant_id", &self.participant_id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

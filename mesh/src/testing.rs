use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
    rtp_transceiver::rtp_codec::RTPCodecType,
    track::track_local::TrackLocal,
};

use crate::{
    envelope::ParticipantId,
    error::{Error, MediaErrorKind, TransportErrorKind},
    media_source::{LocalMedia, MediaSource, SampleMediaSource},
    media_track::RemoteTrack,
    negotiation::SessionEvent,
    peer_connection::{ConnectionEvent, ConnectionFactory, PeerConnection},
    relay::{RelayChannel, RelayConnector, RelayEvent},
};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
    let mut description = RTCSessionDescription::default();
    description.sdp_type = sdp_type;
    description.sdp = sdp.to_owned();
    description
}

pub(crate) fn candidate(candidate: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.to_owned(),
        ..Default::default()
    }
}

pub(crate) async fn next_session_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session event channel closed")
}

#[derive(Debug)]
pub(crate) struct FakeTrack {
    id: String,
    stream_id: String,
    kind: RTPCodecType,
}

impl FakeTrack {
    pub(crate) fn audio(stream_id: &str, id: &str) -> Arc<dyn RemoteTrack> {
        Self::new(stream_id, id, RTPCodecType::Audio)
    }

    pub(crate) fn video(stream_id: &str, id: &str) -> Arc<dyn RemoteTrack> {
        Self::new(stream_id, id, RTPCodecType::Video)
    }

    fn new(stream_id: &str, id: &str, kind: RTPCodecType) -> Arc<dyn RemoteTrack> {
        Arc::new(Self {
            id: id.to_owned(),
            stream_id: stream_id.to_owned(),
            kind,
        })
    }
}

impl RemoteTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> RTPCodecType {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(RTCSdpType),
    SetRemote(RTCSdpType),
    AddCandidate(String),
    AddTrack(String),
    AddReceiver(RTPCodecType),
    Close,
}

/// Records every call and answers with canned descriptions.
#[derive(Debug)]
pub(crate) struct FakeConnection {
    remote_id: String,
    calls: Mutex<Vec<Call>>,
    local: Mutex<Option<RTCSessionDescription>>,
    fail_offers: bool,
    reject_candidates: bool,
    answer_gate: Option<Arc<Notify>>,
}

impl FakeConnection {
    pub(crate) fn new(remote_id: &str) -> Self {
        Self {
            remote_id: remote_id.to_owned(),
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            fail_offers: false,
            reject_candidates: false,
            answer_gate: None,
        }
    }

    pub(crate) fn fail_offers(mut self) -> Self {
        self.fail_offers = true;
        self
    }

    pub(crate) fn reject_candidates(mut self) -> Self {
        self.reject_candidates = true;
        self
    }

    /// `create_answer` blocks until the returned gate is notified.
    pub(crate) fn gate_answers(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.answer_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for(&self, call: Call) {
        tokio::time::timeout(WAIT, async {
            while !self.calls().contains(&call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}, saw {:?}", call, self.calls()));
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        self.record(Call::CreateOffer);
        if self.fail_offers {
            return Err(Error::new_transport(
                "offer refused".to_owned(),
                TransportErrorKind::PeerConnectionError,
            ));
        }
        Ok(description(
            RTCSdpType::Offer,
            &format!("offer-for-{}", self.remote_id),
        ))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        self.record(Call::CreateAnswer);
        if let Some(gate) = &self.answer_gate {
            gate.notified().await;
        }
        Ok(description(
            RTCSdpType::Answer,
            &format!("answer-for-{}", self.remote_id),
        ))
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.record(Call::SetLocal(sdp.sdp_type));
        *self.local.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.record(Call::SetRemote(sdp.sdp_type));
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.record(Call::AddCandidate(candidate.candidate));
        if self.reject_candidates {
            return Err(Error::new_transport(
                "candidate refused".to_owned(),
                TransportErrorKind::ICECandidateError,
            ));
        }
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), Error> {
        self.record(Call::AddTrack(track.id().to_owned()));
        Ok(())
    }

    async fn add_receiver(&self, kind: RTPCodecType) -> Result<(), Error> {
        self.record(Call::AddReceiver(kind));
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Hands out [`FakeConnection`]s and keeps their event senders so tests can
/// play the part of the media transport.
#[derive(Debug, Default)]
pub(crate) struct FakeConnectionFactory {
    connections: Mutex<HashMap<ParticipantId, Vec<Arc<FakeConnection>>>>,
    events: Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<ConnectionEvent>>>,
    refused: Mutex<Vec<ParticipantId>>,
}

impl FakeConnectionFactory {
    pub(crate) fn refuse(&self, remote_id: &str) {
        self.refused.lock().unwrap().push(ParticipantId::from(remote_id));
    }

    pub(crate) fn created(&self) -> usize {
        self.connections.lock().unwrap().values().map(Vec::len).sum()
    }

    /// The latest connection created for `remote_id`.
    pub(crate) fn connection(&self, remote_id: &str) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[&ParticipantId::from(remote_id)]
            .last()
            .cloned()
            .unwrap()
    }

    pub(crate) fn emit(&self, remote_id: &str, event: ConnectionEvent) {
        self.events.lock().unwrap()[&ParticipantId::from(remote_id)]
            .send(event)
            .unwrap();
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        if self.refused.lock().unwrap().contains(remote_id) {
            return Err(Error::new_transport(
                format!("connection to {} refused", remote_id),
                TransportErrorKind::PeerConnectionError,
            ));
        }
        let connection = Arc::new(FakeConnection::new(remote_id.as_str()));
        self.connections
            .lock()
            .unwrap()
            .entry(remote_id.clone())
            .or_default()
            .push(Arc::clone(&connection));
        self.events.lock().unwrap().insert(remote_id.clone(), events);
        Ok(connection)
    }
}

/// Real sample tracks, with acquisition and release counted.
#[derive(Debug)]
pub(crate) struct CountingMediaSource {
    inner: SampleMediaSource,
    failures_left: AtomicUsize,
    receive_only: bool,
    attempts: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl CountingMediaSource {
    pub(crate) fn new() -> Self {
        Self::failing(0)
    }

    /// Refuses the first `failures` acquisitions, like a denied permission prompt.
    pub(crate) fn failing(failures: usize) -> Self {
        Self {
            inner: SampleMediaSource::new("local-stream"),
            failures_left: AtomicUsize::new(failures),
            receive_only: false,
            attempts: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Acquisition succeeds with no tracks, like a participant without devices.
    pub(crate) fn receive_only() -> Self {
        Self {
            receive_only: true,
            ..Self::new()
        }
    }

    /// Every acquisition call, failed or not.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for CountingMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::new_media(
                "camera permission denied".to_owned(),
                MediaErrorKind::PermissionDeniedError,
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.receive_only {
            return Ok(LocalMedia::new("local-stream", vec![]));
        }
        self.inner.acquire().await
    }

    async fn release(&self, media: Arc<LocalMedia>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(media).await;
    }
}

/// The far side of a [`MemoryConnector`] connection.
#[derive(Debug)]
pub(crate) struct MemoryRelay {
    pub(crate) frames: mpsc::UnboundedReceiver<String>,
    pub(crate) events: mpsc::UnboundedSender<RelayEvent>,
}

impl MemoryRelay {
    pub(crate) fn open(&self) {
        self.events.send(RelayEvent::Open).unwrap();
    }

    pub(crate) fn deliver(&self, frame: impl Into<String>) {
        self.events.send(RelayEvent::Frame(frame.into())).unwrap();
    }

    pub(crate) async fn next_frame(&mut self) -> serde_json::Value {
        let frame = tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a relay frame")
            .expect("relay frame channel closed");
        serde_json::from_str(&frame).unwrap()
    }
}

/// In-process relay; the test holds the other end.
#[derive(Debug, Default)]
pub(crate) struct MemoryConnector {
    relay: Mutex<Option<MemoryRelay>>,
}

impl MemoryConnector {
    pub(crate) fn take_relay(&self) -> MemoryRelay {
        self.relay.lock().unwrap().take().expect("not connected")
    }
}

impl RelayConnector for MemoryConnector {
    fn connect(&self) -> RelayChannel {
        let (frame_sender, frames) = mpsc::unbounded_channel();
        let (events, event_receiver) = mpsc::unbounded_channel();
        *self.relay.lock().unwrap() = Some(MemoryRelay { frames, events });
        RelayChannel {
            frames: frame_sender,
            events: event_receiver,
        }
    }
}

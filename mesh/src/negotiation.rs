use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::{
        ice_candidate::RTCIceCandidateInit, ice_connection_state::RTCIceConnectionState,
    },
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
};

use crate::{
    envelope::{Action, ParticipantId},
    error::{Error, TransportErrorKind},
    media_track::{RemoteStream, RemoteTrack},
    peer_connection::{ConnectionEvent, PeerConnection},
};

/// Which side sends the first offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Offer/answer progress of one session.
///
/// Initiator: `New -> HaveLocalOffer -> Negotiating -> Connected`.
/// Responder: `New -> Negotiating -> Connected`.
/// Any state can fall into `Failed` or `Closed`, which are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }
}

#[derive(Debug)]
pub(crate) enum SessionInput {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

/// Reported by a running session to its owner.
#[derive(Debug)]
pub struct SessionEvent {
    pub remote_id: ParticipantId,
    /// Tells events of an evicted session apart from its replacement.
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// A description or candidate to be sent to the remote participant.
    Signal {
        action: Action,
        data: serde_json::Value,
    },
    StateChanged(NegotiationState),
    RemoteStream(Arc<RemoteStream>),
}

/// Handle of the negotiation with one remote participant.
///
/// The negotiation itself runs in its own task; this handle feeds it inbound
/// signals and mirrors the state it reports.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct NegotiationSession {
    pub remote_id: ParticipantId,
    pub role: Role,
    generation: u64,
    state: NegotiationState,
    remote_stream: Option<Arc<RemoteStream>>,
    #[derivative(Debug = "ignore")]
    connection: Arc<dyn PeerConnection>,
    #[derivative(Debug = "ignore")]
    inputs: mpsc::UnboundedSender<SessionInput>,
    closed: Arc<AtomicBool>,
}

impl NegotiationSession {
    pub(crate) fn spawn(
        remote_id: ParticipantId,
        role: Role,
        generation: u64,
        connection: Arc<dyn PeerConnection>,
        connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (inputs, input_receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let driver = SessionDriver {
            remote_id: remote_id.clone(),
            role,
            generation,
            state: NegotiationState::New,
            connection: Arc::clone(&connection),
            pending_candidates: Vec::new(),
            has_remote_description: false,
            remote_stream: None,
            events,
            closed: Arc::clone(&closed),
        };
        tokio::spawn(driver.run(input_receiver, connection_events));

        Self {
            remote_id,
            role,
            generation,
            state: NegotiationState::New,
            remote_stream: None,
            connection,
            inputs,
            closed,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.remote_stream.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&mut self, state: NegotiationState) {
        if !self.state.is_terminal() {
            self.state = state;
        }
    }

    pub(crate) fn set_remote_stream(&mut self, stream: Arc<RemoteStream>) {
        self.remote_stream = Some(stream);
    }

    pub(crate) fn deliver(&self, input: SessionInput) {
        if self.is_closed() {
            tracing::debug!("session for {} is closed, dropping input", self.remote_id);
            return;
        }
        if self.inputs.send(input).is_err() {
            tracing::debug!("session for {} is no longer running", self.remote_id);
        }
    }

    /// Stops the session. Results of operations still in flight are discarded.
    pub(crate) fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state = NegotiationState::Closed;
        self.remote_stream = None;

        let connection = Arc::clone(&self.connection);
        let remote_id = self.remote_id.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.close().await {
                tracing::warn!("failed to close connection with {}: {}", remote_id, err);
            }
        });
    }
}

struct SessionDriver {
    remote_id: ParticipantId,
    role: Role,
    generation: u64,
    state: NegotiationState,
    connection: Arc<dyn PeerConnection>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    has_remote_description: bool,
    remote_stream: Option<Arc<RemoteStream>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        tracing::debug!(
            "negotiation with {} started as {:?}",
            self.remote_id,
            self.role
        );

        if self.role == Role::Initiator {
            let result = self.start_offer().await;
            self.settle(result);
        }

        while !self.state.is_terminal() && !self.is_closed() {
            tokio::select! {
                input = inputs.recv() => {
                    match input {
                        Some(input) => {
                            let result = self.on_input(input).await;
                            self.settle(result);
                        }
                        None => break,
                    }
                }
                Some(event) = connection_events.recv() => {
                    let result = self.on_connection_event(event);
                    self.settle(result);
                }
            }
        }

        tracing::debug!(
            "negotiation with {} finished in {:?}",
            self.remote_id,
            self.state
        );
    }

    async fn on_input(&mut self, input: SessionInput) -> Result<(), Error> {
        match input {
            SessionInput::Offer(offer) => self.on_offer(offer).await,
            SessionInput::Answer(answer) => self.on_answer(answer).await,
            SessionInput::Candidate(candidate) => self.on_candidate(candidate).await,
        }
    }

    fn settle(&mut self, result: Result<(), Error>) {
        let Err(err) = result else {
            return;
        };
        if self.is_closed() {
            tracing::debug!("discarding result for closed session {}: {}", self.remote_id, err);
            return;
        }
        tracing::error!("negotiation with {} failed: {}", self.remote_id, err);
        self.transition(NegotiationState::Failed);
    }

    async fn start_offer(&mut self) -> Result<(), Error> {
        tracing::debug!("creating offer for {}", self.remote_id);
        let offer = self.connection.create_offer().await?;
        self.ensure_open()?;
        self.connection.set_local_description(offer).await?;
        self.ensure_open()?;
        let offer = self.local_description().await?;

        self.transition(NegotiationState::HaveLocalOffer);
        self.signal(Action::Offer, serde_json::to_value(&offer)?);
        Ok(())
    }

    async fn on_offer(&mut self, offer: RTCSessionDescription) -> Result<(), Error> {
        if self.state == NegotiationState::HaveLocalOffer {
            tracing::warn!(
                "ignoring offer from {} while our own offer is pending",
                self.remote_id
            );
            return Ok(());
        }

        tracing::debug!("received offer from {}", self.remote_id);
        self.transition(NegotiationState::Negotiating);
        self.apply_remote_description(offer).await?;

        let answer = self.connection.create_answer().await?;
        self.ensure_open()?;
        self.connection.set_local_description(answer).await?;
        self.ensure_open()?;
        let answer = self.local_description().await?;

        self.signal(Action::Answer, serde_json::to_value(&answer)?);
        self.transition(NegotiationState::Connected);
        Ok(())
    }

    async fn on_answer(&mut self, answer: RTCSessionDescription) -> Result<(), Error> {
        if self.state != NegotiationState::HaveLocalOffer {
            tracing::warn!(
                "ignoring answer from {} in {:?}",
                self.remote_id,
                self.state
            );
            return Ok(());
        }

        tracing::debug!("received answer from {}", self.remote_id);
        self.transition(NegotiationState::Negotiating);
        self.apply_remote_description(answer).await?;
        self.transition(NegotiationState::Connected);
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if !self.has_remote_description {
            tracing::debug!("pending ICE candidate from {}", self.remote_id);
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.add_candidate(candidate).await;
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.connection.set_remote_description(description).await?;
        self.ensure_open()?;
        self.has_remote_description = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(
                "adding {} pending ICE candidates from {}",
                pending.len(),
                self.remote_id
            );
        }
        for candidate in pending {
            self.add_candidate(candidate).await;
            self.ensure_open()?;
        }
        Ok(())
    }

    // A single bad candidate never fails the whole negotiation.
    async fn add_candidate(&self, candidate: RTCIceCandidateInit) {
        if let Err(err) = self.connection.add_ice_candidate(candidate).await {
            tracing::warn!("failed to add ICE candidate from {}: {}", self.remote_id, err);
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<(), Error> {
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                self.signal(Action::Candidate, serde_json::to_value(&candidate)?);
            }
            ConnectionEvent::Track(track) => self.on_track(track),
            ConnectionEvent::IceConnectionStateChange(state) => {
                tracing::info!("ICE connection with {} is {}", self.remote_id, state);
                if matches!(
                    state,
                    RTCIceConnectionState::Disconnected
                        | RTCIceConnectionState::Failed
                        | RTCIceConnectionState::Closed
                ) {
                    self.transition(NegotiationState::Failed);
                }
            }
            ConnectionEvent::PeerConnectionStateChange(state) => {
                tracing::info!("peer connection with {} is {}", self.remote_id, state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    self.transition(NegotiationState::Failed);
                }
            }
        }
        Ok(())
    }

    fn on_track(&mut self, track: Arc<dyn RemoteTrack>) {
        if let Some(stream) = self.remote_stream.as_ref() {
            if stream.id != track.stream_id() {
                tracing::debug!(
                    "ignoring track of stream {} from {}, {} is already published",
                    track.stream_id(),
                    self.remote_id,
                    stream.id
                );
            } else if stream.add_track(Arc::clone(&track)) {
                tracing::debug!("track {} added to stream {}", track.id(), stream.id);
            }
            return;
        }

        let stream = Arc::new(RemoteStream::new(self.remote_id.clone(), track));
        tracing::info!("remote stream {} from {}", stream.id, self.remote_id);
        self.remote_stream = Some(Arc::clone(&stream));
        self.emit(SessionEventKind::RemoteStream(stream));
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, Error> {
        let description = self.connection.local_description().await;
        self.ensure_open()?;
        description.ok_or_else(|| {
            Error::new_transport(
                "Failed to set local description".to_string(),
                TransportErrorKind::LocalDescriptionError,
            )
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new_transport(
                format!("session for {} is closed", self.remote_id),
                TransportErrorKind::SessionClosedError,
            ));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transition(&mut self, state: NegotiationState) {
        if self.state == state || self.state.is_terminal() {
            return;
        }
        tracing::debug!(
            "negotiation with {}: {:?} -> {:?}",
            self.remote_id,
            self.state,
            state
        );
        self.state = state;
        self.emit(SessionEventKind::StateChanged(state));
    }

    fn signal(&self, action: Action, data: serde_json::Value) {
        self.emit(SessionEventKind::Signal { action, data });
    }

    fn emit(&self, kind: SessionEventKind) {
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(SessionEvent {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

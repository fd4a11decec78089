use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use tokio::sync::{broadcast, mpsc};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::{
    envelope::{Action, Inbound, ParticipantId},
    error::Error,
    media_source::{LocalMedia, MediaSource},
    media_track::RemoteStream,
    negotiation::{
        NegotiationSession, NegotiationState, Role, SessionEvent, SessionEventKind, SessionInput,
    },
    peer_connection::ConnectionFactory,
};

/// What a room reports to its observers.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    PeerAdded {
        participant_id: ParticipantId,
        role: Role,
    },
    PeerConnected {
        participant_id: ParticipantId,
    },
    PeerDisconnected {
        participant_id: ParticipantId,
    },
    StreamUpdated {
        participant_id: ParticipantId,
        stream: Arc<RemoteStream>,
    },
    LocalMediaReady(Arc<LocalMedia>),
    /// Capture could not be opened; the room keeps working receive-only.
    LocalMediaUnavailable(String),
    RelayOpened,
    RelayClosed,
    RelayError(String),
}

/// A description or candidate a session wants delivered to `target_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundSignal {
    pub target_id: ParticipantId,
    pub action: Action,
    pub data: serde_json::Value,
}

/// Owns one [`NegotiationSession`] per remote participant.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerMeshManager {
    local_id: ParticipantId,
    sessions: HashMap<ParticipantId, NegotiationSession>,
    #[derivative(Debug = "ignore")]
    factory: Arc<dyn ConnectionFactory>,
    #[derivative(Debug = "ignore")]
    media_source: Arc<dyn MediaSource>,
    local_media: Option<Arc<LocalMedia>>,
    next_generation: u64,
    #[derivative(Debug = "ignore")]
    session_event_sender: mpsc::UnboundedSender<SessionEvent>,
    #[derivative(Debug = "ignore")]
    mesh_event_sender: broadcast::Sender<MeshEvent>,
}

impl PeerMeshManager {
    pub fn new(
        local_id: ParticipantId,
        factory: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
        session_event_sender: mpsc::UnboundedSender<SessionEvent>,
        mesh_event_sender: broadcast::Sender<MeshEvent>,
    ) -> Self {
        Self {
            local_id,
            sessions: HashMap::new(),
            factory,
            media_source,
            local_media: None,
            next_generation: 0,
            session_event_sender,
            mesh_event_sender,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.sessions.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, remote_id: &ParticipantId) -> Option<&NegotiationSession> {
        self.sessions.get(remote_id)
    }

    pub fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.local_media.clone()
    }

    /// Published streams of live sessions, keyed by participant.
    pub fn remote_streams(&self) -> HashMap<ParticipantId, Arc<RemoteStream>> {
        self.sessions
            .iter()
            .filter_map(|(id, session)| session.remote_stream().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Opens local capture once. A failure is not cached: the next caller tries
    /// again, and until then sessions are built without local tracks.
    pub async fn acquire_local_media(&mut self) -> Option<Arc<LocalMedia>> {
        if let Some(media) = &self.local_media {
            return Some(Arc::clone(media));
        }

        match self.media_source.acquire().await {
            Ok(media) => {
                let media = Arc::new(media);
                tracing::info!("local media {} is ready", media.stream_id);
                self.local_media = Some(Arc::clone(&media));
                self.emit(MeshEvent::LocalMediaReady(Arc::clone(&media)));
                Some(media)
            }
            Err(err) => {
                tracing::warn!("local media is unavailable, continuing receive-only: {}", err);
                self.emit(MeshEvent::LocalMediaUnavailable(err.to_string()));
                None
            }
        }
    }

    /// Creates a session for `remote_id` unless one already exists.
    ///
    /// Returns `Ok(false)` when nothing was created: the id is our own, or a
    /// session is already live. An error means only this peer could not be
    /// set up.
    pub async fn ensure_session(
        &mut self,
        remote_id: ParticipantId,
        role: Role,
    ) -> Result<bool, Error> {
        if !self.needs_session(&remote_id) {
            return Ok(false);
        }
        let local_media = self.acquire_local_media().await;
        self.create_session(remote_id, role, local_media).await?;
        Ok(true)
    }

    /// Reacts to the member list of a freshly joined room: we offer to
    /// everyone already there. Local media is acquired at most once for the
    /// whole list. Returns how many sessions were created.
    pub async fn connect_members(&mut self, clients: Vec<ParticipantId>) -> usize {
        let clients: Vec<ParticipantId> = clients
            .into_iter()
            .filter(|client| self.needs_session(client))
            .collect();
        if clients.is_empty() {
            return 0;
        }

        let local_media = self.acquire_local_media().await;
        let mut created = 0;
        for client in clients {
            // The list may name a member twice.
            if self.sessions.contains_key(&client) {
                continue;
            }
            match self
                .create_session(client.clone(), Role::Initiator, local_media.clone())
                .await
            {
                Ok(()) => created += 1,
                Err(err) => tracing::error!("failed to connect to {}: {}", client, err),
            }
        }
        created
    }

    fn needs_session(&self, remote_id: &ParticipantId) -> bool {
        if *remote_id == self.local_id {
            tracing::debug!("not creating a session with ourselves");
            return false;
        }
        if self.sessions.contains_key(remote_id) {
            tracing::debug!("session for {} already exists", remote_id);
            return false;
        }
        true
    }

    async fn create_session(
        &mut self,
        remote_id: ParticipantId,
        role: Role,
        local_media: Option<Arc<LocalMedia>>,
    ) -> Result<(), Error> {
        let (connection_event_sender, connection_events) = mpsc::unbounded_channel();
        let connection = self
            .factory
            .create(&remote_id, connection_event_sender)
            .await?;

        let mut sending = Vec::new();
        if let Some(media) = local_media {
            for track in media.tracks() {
                match connection.add_track(Arc::clone(track)).await {
                    Ok(()) => sending.push(track.kind()),
                    Err(err) => tracing::warn!(
                        "failed to attach local track {} for {}: {}",
                        track.id(),
                        remote_id,
                        err
                    ),
                }
            }
        }

        // The offer must name every kind we want to receive. A responder's
        // transceivers follow the remote offer instead.
        if role == Role::Initiator {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                if sending.contains(&kind) {
                    continue;
                }
                if let Err(err) = connection.add_receiver(kind).await {
                    tracing::warn!("failed to add {} receiver for {}: {}", kind, remote_id, err);
                }
            }
        }

        self.next_generation += 1;
        let session = NegotiationSession::spawn(
            remote_id.clone(),
            role,
            self.next_generation,
            connection,
            connection_events,
            self.session_event_sender.clone(),
        );
        self.sessions.insert(remote_id.clone(), session);

        tracing::info!("session for {} is created as {:?}", remote_id, role);
        self.emit(MeshEvent::PeerAdded {
            participant_id: remote_id,
            role,
        });
        Ok(())
    }

    /// Routes an offer, answer or candidate to the session of its sender.
    /// Messages from participants without a live session are dropped.
    pub fn dispatch(&mut self, inbound: Inbound) {
        let (sender, input) = match inbound {
            Inbound::Offer {
                sender,
                description,
            } => (sender, SessionInput::Offer(description)),
            Inbound::Answer {
                sender,
                description,
            } => (sender, SessionInput::Answer(description)),
            Inbound::Candidate { sender, candidate } => {
                (sender, SessionInput::Candidate(candidate))
            }
            Inbound::Joined { .. } | Inbound::NewPeer { .. } => {
                tracing::warn!("membership messages are not routed to sessions");
                return;
            }
        };

        match self.sessions.get(&sender) {
            Some(session) => session.deliver(input),
            None => tracing::debug!("dropping message from unknown participant {}", sender),
        }
    }

    /// Closes and forgets the session for `remote_id`. Safe to call repeatedly.
    pub fn evict(&mut self, remote_id: &ParticipantId) -> bool {
        let Some(mut session) = self.sessions.remove(remote_id) else {
            return false;
        };
        session.close();
        tracing::info!("session for {} is evicted", remote_id);
        self.emit(MeshEvent::PeerDisconnected {
            participant_id: remote_id.clone(),
        });
        true
    }

    /// Applies a report from a running session. Returns the signal to relay,
    /// if the session produced one.
    pub fn handle_session_event(&mut self, event: SessionEvent) -> Option<OutboundSignal> {
        let Some(session) = self.sessions.get_mut(&event.remote_id) else {
            tracing::debug!("dropping event of evicted session {}", event.remote_id);
            return None;
        };
        if session.generation() != event.generation {
            tracing::debug!(
                "dropping event of stale session {} generation {}",
                event.remote_id,
                event.generation
            );
            return None;
        }

        match event.kind {
            SessionEventKind::Signal { action, data } => Some(OutboundSignal {
                target_id: event.remote_id,
                action,
                data,
            }),
            SessionEventKind::StateChanged(state) => {
                session.set_state(state);
                match state {
                    NegotiationState::Connected => self.emit(MeshEvent::PeerConnected {
                        participant_id: event.remote_id,
                    }),
                    NegotiationState::Failed => {
                        tracing::warn!("negotiation with {} failed", event.remote_id);
                        self.evict(&event.remote_id);
                    }
                    _ => {}
                }
                None
            }
            SessionEventKind::RemoteStream(stream) => {
                session.set_remote_stream(Arc::clone(&stream));
                self.emit(MeshEvent::StreamUpdated {
                    participant_id: event.remote_id,
                    stream,
                });
                None
            }
        }
    }

    /// Evicts every session, then releases local media.
    pub async fn close(&mut self) {
        let remote_ids: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        for remote_id in remote_ids.iter() {
            self.evict(remote_id);
        }
        if let Some(media) = self.local_media.take() {
            self.media_source.release(media).await;
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is not an error.
        let _ = self.mesh_event_sender.send(event);
    }
}

use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    config::RoomConfig,
    envelope::{Envelope, Inbound, ParticipantId, RoomId},
    error::{Error, SignalingErrorKind},
    media_source::{LocalMedia, MediaSource},
    media_track::RemoteStream,
    mesh::{MeshEvent, OutboundSignal, PeerMeshManager},
    negotiation::{Role, SessionEvent},
    peer_connection::{ConnectionFactory, WebRTCConnectionFactory},
    relay::{RelayConnector, RelayEvent, RelayState, RelayTransport, WebSocketConnector},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoomState {
    #[default]
    Idle,
    Connecting,
    Joined,
    Left,
}

/// What the room looks like right now, for rendering.
#[derive(Clone, Debug, Default)]
pub struct RoomSnapshot {
    pub state: RoomState,
    /// The relay is open and the room is joined.
    pub active: bool,
    pub remote_streams: HashMap<ParticipantId, Arc<RemoteStream>>,
    pub local_media: Option<Arc<LocalMedia>>,
}

#[derive(Debug)]
enum RoomCommand {
    Leave(oneshot::Sender<()>),
}

/// Control surface of a running [`RoomSession`]. Cheap to clone; the room
/// leaves on its own once every handle is dropped.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    pub local_id: ParticipantId,
    pub room_id: RoomId,
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshot: watch::Receiver<RoomSnapshot>,
    events: broadcast::Sender<MeshEvent>,
}

impl RoomHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Notified after every change of the snapshot.
    pub fn watch(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.clone()
    }

    /// Leaves the room and waits until every session is closed and local
    /// media is released. Calling it again is a no-op.
    pub async fn leave(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(RoomCommand::Leave(reply)).is_err() {
            return;
        }
        let _ = done.await;
    }
}

/// One participant's membership in one room: the relay connection, the peer
/// mesh and the state observers see.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RoomSession {
    local_id: ParticipantId,
    room_id: RoomId,
    state: RoomState,
    relay: RelayTransport,
    mesh: PeerMeshManager,
    #[derivative(Debug = "ignore")]
    snapshot: watch::Sender<RoomSnapshot>,
    #[derivative(Debug = "ignore")]
    events: broadcast::Sender<MeshEvent>,
}

impl RoomSession {
    /// Joins `room_id` through the WebSocket relay in `config`.
    pub fn start(
        local_id: ParticipantId,
        room_id: RoomId,
        config: RoomConfig,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<RoomHandle, Error> {
        let connector = Arc::new(WebSocketConnector::new(config.relay_url));
        let factory = Arc::new(WebRTCConnectionFactory::new(config.transport));
        Self::start_with(
            local_id,
            room_id,
            config.event_capacity,
            connector,
            factory,
            media_source,
        )
    }

    /// Joins `room_id` with caller supplied relay and connection backends.
    pub fn start_with(
        local_id: ParticipantId,
        room_id: RoomId,
        event_capacity: usize,
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<RoomHandle, Error> {
        if local_id.is_empty() || room_id.is_empty() {
            return Err(Error::new_signaling(
                "both a room id and a participant id are required".to_string(),
                SignalingErrorKind::InvalidIdentityError,
            ));
        }

        let (session_event_sender, session_events) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (snapshot, snapshot_receiver) = watch::channel(RoomSnapshot::default());
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let mesh = PeerMeshManager::new(
            local_id.clone(),
            factory,
            media_source,
            session_event_sender,
            events.clone(),
        );

        let channel = connector.connect();
        let mut room = RoomSession {
            local_id: local_id.clone(),
            room_id: room_id.clone(),
            state: RoomState::Idle,
            relay: RelayTransport::new(channel.frames),
            mesh,
            snapshot,
            events: events.clone(),
        };
        room.transition(RoomState::Connecting);
        // Queued until the relay opens.
        room.send(Envelope::join(room_id.clone(), local_id.clone()));
        room.publish_snapshot();

        tokio::spawn(room.room_event_loop(command_receiver, channel.events, session_events));

        Ok(RoomHandle {
            local_id,
            room_id,
            commands,
            snapshot: snapshot_receiver,
            events,
        })
    }

    async fn room_event_loop(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        tracing::info!("room {} event loop started for {}", self.room_id, self.local_id);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    self.leave().await;
                    if let Some(RoomCommand::Leave(reply)) = command {
                        let _ = reply.send(());
                    }
                    break;
                }
                Some(event) = relay_events.recv() => {
                    self.handle_relay_event(event).await;
                }
                Some(event) = session_events.recv() => {
                    if let Some(signal) = self.mesh.handle_session_event(event) {
                        self.send_signal(signal);
                    }
                }
            }
            self.publish_snapshot();
        }
        tracing::info!("room {} event loop finished", self.room_id);
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open => {
                self.relay.on_open();
                self.transition(RoomState::Joined);
                self.emit(MeshEvent::RelayOpened);
            }
            RelayEvent::Frame(frame) => {
                if let Some(envelope) = self.relay.receive(&frame) {
                    self.handle_envelope(envelope).await;
                }
            }
            RelayEvent::Closed => {
                if self.relay.state() == RelayState::Closed {
                    return;
                }
                tracing::warn!("relay for room {} is closed", self.room_id);
                self.relay.on_closed();
                self.emit(MeshEvent::RelayClosed);
            }
            RelayEvent::Error(reason) => {
                tracing::error!("relay error in room {}: {}", self.room_id, reason);
                self.relay.on_error();
                self.emit(MeshEvent::RelayError(reason));
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        if !self.accepts(&envelope) {
            return;
        }

        let action = envelope.action;
        let inbound = match envelope.into_inbound() {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!("dropping {} envelope: {}", action, err);
                return;
            }
        };

        match inbound {
            Inbound::Joined { clients } => {
                tracing::info!("joined room {} with {} members", self.room_id, clients.len());
                self.mesh.connect_members(clients).await;
            }
            Inbound::NewPeer { sender } => {
                tracing::info!("{} joined room {}", sender, self.room_id);
                if let Err(err) = self.mesh.ensure_session(sender.clone(), Role::Responder).await
                {
                    tracing::error!("failed to accept {}: {}", sender, err);
                }
            }
            other => self.mesh.dispatch(other),
        }
    }

    /// Our own messages echoed back by the relay, and messages addressed to
    /// somebody else, never reach the mesh.
    fn accepts(&self, envelope: &Envelope) -> bool {
        if envelope.sender_id.as_ref() == Some(&self.local_id) {
            tracing::trace!("ignoring our own {} envelope", envelope.action);
            return false;
        }
        if let Some(target_id) = envelope.target_id.as_ref() {
            if *target_id != self.local_id {
                tracing::trace!("ignoring {} envelope for {}", envelope.action, target_id);
                return false;
            }
        }
        true
    }

    fn send_signal(&mut self, signal: OutboundSignal) {
        let envelope = Envelope::signal(
            signal.action,
            self.room_id.clone(),
            self.local_id.clone(),
            signal.target_id,
            signal.data,
        );
        self.send(envelope);
    }

    fn send(&mut self, envelope: Envelope) {
        if let Err(err) = self.relay.send(&envelope) {
            tracing::error!("failed to send {} envelope: {}", envelope.action, err);
        }
    }

    async fn leave(&mut self) {
        if self.state == RoomState::Left {
            return;
        }
        tracing::info!("{} is leaving room {}", self.local_id, self.room_id);
        self.relay.close();
        self.mesh.close().await;
        self.transition(RoomState::Left);
        self.publish_snapshot();
    }

    fn transition(&mut self, state: RoomState) {
        if self.state == state {
            return;
        }
        tracing::debug!("room {}: {:?} -> {:?}", self.room_id, self.state, state);
        self.state = state;
    }

    fn publish_snapshot(&self) {
        let active = self.state == RoomState::Joined && self.relay.state() == RelayState::Open;
        self.snapshot.send_replace(RoomSnapshot {
            state: self.state,
            active,
            remote_streams: self.mesh.remote_streams(),
            local_media: self.mesh.local_media(),
        });
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

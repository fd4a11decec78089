use std::collections::HashMap;
use std::sync::Mutex;

use actix::{Actor, Addr, Message, StreamHandler};
use actix::{AsyncContext, Handler};
use actix_web::web::Data;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use roommesh::envelope::{Action, Envelope, ParticipantId, RoomId};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rooms = Data::new(RoomOwner::new());

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(index)
            .app_data(rooms.clone())
            .route("/socket", web::get().to(socket))
    })
    .bind("0.0.0.0:4000")?
    .run()
    .await
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

async fn socket(
    req: HttpRequest,
    rooms: Data<RoomOwner>,
    stream: web::Payload,
) -> impl Responder {
    let server = WebSocket::new(rooms);
    ws::start(server, &req, stream)
}

struct WebSocket {
    rooms: Data<RoomOwner>,
    member: Option<(RoomId, ParticipantId)>,
}

impl WebSocket {
    pub fn new(rooms: Data<RoomOwner>) -> Self {
        Self {
            rooms,
            member: None,
        }
    }

    fn join(&mut self, envelope: Envelope, address: Addr<WebSocket>) {
        let (Some(room_id), Some(sender_id)) = (envelope.room_id, envelope.sender_id) else {
            tracing::warn!("join without roomId or senderId");
            return;
        };

        let peers = self
            .rooms
            .add_member(&room_id, sender_id.clone(), address.clone());
        tracing::info!("{} joined {}, {} already there", sender_id, room_id, peers.len());

        let mut clients: Vec<ParticipantId> = peers.iter().map(|(id, _)| id.clone()).collect();
        clients.push(sender_id.clone());
        send_envelope(&address, &Envelope::joined(room_id.clone(), clients));

        let new_peer = Envelope::new_peer(room_id.clone(), sender_id.clone());
        for (_, peer) in peers.iter() {
            send_envelope(peer, &new_peer);
        }

        self.member = Some((room_id, sender_id));
    }

    fn forward(&self, envelope: &Envelope, text: &str) {
        let Some((room_id, _)) = self.member.as_ref() else {
            tracing::warn!("{} before join", envelope.action);
            return;
        };
        let Some(target_id) = envelope.target_id.as_ref() else {
            tracing::warn!("{} without targetId", envelope.action);
            return;
        };
        match self.rooms.find_member(room_id, target_id) {
            Some(target) => target.do_send(Forward(text.to_owned())),
            None => tracing::warn!("{} is not in {}", target_id, room_id),
        }
    }
}

fn send_envelope(address: &Addr<WebSocket>, envelope: &Envelope) {
    match envelope.to_frame() {
        Ok(frame) => address.do_send(Forward(frame)),
        Err(err) => tracing::error!("failed to serialize {} envelope: {}", envelope.action, err),
    }
}

impl Actor for WebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("New WebSocket connection is started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("The WebSocket connection is stopped");
        if let Some((room_id, participant_id)) = self.member.take() {
            self.rooms.remove_member(&room_id, &participant_id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::info!("pong received"),
            Ok(ws::Message::Text(text)) => match Envelope::parse(&text) {
                Ok(envelope) => match envelope.action {
                    Action::Join => self.join(envelope, ctx.address()),
                    Action::Offer | Action::Answer | Action::Candidate => {
                        self.forward(&envelope, &text)
                    }
                    other => tracing::warn!("ignoring {} from client", other),
                },
                Err(error) => {
                    tracing::error!("failed to parse client message: {}\n{}", error, text);
                }
            },
            Ok(ws::Message::Close(reason)) => ctx.close(reason),
            _ => (),
        }
    }
}

impl Handler<Forward> for WebSocket {
    type Result = ();

    fn handle(&mut self, msg: Forward, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("sending message: {}", msg.0);
        ctx.text(msg.0);
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct Forward(String);

struct RoomOwner {
    rooms: Mutex<HashMap<RoomId, HashMap<ParticipantId, Addr<WebSocket>>>>,
}

impl RoomOwner {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the members that were already in the room.
    fn add_member(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        address: Addr<WebSocket>,
    ) -> Vec<(ParticipantId, Addr<WebSocket>)> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.entry(room_id.clone()).or_default();
        let peers = room
            .iter()
            .filter(|(id, _)| **id != participant_id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect();
        room.insert(participant_id, address);
        peers
    }

    fn find_member(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Option<Addr<WebSocket>> {
        let rooms = self.rooms.lock().unwrap();
        rooms.get(room_id)?.get(participant_id).cloned()
    }

    fn remove_member(&self, room_id: &RoomId, participant_id: &ParticipantId) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(room_id) {
            room.remove(participant_id);
            if room.is_empty() {
                tracing::info!("room {} is empty, removing it", room_id);
                rooms.remove(room_id);
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use roommesh::config::RoomConfig;
use roommesh::envelope::{ParticipantId, RoomId};
use roommesh::media_source::SampleMediaSource;
use roommesh::mesh::MeshEvent;
use roommesh::room::RoomSession;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

// Usage: mesh_client [room id] [participant id]
// Start relay_server first, or point RELAY_URL at your own relay.
#[tokio::main]
async fn main() -> Result<(), roommesh::error::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let room_id = args.next().map(RoomId::new).unwrap_or_else(RoomId::generate);
    let participant_id = args
        .next()
        .map(ParticipantId::new)
        .unwrap_or_else(ParticipantId::generate);

    let mut config = RoomConfig::default();
    if let Ok(url) = std::env::var("RELAY_URL") {
        config.relay_url = url;
    }

    tracing::info!("joining room {} as {}", room_id, participant_id);
    let media_source = Arc::new(SampleMediaSource::new(participant_id.to_string()));
    let room = RoomSession::start(participant_id, room_id, config, media_source.clone())?;

    tokio::spawn(write_blank_video(media_source));

    let mut events = room.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(MeshEvent::StreamUpdated { participant_id, stream }) => {
                    tracing::info!(
                        "stream {} from {} with {} tracks",
                        stream.id,
                        participant_id,
                        stream.tracks().len()
                    );
                }
                Ok(MeshEvent::RelayClosed) => {
                    tracing::warn!("relay is gone");
                    break;
                }
                Ok(event) => tracing::info!("{:?}", event),
                Err(RecvError::Lagged(n)) => tracing::warn!("missed {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    room.leave().await;
    tracing::info!("left the room");
    Ok(())
}

// Local video is a black frame at ~30fps until the room is left.
async fn write_blank_video(source: Arc<SampleMediaSource>) {
    let black_frame = bytes::Bytes::from(vec![0u8; 640 * 480 * 3 / 2]);
    let duration = Duration::from_millis(33);
    loop {
        let sample = Sample {
            data: black_frame.clone(),
            duration,
            ..Default::default()
        };
        // Nothing is acquired until the first peer shows up.
        if let Err(err) = source.write_sample(RTPCodecType::Video, &sample).await {
            tracing::trace!("blank frame not written: {}", err);
        }
        sleep(duration).await;
    }
}

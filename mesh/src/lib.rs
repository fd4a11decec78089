#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Roommesh
//! Roommesh joins a room on a WebSocket signaling relay and keeps one WebRTC peer connection open to every other participant in that room. There is no media server: every participant sends its camera and microphone to everybody else directly.
//! `examples/mesh_client.rs` is an example participant, and `examples/relay_server.rs` is a minimal relay to run it against.
//!
//! ## Usage
//! Start a [`room::RoomSession`] with your participant id and room id, then watch the [`room::RoomHandle`] for remote streams. Call [`room::RoomHandle::leave`] when done.

/// Configuration for [`room::RoomSession`] and [`peer_connection::WebRTCConnectionFactory`].
pub mod config;
/// Wire format of signaling messages.
pub mod envelope;
pub mod error;
/// Local capture.
pub mod media_source;
pub mod media_track;
/// One negotiation session per remote participant.
pub mod mesh;
/// Offer/answer and trickle ICE with one remote participant.
pub mod negotiation;
pub mod outbound_queue;
/// [`webrtc::peer_connection::RTCPeerConnection`] behind a trait.
pub mod peer_connection;
/// Connection to the signaling relay.
pub mod relay;
/// Room membership lifecycle.
pub mod room;

#[cfg(test)]
pub(crate) mod testing;

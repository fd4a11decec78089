use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::error::{Error, SignalingErrorKind};

/// Opaque identifier of a room participant.
///
/// The relay may deliver it either as a string or as a numeric account id; both
/// are normalized to their string form so one participant always compares equal
/// to itself regardless of how the relay spelled it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(id) => Self(id),
            Raw::Number(id) => Self(id.to_string()),
        })
    }
}

/// Opaque identifier scoping a set of participants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh room id for hosting a new meeting.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Join,
    Joined,
    NewPeer,
    Offer,
    Answer,
    Candidate,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Join => "join",
            Action::Joined => "joined",
            Action::NewPeer => "new-peer",
            Action::Offer => "offer",
            Action::Answer => "answer",
            Action::Candidate => "candidate",
            Action::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The only unit exchanged with the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "senderClientId",
        alias = "senderUserID"
    )]
    pub sender_id: Option<ParticipantId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "targetClientId",
        alias = "targetUserID"
    )]
    pub target_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ParticipantId>>,
}

impl Envelope {
    fn new(action: Action) -> Self {
        Self {
            action,
            data: None,
            room_id: None,
            sender_id: None,
            target_id: None,
            clients: None,
        }
    }

    pub fn join(room_id: RoomId, sender_id: ParticipantId) -> Self {
        Self {
            room_id: Some(room_id),
            sender_id: Some(sender_id),
            ..Self::new(Action::Join)
        }
    }

    /// Relay reply to `join`, listing current membership including the joiner.
    pub fn joined(room_id: RoomId, clients: Vec<ParticipantId>) -> Self {
        Self {
            room_id: Some(room_id),
            clients: Some(clients),
            ..Self::new(Action::Joined)
        }
    }

    /// Relay notification that `sender_id` entered the room.
    pub fn new_peer(room_id: RoomId, sender_id: ParticipantId) -> Self {
        Self {
            room_id: Some(room_id),
            sender_id: Some(sender_id),
            ..Self::new(Action::NewPeer)
        }
    }

    /// `offer`, `answer` or `candidate` addressed to one participant.
    pub fn signal(
        action: Action,
        room_id: RoomId,
        sender_id: ParticipantId,
        target_id: ParticipantId,
        data: serde_json::Value,
    ) -> Self {
        Self {
            data: Some(data),
            room_id: Some(room_id),
            sender_id: Some(sender_id),
            target_id: Some(target_id),
            ..Self::new(action)
        }
    }

    pub fn parse(frame: &str) -> Result<Self, Error> {
        serde_json::from_str(frame).map_err(|err| {
            Error::new_signaling(
                format!("failed to parse envelope: {}", err),
                SignalingErrorKind::MalformedEnvelopeError,
            )
        })
    }

    pub fn to_frame(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validates the fields required by the action and decodes the payload.
    pub fn into_inbound(self) -> Result<Inbound, Error> {
        match self.action {
            Action::Joined => {
                let clients = self
                    .clients
                    .ok_or_else(|| missing_field(Action::Joined, "clients"))?;
                Ok(Inbound::Joined { clients })
            }
            Action::NewPeer => {
                let sender = self
                    .sender_id
                    .ok_or_else(|| missing_field(Action::NewPeer, "senderId"))?;
                Ok(Inbound::NewPeer { sender })
            }
            Action::Offer => {
                let (sender, data) = sender_and_data(Action::Offer, self.sender_id, self.data)?;
                let description = decode::<RTCSessionDescription>(Action::Offer, data)?;
                Ok(Inbound::Offer {
                    sender,
                    description,
                })
            }
            Action::Answer => {
                let (sender, data) = sender_and_data(Action::Answer, self.sender_id, self.data)?;
                let description = decode::<RTCSessionDescription>(Action::Answer, data)?;
                Ok(Inbound::Answer {
                    sender,
                    description,
                })
            }
            Action::Candidate => {
                let (sender, data) =
                    sender_and_data(Action::Candidate, self.sender_id, self.data)?;
                let candidate = decode::<RTCIceCandidateInit>(Action::Candidate, data)?;
                Ok(Inbound::Candidate { sender, candidate })
            }
            Action::Join | Action::Unknown => Err(Error::new_signaling(
                format!("action {} is not accepted from the relay", self.action),
                SignalingErrorKind::UnexpectedActionError,
            )),
        }
    }
}

/// A validated inbound signaling message.
#[derive(Clone, Debug)]
pub enum Inbound {
    Joined {
        clients: Vec<ParticipantId>,
    },
    NewPeer {
        sender: ParticipantId,
    },
    Offer {
        sender: ParticipantId,
        description: RTCSessionDescription,
    },
    Answer {
        sender: ParticipantId,
        description: RTCSessionDescription,
    },
    Candidate {
        sender: ParticipantId,
        candidate: RTCIceCandidateInit,
    },
}

fn missing_field(action: Action, field: &str) -> Error {
    Error::new_signaling(
        format!("{} envelope without {}", action, field),
        SignalingErrorKind::MissingFieldError,
    )
}

fn sender_and_data(
    action: Action,
    sender_id: Option<ParticipantId>,
    data: Option<serde_json::Value>,
) -> Result<(ParticipantId, serde_json::Value), Error> {
    let sender = sender_id.ok_or_else(|| missing_field(action, "senderId"))?;
    let data = data.ok_or_else(|| missing_field(action, "data"))?;
    Ok((sender, data))
}

fn decode<T: serde::de::DeserializeOwned>(
    action: Action,
    data: serde_json::Value,
) -> Result<T, Error> {
    serde_json::from_value(data).map_err(|err| {
        Error::new_signaling(
            format!("invalid {} payload: {}", action, err),
            SignalingErrorKind::MalformedEnvelopeError,
        )
    })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_join_serializes_camel_case() {
        let envelope = Envelope::join(RoomId::from("5"), ParticipantId::from("alice"));
        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"action": "join", "roomId": "5", "senderId": "alice"})
        );
    }

    #[test]
    fn test_new_peer_action_is_kebab_case() {
        let envelope = Envelope::parse(r#"{"action":"new-peer","senderId":"bob"}"#).unwrap();
        assert_eq!(envelope.action, Action::NewPeer);
        assert_eq!(envelope.sender_id, Some(ParticipantId::from("bob")));
    }

    #[test]
    fn test_numeric_participant_ids_are_normalized() {
        let envelope =
            Envelope::parse(r#"{"action":"joined","roomId":"r","clients":[7,"8",9]}"#).unwrap();
        assert_eq!(
            envelope.clients,
            Some(vec![
                ParticipantId::from(7),
                ParticipantId::from("8"),
                ParticipantId::from(9)
            ])
        );
    }

    #[test]
    fn test_legacy_sender_aliases() {
        let envelope =
            Envelope::parse(r#"{"action":"new-peer","senderUserID":42,"targetClientId":"x"}"#)
                .unwrap();
        assert_eq!(envelope.sender_id, Some(ParticipantId::from(42)));
        assert_eq!(envelope.target_id, Some(ParticipantId::from("x")));
    }

    #[test]
    fn test_unknown_action_is_rejected_on_validation() {
        let envelope = Envelope::parse(r#"{"action":"wave","senderId":"bob"}"#).unwrap();
        assert_eq!(envelope.action, Action::Unknown);
        let err = envelope.into_inbound().unwrap_err();
        assert_eq!(
            err.signaling_kind(),
            Some(&SignalingErrorKind::UnexpectedActionError)
        );
    }

    #[test]
    fn test_non_json_is_malformed() {
        let err = Envelope::parse("not json at all").unwrap_err();
        assert_eq!(
            err.signaling_kind(),
            Some(&SignalingErrorKind::MalformedEnvelopeError)
        );
    }

    #[test]
    fn test_offer_without_data_is_missing_field() {
        let envelope = Envelope::parse(r#"{"action":"offer","senderId":"bob"}"#).unwrap();
        let err = envelope.into_inbound().unwrap_err();
        assert_eq!(
            err.signaling_kind(),
            Some(&SignalingErrorKind::MissingFieldError)
        );
    }

    #[test]
    fn test_joined_without_clients_is_missing_field() {
        let envelope = Envelope::parse(r#"{"action":"joined","roomId":"r"}"#).unwrap();
        assert!(envelope.into_inbound().is_err());
    }

    #[test]
    fn test_candidate_decodes_browser_json() {
        let frame = json!({
            "action": "candidate",
            "senderId": "bob",
            "targetId": "alice",
            "data": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": null
            }
        })
        .to_string();
        match Envelope::parse(&frame).unwrap().into_inbound().unwrap() {
            Inbound::Candidate { sender, candidate } => {
                assert_eq!(sender, ParticipantId::from("bob"));
                assert_eq!(candidate.sdp_mid, Some("0".to_owned()));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected inbound {:?}", other),
        }
    }

    #[test]
    fn test_offer_decodes_session_description() {
        let frame = json!({
            "action": "offer",
            "senderId": "bob",
            "data": {"type": "offer", "sdp": "v=0\r\n"}
        })
        .to_string();
        match Envelope::parse(&frame).unwrap().into_inbound().unwrap() {
            Inbound::Offer {
                sender,
                description,
            } => {
                assert_eq!(sender, ParticipantId::from("bob"));
                assert_eq!(description.sdp, "v=0\r\n");
            }
            other => panic!("unexpected inbound {:?}", other),
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ParticipantId::generate(), ParticipantId::generate());
        assert_ne!(RoomId::generate(), RoomId::generate());
    }
}

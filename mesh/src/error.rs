use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    RelayError(#[from] RelayError),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
    #[error(transparent)]
    MediaError(#[from] MediaError),
}

/// Failure of one peer connection. Never affects other participants.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
}

/// An envelope that could not be turned into a usable signaling message.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
    #[error("ice candidate error")]
    ICECandidateError,
    #[error("session closed error")]
    SessionClosedError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayErrorKind {
    #[error("relay connection error")]
    ConnectionError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignalingErrorKind {
    #[error("malformed envelope error")]
    MalformedEnvelopeError,
    #[error("missing field error")]
    MissingFieldError,
    #[error("unexpected action error")]
    UnexpectedActionError,
    #[error("invalid identity error")]
    InvalidIdentityError,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MediaErrorKind {
    #[error("device unavailable error")]
    DeviceUnavailableError,
    #[error("permission denied error")]
    PermissionDeniedError,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_relay(message: String, kind: RelayErrorKind) -> Error {
        Error::RelayError(RelayError { kind, message })
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }

    pub fn new_media(message: String, kind: MediaErrorKind) -> Error {
        Error::MediaError(MediaError { kind, message })
    }

    /// Returns the signaling error kind when this is a malformed-message error.
    pub fn signaling_kind(&self) -> Option<&SignalingErrorKind> {
        match self {
            Error::SignalingError(err) => Some(&err.kind),
            _ => None,
        }
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roommesh::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roommesh::RelayError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roommesh::SignalingError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roommesh::MediaError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

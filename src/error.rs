use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Websocket error: {0}")]
    WsError(#[from] tungstenite::error::Error),
    #[error("Std IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Handshake failures, tagged with the stage that failed.
    #[error("Cannot create connection on channel {channel}: {source}")]
    ConnectionCreationFailed {
        channel: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Connection initializer failed for session {id}: {source}")]
    InitializerFailed {
        id: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Cannot generate offer for session {id}: {source}")]
    OfferGenerationFailed {
        id: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Cannot generate answer for session {id}: {source}")]
    AnswerGenerationFailed {
        id: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Remote description rejected by session {id}: {source}")]
    RemoteDescriptionRejected {
        id: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Closing session {id} failed: {source}")]
    CloseFailed {
        id: String,
        #[source]
        source: Box<SignalError>,
    },
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Driver
    #[error("No route to peer: {0}")]
    PeerUnreachable(String),
    #[error("Unsupported sdp type: {0}")]
    UnsupportedSdpType(String),

    /// WebRTC error
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
}

impl SignalError {
    pub(crate) fn creation(channel: &str, err: SignalError) -> Self {
        SignalError::ConnectionCreationFailed {
            channel: channel.to_string(),
            source: Box::new(err),
        }
    }
}

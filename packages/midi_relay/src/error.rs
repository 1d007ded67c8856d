//! Error types and stable error codes.
//!
//! None of these ever reach the presentation layer as a fault. The session
//! recovers locally and reports through the activity log and connection state.

/// Failure to turn a transport payload back into a [`crate::MidiEventEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl DecodeError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
        }
    }
}

/// Failures reported by a [`crate::transport::Transport`] or its channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The channel cannot be opened at all. Not transient, never retried.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel is not joined")]
    NotJoined,
}

impl TransportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable(_) => "transport_unavailable",
            Self::Channel(_) => "channel_error",
            Self::NotJoined => "not_joined",
        }
    }
}

/// Failures from the local MIDI capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// MIDI support is missing or access was denied.
    #[error("MIDI unavailable: {0}")]
    Unavailable(String),

    #[error("MIDI device not found: {0}")]
    NotFound(String),

    #[error("MIDI send failed: {0}")]
    SendFailed(String),
}

impl DeviceError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable(_) => "device_unavailable",
            Self::NotFound(_) => "device_not_found",
            Self::SendFailed(_) => "device_send_failed",
        }
    }
}

/// Every failure class the session layer distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    TransportUnavailable(TransportError),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("subscription timed out")]
    TimedOut,

    #[error("heartbeat found the channel no longer joined")]
    HeartbeatLivenessFailure,

    #[error(transparent)]
    MalformedEnvelope(#[from] DecodeError),

    #[error(transparent)]
    DeviceUnavailable(#[from] DeviceError),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::TransportUnavailable(_) => "transport_unavailable",
            Self::ChannelError(_) => "channel_error",
            Self::TimedOut => "timed_out",
            Self::HeartbeatLivenessFailure => "heartbeat_liveness_failure",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::DeviceUnavailable(_) => "device_unavailable",
        }
    }

    /// Whether the connection manager answers this failure with a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChannelError(_) | Self::TimedOut | Self::HeartbeatLivenessFailure
        )
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(_) => Self::TransportUnavailable(err),
            TransportError::Channel(reason) => Self::ChannelError(reason),
            TransportError::NotJoined => Self::HeartbeatLivenessFailure,
        }
    }
}

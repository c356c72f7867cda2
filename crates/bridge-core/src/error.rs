use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    event::ErrorSeverity,
    types::{ChannelKind, ChannelState},
};

/// Engine error code documented as "session permanently invalid".
pub const PERMANENT_ENGINE_CODE: i64 = 1;

/// Broad error kind used by callers to decide how to react.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// Required credential fields are missing or blank.
    InvalidCredentials,
    /// The handle was never issued or has been destroyed.
    UnknownHandle,
    /// The target channel is not connected and not reconnecting.
    ChannelNotConnected,
    /// The E2EE channel is disabled for this session.
    ChannelDisabled,
    /// The requested lifecycle transition is not allowed right now.
    InvalidState,
    /// The channel went away while the command was queued or in flight.
    ConnectionLost,
    /// The engine reported a failure for this operation.
    Engine,
    /// The engine reported the session as irrecoverably invalid.
    PermanentSession,
    /// The engine returned a payload the bridge could not interpret.
    Protocol,
    /// Device identity persistence failed.
    Storage,
    /// Internal bridge bug or broken invariant.
    Internal,
}

/// Stable error payload returned by every bridge operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
    /// Numeric code reported by the engine, if any.
    pub engine_code: Option<i64>,
}

impl BridgeError {
    pub fn new(kind: BridgeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            engine_code: None,
        }
    }

    pub fn with_engine_code(mut self, code: Option<i64>) -> Self {
        self.engine_code = code;
        self
    }

    pub fn invalid_credentials(missing: &[&str]) -> Self {
        Self::new(
            BridgeErrorKind::InvalidCredentials,
            format!("missing required credentials: {}", missing.join(", ")),
        )
    }

    pub fn unknown_handle(handle: impl std::fmt::Display) -> Self {
        Self::new(
            BridgeErrorKind::UnknownHandle,
            format!("session handle {handle} is not live"),
        )
    }

    pub fn channel_not_connected(channel: ChannelKind, state: ChannelState) -> Self {
        Self::new(
            BridgeErrorKind::ChannelNotConnected,
            format!("{channel} channel is {state:?}"),
        )
    }

    pub fn channel_disabled(channel: ChannelKind) -> Self {
        Self::new(
            BridgeErrorKind::ChannelDisabled,
            format!("{channel} channel is disabled for this session"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(
        channel: ChannelKind,
        current: ChannelState,
        action: impl Into<String>,
    ) -> Self {
        let action = action.into();
        Self::new(
            BridgeErrorKind::InvalidState,
            format!("cannot run '{action}' while {channel} channel is in state {current:?}"),
        )
    }

    pub fn connection_lost(channel: ChannelKind) -> Self {
        Self::new(
            BridgeErrorKind::ConnectionLost,
            format!("{channel} channel connection lost"),
        )
    }

    /// Engine failure, classified by the engine's own severity signal.
    pub fn from_engine(message: impl Into<String>, code: Option<i64>, permanent: Option<bool>) -> Self {
        let kind = match severity_for(code, permanent) {
            ErrorSeverity::Permanent => BridgeErrorKind::PermanentSession,
            ErrorSeverity::Transient => BridgeErrorKind::Engine,
        };
        Self::new(kind, message).with_engine_code(code)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::Protocol, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::Storage, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BridgeErrorKind::Internal, message)
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == BridgeErrorKind::PermanentSession
    }

    /// Severity this error carries when surfaced as an `error` event.
    pub fn severity(&self) -> ErrorSeverity {
        if self.is_permanent() {
            ErrorSeverity::Permanent
        } else {
            ErrorSeverity::Transient
        }
    }
}

/// Classify an engine failure.
///
/// An explicit `permanent` flag wins; otherwise only the documented permanent
/// code is treated as fatal. No other codes are interpreted.
pub fn severity_for(code: Option<i64>, permanent: Option<bool>) -> ErrorSeverity {
    match (permanent, code) {
        (Some(true), _) => ErrorSeverity::Permanent,
        (Some(false), _) => ErrorSeverity::Transient,
        (None, Some(PERMANENT_ENGINE_CODE)) => ErrorSeverity::Permanent,
        (None, _) => ErrorSeverity::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_severity() {
        assert_eq!(severity_for(None, None), ErrorSeverity::Transient);
        assert_eq!(severity_for(Some(1), None), ErrorSeverity::Permanent);
        assert_eq!(severity_for(Some(401), None), ErrorSeverity::Transient);
        assert_eq!(severity_for(Some(1), Some(false)), ErrorSeverity::Transient);
        assert_eq!(severity_for(Some(7), Some(true)), ErrorSeverity::Permanent);
    }

    #[test]
    fn engine_errors_keep_code_and_kind() {
        let err = BridgeError::from_engine("session expired", Some(1), None);
        assert_eq!(err.kind, BridgeErrorKind::PermanentSession);
        assert_eq!(err.engine_code, Some(1));
        assert!(err.is_permanent());

        let err = BridgeError::from_engine("timeout", Some(504), None);
        assert_eq!(err.kind, BridgeErrorKind::Engine);
        assert_eq!(err.severity(), ErrorSeverity::Transient);
    }

    #[test]
    fn keeps_invalid_state_message_stable() {
        let err = BridgeError::invalid_state(ChannelKind::E2ee, ChannelState::Connected, "connect");
        assert_eq!(err.kind, BridgeErrorKind::InvalidState);
        assert_eq!(
            err.message,
            "cannot run 'connect' while e2ee channel is in state Connected"
        );
    }

    #[test]
    fn lists_missing_credentials() {
        let err = BridgeError::invalid_credentials(&["c_user", "xs"]);
        assert_eq!(err.to_string(), "InvalidCredentials: missing required credentials: c_user, xs");
    }
}

//! Observable per-account state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::mailbox::SecurityCodeMailbox;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StreamState {
    Ready = 0,
    LoggingIn = 1,
    LoginError = 2,
    ChallengeRequired = 3,
    ChallengeError = 4,
    CreatingBroadcast = 5,
    CreateBroadcastError = 6,
    Streaming = 7,
    EncoderRestart = 8,
    Posting = 9,
}

impl StreamState {
    const ALL: [StreamState; 10] = [
        Self::Ready,
        Self::LoggingIn,
        Self::LoginError,
        Self::ChallengeRequired,
        Self::ChallengeError,
        Self::CreatingBroadcast,
        Self::CreateBroadcastError,
        Self::Streaming,
        Self::EncoderRestart,
        Self::Posting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::LoggingIn => "logging_in",
            Self::LoginError => "login_error",
            Self::ChallengeRequired => "challenge_required",
            Self::ChallengeError => "challenge_error",
            Self::CreatingBroadcast => "creating_broadcast",
            Self::CreateBroadcastError => "create_broadcast_error",
            Self::Streaming => "streaming",
            Self::EncoderRestart => "encoder_restart",
            Self::Posting => "posting",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::LoginError | Self::ChallengeError | Self::CreateBroadcastError
        )
    }

    /// Whether a broadcast is currently open on the remote side.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Streaming | Self::EncoderRestart)
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(Self::Ready)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-writer state field, readable from anywhere.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// How a failure affects the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The session is gone; log in again without cooling down.
    Reauthenticate,
    /// Cool down, then retry the same or the previous state.
    Backoff,
    /// The broadcast ended remotely.
    EndOfCycle,
    /// Logged only.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a stream for the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub name: String,
    pub state: StreamState,
    pub running: bool,
    pub challenge_required: bool,
    /// A security code submitted now would be delivered.
    pub awaiting_code: bool,
    pub last_error: Option<LastError>,
}

/// State shared between a stream handle, its loop and the loop's sub-tasks.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) name: String,
    pub(crate) state: StateCell,
    pub(crate) running: AtomicBool,
    pub(crate) mailbox: SecurityCodeMailbox,
    last_error: RwLock<Option<LastError>>,
}

impl StreamShared {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StateCell::new(StreamState::Ready),
            running: AtomicBool::new(false),
            mailbox: SecurityCodeMailbox::new(),
            last_error: RwLock::new(None),
        }
    }

    pub(crate) fn record_error(&self, class: FailureClass, message: impl Into<String>) {
        *self.last_error.write() = Some(LastError {
            class,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    pub(crate) fn status(&self) -> StreamStatus {
        let state = self.state.get();
        StreamStatus {
            name: self.name.clone(),
            state,
            running: self.running.load(Ordering::Acquire),
            challenge_required: state == StreamState::ChallengeRequired,
            awaiting_code: self.mailbox.is_waiting(),
            last_error: self.last_error.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_roundtrip() {
        let cell = StateCell::new(StreamState::Ready);
        for state in StreamState::ALL {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&StreamState::CreateBroadcastError).unwrap();
        assert_eq!(json, "\"create_broadcast_error\"");
        assert_eq!(StreamState::EncoderRestart.to_string(), "encoder_restart");
    }

    #[test]
    fn test_status_snapshot() {
        let shared = StreamShared::new("alice");
        shared.state.set(StreamState::ChallengeRequired);
        shared.record_error(FailureClass::Backoff, "login failed");

        let status = shared.status();
        assert!(status.challenge_required);
        assert!(!status.running);
        assert_eq!(status.last_error.unwrap().class, FailureClass::Backoff);

        shared.clear_error();
        assert!(shared.status().last_error.is_none());
    }

    #[test]
    fn test_error_states() {
        assert!(StreamState::LoginError.is_error());
        assert!(!StreamState::Posting.is_error());
        assert!(StreamState::EncoderRestart.is_live());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MIME type used for webcam stills unless the source says otherwise.
pub const DEFAULT_FRAME_MIME: &str = "image/jpeg";

/// A recognized individual as reported by the verification service.
///
/// The identifier is opaque: the scan loop only ever compares it for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// First whitespace-separated token of the display name, used in greetings.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// An encoded still image handed from a frame source to the verifier.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl StillFrame {
    /// Wrap an already-encoded JPEG payload.
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: DEFAULT_FRAME_MIME.to_string(),
        }
    }
}

/// A frame source could not produce a still for this tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("frame unavailable: {0}")]
pub struct FrameUnavailable(pub String);

/// One tick's capture: the frame plus the epoch-ms time capture began.
#[derive(Debug, Clone)]
pub struct ScanAttempt {
    pub frame: StillFrame,
    pub started_at_ms: i64,
}

/// Transport-level verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no credential available")]
    Unauthenticated,
    #[error("request could not be built: {0}")]
    Request(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Result of one verification call.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Matched {
        identity: Identity,
        /// Match confidence, when the service reports one.
        confidence: Option<f32>,
        server_timestamp: Option<DateTime<Utc>>,
        /// Attendance record id assigned by the service.
        attendance_id: Option<String>,
    },
    Unmatched,
    TransportError(TransportError),
}

impl VerificationOutcome {
    /// Shorthand for a match with no optional metadata.
    pub fn matched(identity: Identity) -> Self {
        Self::Matched {
            identity,
            confidence: None,
            server_timestamp: None,
            attendance_id: None,
        }
    }
}

/// Why an attempt ended in [`ScanState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    NoFrame,
    Unauthenticated,
    NotRecognized,
    Transport(String),
}

impl From<TransportError> for FailureReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthenticated => Self::Unauthenticated,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// What the UI should currently show. Exactly one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ScanState {
    Scanning,
    Confirmed(Identity),
    Duplicate(Identity),
    Failed(FailureReason),
}

impl ScanState {
    /// Human-readable status line for display.
    pub fn message(&self) -> String {
        match self {
            Self::Scanning => "Scanning...".to_string(),
            Self::Confirmed(identity) => format!("Welcome, {}!", identity.first_name()),
            Self::Duplicate(identity) => format!("Already Verified: {}", identity.first_name()),
            Self::Failed(FailureReason::NoFrame) => "No camera frame".to_string(),
            Self::Failed(FailureReason::Unauthenticated) => "Not logged in".to_string(),
            Self::Failed(FailureReason::NotRecognized) => "Face not recognized".to_string(),
            Self::Failed(FailureReason::Transport(reason)) => format!("Connection problem: {reason}"),
        }
    }

    /// Confirmed and duplicate states hold the loop for the settle delay.
    pub fn pauses_scanning(&self) -> bool {
        matches!(self, Self::Confirmed(_) | Self::Duplicate(_))
    }
}

/// A fresh (non-duplicate) confirmation shown in the recent-activity list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub identity: Identity,
    pub confirmed_at_ms: i64,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub attendance_id: Option<String>,
}

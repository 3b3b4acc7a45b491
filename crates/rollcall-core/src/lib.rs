//! rollcall-core: continuous scan-verify loop for webcam attendance check-ins.
//!
//! Captures stills on a fixed cadence, sends them to a remote face
//! verification service, suppresses repeat confirmations inside a cooldown
//! window and publishes a single [`ScanState`] for a UI to render.

pub mod activity;
pub mod client;
pub mod cooldown;
pub mod scan_loop;
pub mod types;

pub use activity::ActivityLog;
pub use client::{
    CredentialProvider, HttpVerificationClient, StaticCredential, TokenFile, VerificationClient,
};
pub use cooldown::CooldownTracker;
pub use scan_loop::{
    ChannelObserver, FrameSource, ScanError, ScanEvent, ScanLoop, ScanObserver, ScanTiming,
};
pub use types::{
    ActivityLogEntry, FailureReason, FrameUnavailable, Identity, ScanState, StillFrame,
    TransportError, VerificationOutcome,
};

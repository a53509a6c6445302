//! Event stream emitted by the engine.
//!
//! Events cross the worker/caller thread boundary over an unbounded
//! crossbeam channel, so emission never blocks the worker. The caller
//! consumes them from the `Receiver` handed out by the facade.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::model::RequestId;

/// Engine scheduling state, reported via [`Event::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Queue empty, worker parked
    Idle,
    /// Worker resolving a request
    Busy,
    /// Worker suspended awaiting skip / retry / overwrite from the caller
    WaitingForInteraction,
}

/// Asynchronous notification about one request or about the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Event {
    /// Resolution of the request began
    Started { id: RequestId },

    /// Bytes completed so far for the request (files only; emitted on pull,
    /// plus always once with the final count)
    Progress { id: RequestId, bytes: u64 },

    /// The request reached a terminal outcome and left the queue
    Finished { id: RequestId, failed: bool },

    /// An attempt failed; when `needs_interaction` the worker is suspended
    /// until one of skip / skip_all / retry / overwrite / overwrite_all
    Error {
        id: RequestId,
        kind: ErrorKind,
        needs_interaction: bool,
    },

    /// A cancel-all dropped the whole queue; replaces per-request errors
    CancelledBatch,

    /// The engine moved between Idle / Busy / WaitingForInteraction
    StateChanged { state: State },
}

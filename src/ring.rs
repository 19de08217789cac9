//! Shared ring lifecycle pieces used by both the RX and TX rings.

use thiserror::Error;

/// Both rings walk `Created → Running → Stopping → Stopped`; `start`
/// requires `Created` and `stop` requires `Running`, so repeated calls are
/// rejected instead of silently tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring already started")]
    AlreadyStarted,
    #[error("ring is not running")]
    NotRunning,
    #[error("ring full")]
    Full,
}

/// Bound on every blocking wait in the stack, so cooperative shutdown
/// completes within roughly one tick.
pub const RING_WAIT_MS: u64 = 100;

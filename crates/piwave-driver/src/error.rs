//! Error types for driver operations.

use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, PiwaveError>;

/// Clock-sequencer failures. Fatal to peripheral bring-up: the clock is
/// left disabled and the instance must not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClockError {
    /// The busy bit never cleared within the bounded poll.
    #[error("clock-manager busy bit never cleared ({polls} polls)")]
    Timeout {
        /// Number of polls performed before giving up.
        polls: u32,
    },
}

/// Per-request DMA failures. Recoverable: the peripheral keeps its
/// last-good state and the caller may retry with a fresh request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// The channel could not build a slave descriptor.
    #[error("DMA descriptor preparation failed: {reason}")]
    PrepareFailed {
        /// Reason for failure.
        reason: String,
    },

    /// The channel rejected the prepared descriptor.
    #[error("DMA submission failed: {reason}")]
    SubmitFailed {
        /// Reason for failure.
        reason: String,
    },
}

impl DmaError {
    /// Create a preparation failure.
    pub fn prepare_failed(reason: impl Into<String>) -> Self {
        Self::PrepareFailed {
            reason: reason.into(),
        }
    }

    /// Create a submission failure.
    pub fn submit_failed(reason: impl Into<String>) -> Self {
        Self::SubmitFailed {
            reason: reason.into(),
        }
    }
}

/// No DMA-capable memory was available for a transfer buffer.
/// Recoverable: the request fails and the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no DMA-capable memory for a {len} byte transfer buffer")]
pub struct AllocationError {
    /// Requested buffer length in bytes.
    pub len: usize,
}

/// Errors surfaced by driver operations.
#[derive(Debug, Error)]
pub enum PiwaveError {
    /// Clock bring-up failed.
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// A DMA request failed.
    #[error(transparent)]
    Dma(#[from] DmaError),

    /// A transfer buffer could not be allocated.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// A clock divisor field was outside its 12-bit range.
    #[error("invalid clock {field}: {value}")]
    InvalidDivisor {
        /// Which divisor field was rejected.
        field: &'static str,
        /// The rejected value.
        value: u32,
    },

    /// A tone was requested with a zero frequency.
    #[error("tone frequency must be greater than zero")]
    InvalidFrequency,

    /// The device-visible buffer is still owned by the DMA engine.
    #[error("device-visible buffer is still owned by the DMA engine")]
    BufferBusy,

    /// Mapping a register window failed.
    #[error("register window mapping failed: {reason}")]
    MapFailed {
        /// Reason for failure.
        reason: String,
    },

    /// I/O error while probing or mapping host resources.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl PiwaveError {
    /// Create a register-window mapping error.
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }
}

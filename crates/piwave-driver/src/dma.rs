//! DMA transfer management.
//!
//! [`DmaChannel`] is the contract of the platform's slave-DMA engine as the
//! driver consumes it: the channel arrives already configured with its
//! source/destination bus widths and DREQ pacing id, the driver points it
//! at the peripheral FIFO and feeds it single-buffer descriptors.
//! [`TransferManager`] owns the one in-flight transfer per peripheral
//! instance and its `Idle → Mapped → InProgress → {Complete, Error} → Idle`
//! state machine.

use crate::buffer::{lock, BufferLifecycle, BusAddress};
use crate::error::DmaError;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Token identifying a submitted transfer.
pub type Cookie = u64;

/// Token identifying a prepared-but-unsubmitted descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(pub u64);

/// Status of a transfer as reported to the completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    /// Still moving data; not terminal.
    InProgress,
    /// Paused by the engine; not terminal.
    Paused,
    /// All data moved.
    Complete,
    /// The engine gave up on the transfer.
    Error,
}

impl DmaStatus {
    /// Whether this status ends the transfer.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Completion callback attached to a submitted descriptor.
///
/// Invoked by the engine outside the submitter's control flow, possibly
/// concurrently with a new `start_transfer`, and possibly more than once
/// with non-terminal statuses. Implementations must not block.
pub type CompletionHandler = Box<dyn Fn(DmaStatus) + Send + Sync>;

/// Slave configuration the driver applies to its channel at bring-up.
#[derive(Debug, Clone, Copy)]
pub struct SlaveConfig {
    /// Peripheral FIFO register, as a bus address. A physical address here
    /// would make transfers silently target unmapped space.
    pub dst: BusAddress,
}

/// One slave-DMA channel, memory-to-device direction.
///
/// Contract for implementors:
/// - completion handlers run only after [`issue_pending`](Self::issue_pending);
/// - [`terminate_sync`](Self::terminate_sync) delivers the in-flight
///   descriptor's terminal callback before returning and is unconditional
///   (no timeout).
pub trait DmaChannel: Send + Sync {
    /// Point the channel at the peripheral FIFO. Bus widths and the DREQ
    /// pacing id were fixed when the platform handed the channel out.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the configuration.
    fn configure(&self, config: SlaveConfig) -> Result<(), DmaError>;

    /// Build a single-buffer descriptor reading `len` bytes from `src`.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::PrepareFailed`] if the engine cannot build the
    /// descriptor.
    fn prep_slave_single(&self, src: BusAddress, len: usize) -> Result<DescriptorId, DmaError>;

    /// Queue a prepared descriptor with its completion handler.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::SubmitFailed`] if the engine rejects the
    /// descriptor.
    fn submit(
        &self,
        descriptor: DescriptorId,
        on_complete: CompletionHandler,
    ) -> Result<Cookie, DmaError>;

    /// Start executing queued descriptors.
    fn issue_pending(&self);

    /// Synchronously terminate the in-flight transfer, if any.
    fn terminate_sync(&self);
}

/// Transfer state-machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// No transfer; the producer owns all buffers.
    Idle,
    /// Device buffer handed over, descriptor not yet in flight.
    Mapped,
    /// Descriptor issued to the engine.
    InProgress,
}

#[derive(Debug, Clone, Copy)]
struct TransferInfo {
    phase: TransferPhase,
    cookie: Option<Cookie>,
    failed: bool,
}

struct SharedState {
    info: Mutex<TransferInfo>,
    idle: Condvar,
}

/// Owns the single in-flight transfer of one peripheral instance.
///
/// A new request always preempts an older one — there is no queue. The
/// in-flight transfer is cancelled synchronously and confirmed finished
/// before the replacement maps its buffer, so no two `InProgress` windows
/// ever overlap.
pub struct TransferManager {
    channel: Arc<dyn DmaChannel>,
    lifecycle: BufferLifecycle,
    state: Arc<SharedState>,
}

impl TransferManager {
    /// Create a manager driving `channel`, releasing buffers through
    /// `lifecycle` on completion.
    pub fn new(channel: Arc<dyn DmaChannel>, lifecycle: BufferLifecycle) -> Self {
        Self {
            channel,
            lifecycle,
            state: Arc::new(SharedState {
                info: Mutex::new(TransferInfo {
                    phase: TransferPhase::Idle,
                    cookie: None,
                    failed: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Current phase of the state machine.
    #[must_use]
    pub fn phase(&self) -> TransferPhase {
        lock(&self.state.info).phase
    }

    /// Cookie of the in-flight transfer, if any.
    #[must_use]
    pub fn cookie(&self) -> Option<Cookie> {
        lock(&self.state.info).cookie
    }

    /// Whether the most recent transfer ended in error. Such failures are
    /// retryable; the manager takes no automatic action.
    #[must_use]
    pub fn last_transfer_failed(&self) -> bool {
        lock(&self.state.info).failed
    }

    /// Synchronously cancel the in-flight transfer, if any, and wait until
    /// its terminal callback has run and returned the buffer.
    pub fn cancel_in_flight(&self) {
        {
            let info = lock(&self.state.info);
            if info.phase != TransferPhase::InProgress {
                return;
            }
        }
        tracing::debug!("terminating in-flight transfer");
        self.channel.terminate_sync();

        // terminate_sync has delivered the terminal callback; the wait only
        // covers a transfer that is completing on another thread at the
        // same moment.
        let mut info = lock(&self.state.info);
        while info.phase == TransferPhase::InProgress {
            info = self
                .state
                .idle
                .wait(info)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Submit a new transfer of `len` bytes at `bus`.
    ///
    /// The caller has already cancelled any in-flight transfer and acquired
    /// the device buffer; an in-flight transfer found here is cancelled
    /// again before the descriptor is built.
    ///
    /// # Errors
    ///
    /// [`DmaError::PrepareFailed`] or [`DmaError::SubmitFailed`] — in both
    /// cases the device buffer is returned, the machine is back at `Idle`,
    /// and the caller may retry with a fresh request.
    pub fn start_transfer(&self, bus: BusAddress, len: usize) -> Result<(), DmaError> {
        self.cancel_in_flight();

        {
            let mut info = lock(&self.state.info);
            info.phase = TransferPhase::Mapped;
            info.cookie = None;
        }

        let descriptor = match self.channel.prep_slave_single(bus, len) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.abort_mapped();
                return Err(e);
            }
        };

        let cookie = match self.channel.submit(descriptor, self.completion_handler()) {
            Ok(cookie) => cookie,
            Err(e) => {
                self.abort_mapped();
                return Err(e);
            }
        };

        {
            let mut info = lock(&self.state.info);
            info.phase = TransferPhase::InProgress;
            info.cookie = Some(cookie);
            info.failed = false;
        }
        self.channel.issue_pending();
        tracing::debug!("transfer {cookie} issued: {len} bytes at {bus}");
        Ok(())
    }

    /// Cancel anything in flight and return all buffers to the producer.
    pub fn shutdown(&self) {
        self.cancel_in_flight();
        self.abort_mapped();
    }

    fn abort_mapped(&self) {
        self.lifecycle.release_from_device();
        let mut info = lock(&self.state.info);
        info.phase = TransferPhase::Idle;
        info.cookie = None;
    }

    fn completion_handler(&self) -> CompletionHandler {
        let state = Arc::clone(&self.state);
        let lifecycle = self.lifecycle.clone();
        Box::new(move |status| {
            // Runs on the engine's completion context: never block, and
            // tolerate repeat delivery.
            if !status.is_terminal() {
                tracing::debug!("non-terminal transfer status {status:?}");
                return;
            }
            lifecycle.release_from_device();
            let mut info = lock(&state.info);
            info.phase = TransferPhase::Idle;
            info.cookie = None;
            if status == DmaStatus::Error {
                info.failed = true;
                tracing::warn!("transfer ended in error; caller may re-issue");
            }
            drop(info);
            state.idle.notify_all();
        })
    }
}

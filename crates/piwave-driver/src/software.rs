//! Software engine — in-process register block, DMA channel, and allocator.
//!
//! Implements the [`Registers`], [`DmaChannel`], and [`DmaMemory`] seams
//! without hardware, mirroring what the real engine observes: which
//! registers were written in which order, which descriptors were submitted,
//! and exactly which bytes would have gone out on the wire. This enables:
//!
//! 1. **CI without a Pi**: the full bring-up, encode, and transfer paths
//!    run unmodified against this engine.
//! 2. **Timing-law verification**: wire-byte snapshots let tests assert the
//!    encoded waveform the peripheral would have serialised.
//! 3. **Cancellation-ordering proof**: the engine records terminations and
//!    flags any overlapping submissions, so the one-in-flight invariant is
//!    checkable rather than assumed.
//!
//! Completion is delivered on `issue_pending` when the engine is built with
//! [`SoftwareDma::auto`], or on explicit [`SoftwareDma::finish`] /
//! [`SoftwareDma::notify`] calls for tests that hold transfers open.

use crate::buffer::{lock, BusAddress, DmaRegion, DmaMemory};
use crate::clock::Delay;
use crate::dma::{
    Cookie, CompletionHandler, DescriptorId, DmaChannel, DmaStatus, SlaveConfig,
};
use crate::error::{AllocationError, DmaError};
use crate::mmio::Registers;
use piwave_chip::soc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ── Register block ───────────────────────────────────────────────────────────

/// Scriptable register block: stores writes, logs their order, and can hold
/// bits forced high (e.g. a clock busy bit that never settles).
#[derive(Debug, Default)]
pub struct SoftwareRegisters {
    inner: Mutex<RegisterState>,
}

#[derive(Debug, Default)]
struct RegisterState {
    values: HashMap<usize, u32>,
    forced: HashMap<usize, u32>,
    writes: Vec<(usize, u32)>,
}

impl SoftwareRegisters {
    /// An all-zero register block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force `mask` bits high on every read of `offset`.
    pub fn force_bits(&self, offset: usize, mask: u32) {
        *lock(&self.inner).forced.entry(offset).or_insert(0) |= mask;
    }

    /// Stop forcing bits on `offset`.
    pub fn clear_forced(&self, offset: usize) {
        lock(&self.inner).forced.remove(&offset);
    }

    /// Every write performed, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        lock(&self.inner).writes.clone()
    }

    /// Current stored value of `offset`.
    #[must_use]
    pub fn value(&self, offset: usize) -> u32 {
        lock(&self.inner).values.get(&offset).copied().unwrap_or(0)
    }
}

impl Registers for SoftwareRegisters {
    fn read32(&self, offset: usize) -> u32 {
        let state = lock(&self.inner);
        state.values.get(&offset).copied().unwrap_or(0)
            | state.forced.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = lock(&self.inner);
        state.values.insert(offset, value);
        state.writes.push((offset, value));
    }
}

// ── Delay ────────────────────────────────────────────────────────────────────

/// [`Delay`] that returns immediately but accounts for requested sleep time,
/// so timeout boundaries are assertable without wall-clock cost.
#[derive(Debug, Default)]
pub struct InstantDelay {
    slept_ms: AtomicU64,
    calls: AtomicU64,
}

impl InstantDelay {
    /// Total milliseconds of sleep requested so far.
    #[must_use]
    pub fn total_slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::Relaxed)
    }

    /// Number of sleep calls so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Delay for InstantDelay {
    fn sleep_ms(&self, ms: u64) {
        self.slept_ms.fetch_add(ms, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

// ── DMA engine ───────────────────────────────────────────────────────────────

/// Everything the engine saw of one submitted transfer.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    /// Source bus address.
    pub src: BusAddress,
    /// Destination the channel was configured with at submit time.
    pub dst: Option<BusAddress>,
    /// Transfer length in bytes.
    pub len: usize,
    /// Cookie handed back to the submitter.
    pub cookie: Cookie,
    /// The bytes that would have gone out on the wire.
    pub wire_bytes: Vec<u8>,
    /// Terminal status, once the transfer ended.
    pub outcome: Option<DmaStatus>,
    /// Whether the transfer ended through `terminate_sync`.
    pub terminated: bool,
}

type SharedHandler = Arc<dyn Fn(DmaStatus) + Send + Sync>;

struct ActiveTransfer {
    record: usize,
    handler: SharedHandler,
}

#[derive(Default)]
struct EngineState {
    dst: Option<BusAddress>,
    next_bus: u32,
    regions: HashMap<u32, DmaRegion>,
    next_id: u64,
    prepared: HashMap<u64, (BusAddress, usize)>,
    active: Option<ActiveTransfer>,
    records: Vec<TransferRecord>,
    terminations: u64,
    overlaps: u64,
    fail_alloc: bool,
    fail_prepare: bool,
    fail_submit: bool,
}

/// In-process DMA engine and allocator.
pub struct SoftwareDma {
    state: Arc<Mutex<EngineState>>,
    auto_complete: bool,
}

impl SoftwareDma {
    /// Engine that holds transfers open until [`finish`](Self::finish).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            auto_complete: false,
        }
    }

    /// Engine that completes every transfer during `issue_pending`.
    #[must_use]
    pub fn auto() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            auto_complete: true,
        }
    }

    /// Make the next allocations fail.
    pub fn set_fail_alloc(&self, fail: bool) {
        lock(&self.state).fail_alloc = fail;
    }

    /// Make the next descriptor preparations fail.
    pub fn set_fail_prepare(&self, fail: bool) {
        lock(&self.state).fail_prepare = fail;
    }

    /// Make the next submissions fail.
    pub fn set_fail_submit(&self, fail: bool) {
        lock(&self.state).fail_submit = fail;
    }

    /// All transfers submitted so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<TransferRecord> {
        lock(&self.state).records.clone()
    }

    /// Whether a transfer is currently held open.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    /// Number of `terminate_sync` calls that ended a transfer.
    #[must_use]
    pub fn termination_count(&self) -> u64 {
        lock(&self.state).terminations
    }

    /// Number of submissions that arrived while another transfer was still
    /// active. Always zero when the transfer manager honours the
    /// one-in-flight rule.
    #[must_use]
    pub fn overlap_count(&self) -> u64 {
        lock(&self.state).overlaps
    }

    /// Destination the channel was last configured with.
    #[must_use]
    pub fn configured_dst(&self) -> Option<BusAddress> {
        lock(&self.state).dst
    }

    /// End the active transfer with `status` (terminal) and deliver its
    /// callback. No-op when nothing is active.
    pub fn finish(&self, status: DmaStatus) {
        self.end_active(status, false);
    }

    /// Deliver a non-terminal `status` to the active transfer's callback
    /// without ending it; terminal statuses forward to [`finish`].
    pub fn notify(&self, status: DmaStatus) {
        if status.is_terminal() {
            self.finish(status);
            return;
        }
        let handler = {
            let state = lock(&self.state);
            state.active.as_ref().map(|active| Arc::clone(&active.handler))
        };
        if let Some(handler) = handler {
            (*handler)(status);
        }
    }

    fn end_active(&self, status: DmaStatus, terminated: bool) {
        let finished = {
            let mut state = lock(&self.state);
            let Some(active) = state.active.take() else {
                return;
            };
            if terminated {
                state.terminations += 1;
            }
            let record = &mut state.records[active.record];
            record.outcome = Some(status);
            record.terminated = terminated;
            active.handler
        };
        // Callback runs without the engine lock, like a real completion
        // interrupt would.
        (*finished)(status);
    }
}

impl Default for SoftwareDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMemory for SoftwareDma {
    fn alloc(&self, len: usize) -> Result<DmaRegion, AllocationError> {
        let mut state = lock(&self.state);
        if state.fail_alloc {
            return Err(AllocationError { len });
        }
        // Bump allocation inside the fake SDRAM bus alias, page-granular
        // like a real DMA pool.
        let bus = BusAddress(soc::SDRAM_BUS_OFFSET + state.next_bus);
        state.next_bus += u32::try_from(len.div_ceil(4096) * 4096).unwrap_or(u32::MAX);
        let region = DmaRegion::new(len, bus);
        state.regions.insert(bus.0, region.clone());
        Ok(region)
    }
}

impl DmaChannel for SoftwareDma {
    fn configure(&self, config: SlaveConfig) -> Result<(), DmaError> {
        lock(&self.state).dst = Some(config.dst);
        tracing::debug!("software channel configured for FIFO at {}", config.dst);
        Ok(())
    }

    fn prep_slave_single(&self, src: BusAddress, len: usize) -> Result<DescriptorId, DmaError> {
        let mut state = lock(&self.state);
        if state.fail_prepare {
            return Err(DmaError::prepare_failed("injected prepare failure"));
        }
        if !state.regions.contains_key(&src.0) {
            return Err(DmaError::prepare_failed(format!(
                "no DMA region at {src}"
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.prepared.insert(id, (src, len));
        Ok(DescriptorId(id))
    }

    fn submit(
        &self,
        descriptor: DescriptorId,
        on_complete: CompletionHandler,
    ) -> Result<Cookie, DmaError> {
        let mut state = lock(&self.state);
        if state.fail_submit {
            return Err(DmaError::submit_failed("injected submit failure"));
        }
        let Some((src, len)) = state.prepared.remove(&descriptor.0) else {
            return Err(DmaError::submit_failed(format!(
                "unknown descriptor {descriptor:?}"
            )));
        };
        if state.active.is_some() {
            state.overlaps += 1;
            tracing::warn!("transfer submitted while another is active");
        }

        let wire_bytes = state
            .regions
            .get(&src.0)
            .map(|region| {
                let mut snapshot = region.snapshot();
                snapshot.truncate(len);
                snapshot
            })
            .unwrap_or_default();

        let cookie = descriptor.0;
        let dst = state.dst;
        state.records.push(TransferRecord {
            src,
            dst,
            len,
            cookie,
            wire_bytes,
            outcome: None,
            terminated: false,
        });
        state.active = Some(ActiveTransfer {
            record: state.records.len() - 1,
            handler: Arc::from(on_complete),
        });
        Ok(cookie)
    }

    fn issue_pending(&self) {
        if self.auto_complete {
            self.finish(DmaStatus::Complete);
        }
    }

    fn terminate_sync(&self) {
        self.end_active(DmaStatus::Error, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_distinct_bus_addresses() {
        let engine = SoftwareDma::new();
        let a = engine.alloc(16).unwrap();
        let b = engine.alloc(16).unwrap();
        assert_ne!(a.bus_address(), b.bus_address());
        assert_eq!(a.bus_address().0 & 0xC000_0000, soc::SDRAM_BUS_OFFSET);
    }

    #[test]
    fn prepare_rejects_unknown_regions() {
        let engine = SoftwareDma::new();
        assert!(matches!(
            engine.prep_slave_single(BusAddress(0xDEAD_0000), 4),
            Err(DmaError::PrepareFailed { .. })
        ));
    }

    #[test]
    fn terminate_without_active_transfer_is_a_no_op() {
        let engine = SoftwareDma::new();
        engine.terminate_sync();
        assert_eq!(engine.termination_count(), 0);
    }
}

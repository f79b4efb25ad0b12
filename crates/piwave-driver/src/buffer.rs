//! Transfer-buffer lifecycle.
//!
//! The device-visible buffer is the only resource shared between the
//! producer thread and the DMA engine, so its ownership hand-off is strict:
//! [`BufferLifecycle::acquire_for_device`] builds the word-swapped copy and
//! hands it to the engine; the completion handler gives it back through
//! [`BufferLifecycle::release_from_device`]. The producer's own buffer is
//! never touched, so a pixel frame survives across shows without
//! re-encoding.

use crate::error::{AllocationError, PiwaveError, Result};
use crate::waveform;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Width of one DMA word transfer in bytes.
pub const DMA_WORD_BYTES: usize = 4;

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// Completion handlers must keep releasing buffers even after a producer
/// thread died mid-request.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Device-visible address, as the DMA engine must see it. Distinct from the
/// CPU's physical view of the same memory; mixing the two makes transfers
/// silently target unmapped space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress(pub u32);

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Device-visible length for a producer buffer of `len` bytes: rounded up
/// to whole DMA words. The padding bytes stay zero — trailing line idle for
/// the strip, silence for the buzzer.
#[must_use]
pub const fn device_len(len: usize) -> usize {
    len.div_ceil(DMA_WORD_BYTES) * DMA_WORD_BYTES
}

/// A DMA-capable buffer with its device-visible address.
///
/// Clones share the same backing bytes; the engine side keeps one to read
/// the wire data while the lifecycle side owns the hand-off.
#[derive(Debug, Clone)]
pub struct DmaRegion {
    bytes: Arc<Mutex<Vec<u8>>>,
    bus_address: BusAddress,
}

impl DmaRegion {
    /// A zeroed region of `len` bytes at `bus_address`.
    #[must_use]
    pub fn new(len: usize, bus_address: BusAddress) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
            bus_address,
        }
    }

    /// Device-visible address of the region.
    #[must_use]
    pub const fn bus_address(&self) -> BusAddress {
        self.bus_address
    }

    /// Region length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// Whether the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the region contents as the word-swapped image of `src`.
    pub fn copy_swapped_from(&self, src: &[u8]) {
        let mut bytes = lock(&self.bytes);
        bytes.fill(0);
        waveform::swap_words(src, &mut bytes);
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }
}

/// Allocator for DMA-capable memory. Owned by the surrounding platform
/// glue in production; the software engine implements it in-process.
pub trait DmaMemory: Send + Sync {
    /// Allocate a zeroed `len`-byte region the DMA engine can reach.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] when no DMA-capable memory is available;
    /// the request fails and the caller may retry.
    fn alloc(&self, len: usize) -> std::result::Result<DmaRegion, AllocationError>;
}

/// Owns the producer → device → producer hand-off of the transfer buffer.
#[derive(Clone)]
pub struct BufferLifecycle {
    memory: Arc<dyn DmaMemory>,
    device: Arc<Mutex<Option<DmaRegion>>>,
}

impl BufferLifecycle {
    /// Create a lifecycle over the given allocator.
    pub fn new(memory: Arc<dyn DmaMemory>) -> Self {
        Self {
            memory,
            device: Arc::new(Mutex::new(None)),
        }
    }

    /// Build the device-visible copy of `producer` and hand it to the DMA
    /// engine. The copy is word-padded with zeros and byte-swapped to the
    /// engine's word order; `producer` itself is left untouched.
    ///
    /// # Errors
    ///
    /// [`PiwaveError::BufferBusy`] if the engine still owns a previous
    /// copy (the caller must cancel the in-flight transfer first), or
    /// [`PiwaveError::Allocation`] when no DMA-capable memory is available
    /// — in both cases prior state is unchanged and the caller may retry.
    pub fn acquire_for_device(&self, producer: &[u8]) -> Result<BusAddress> {
        let mut slot = lock(&self.device);
        if slot.is_some() {
            return Err(PiwaveError::BufferBusy);
        }

        let region = self.memory.alloc(device_len(producer.len()))?;
        region.copy_swapped_from(producer);
        let bus = region.bus_address();
        tracing::debug!(
            "device buffer mapped at {bus}, {} bytes ({} from producer)",
            region.len(),
            producer.len()
        );
        *slot = Some(region);
        Ok(bus)
    }

    /// Return the device-visible buffer to the producer side. Invoked from
    /// the DMA completion handler; repeat calls are no-ops.
    pub fn release_from_device(&self) -> bool {
        let released = lock(&self.device).take().is_some();
        if released {
            tracing::debug!("device buffer released");
        }
        released
    }

    /// Whether the DMA engine currently owns a device-visible copy.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        lock(&self.device).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMemory;

    impl DmaMemory for FixedMemory {
        fn alloc(&self, len: usize) -> std::result::Result<DmaRegion, AllocationError> {
            Ok(DmaRegion::new(len, BusAddress(0xC000_0000)))
        }
    }

    struct NoMemory;

    impl DmaMemory for NoMemory {
        fn alloc(&self, len: usize) -> std::result::Result<DmaRegion, AllocationError> {
            Err(AllocationError { len })
        }
    }

    #[test]
    fn device_len_rounds_to_words() {
        assert_eq!(device_len(0), 0);
        assert_eq!(device_len(1), 4);
        assert_eq!(device_len(4), 4);
        assert_eq!(device_len(33), 36);
    }

    #[test]
    fn acquire_swaps_without_touching_producer() {
        let lifecycle = BufferLifecycle::new(Arc::new(FixedMemory));
        let producer = [1u8, 2, 3, 4, 5];
        lifecycle.acquire_for_device(&producer).unwrap();
        assert_eq!(producer, [1, 2, 3, 4, 5]);

        let device = lock(&lifecycle.device).clone().unwrap();
        assert_eq!(device.snapshot(), vec![4, 3, 2, 1, 0, 0, 0, 5]);
    }

    #[test]
    fn second_acquire_while_in_flight_is_rejected() {
        let lifecycle = BufferLifecycle::new(Arc::new(FixedMemory));
        lifecycle.acquire_for_device(&[0u8; 8]).unwrap();
        assert!(matches!(
            lifecycle.acquire_for_device(&[0u8; 8]),
            Err(PiwaveError::BufferBusy)
        ));

        assert!(lifecycle.release_from_device());
        assert!(!lifecycle.release_from_device());
        assert!(lifecycle.acquire_for_device(&[0u8; 8]).is_ok());
    }

    #[test]
    fn allocation_failure_leaves_state_unchanged() {
        let lifecycle = BufferLifecycle::new(Arc::new(NoMemory));
        let err = lifecycle.acquire_for_device(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            PiwaveError::Allocation(AllocationError { len: 12 })
        ));
        assert!(!lifecycle.in_flight());
    }
}

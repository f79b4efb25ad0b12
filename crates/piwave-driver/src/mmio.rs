//! Memory-mapped I/O over the peripheral register windows.
//!
//! [`Registers`] is the seam between the engine and the silicon: everything
//! above it (clock sequencing, peripheral bring-up) is written against the
//! trait, so tests drive the exact same code paths against a scripted
//! register block. [`MappedRegion`] is the hardware implementation, mapping
//! a physical window of `/dev/mem`.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{PiwaveError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::AsFd;
use std::sync::Arc;

/// 32-bit register access over one mapped window.
pub trait Registers: Send + Sync {
    /// Read a 32-bit register at `offset` bytes into the window.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register at `offset` bytes into the window.
    fn write32(&self, offset: usize, value: u32);
}

/// Mapped physical register window.
pub struct MappedRegion {
    /// Memory-mapped pointer.
    ptr: *mut u8,
    /// Size of the mapping.
    size: usize,
    /// Physical base address, kept for diagnostics.
    phys: u64,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; mmap'd memory is
// process-wide and carries no thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - reads and writes are volatile single-word MMIO accesses.
// Callers serialise register programming per peripheral instance (requests
// are serialised by the cancel-and-replace rule), so there is no multi-word
// state to tear.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map a `size`-byte register window at physical address `phys`.
    ///
    /// `mem` is an open `/dev/mem` (or `/dev/gpiomem`-style) handle; `phys`
    /// must be page-aligned, which every BCM2835 peripheral block base is.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails (insufficient privileges,
    /// or a kernel built without `/dev/mem` access).
    pub fn map(mem: &File, phys: u64, size: usize) -> Result<Self> {
        // SAFETY: mmap necessary for MMIO - maps the register window into the
        // process. Invariants: (1) mem is an open character device fd;
        // (2) phys is page-aligned; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                mem.as_fd(),
                phys,
            )
            .map_err(|e| PiwaveError::map_failed(format!("mmap of {phys:#x} failed: {e}")))?
        };

        tracing::debug!("mapped register window {:#x} at {:p}, size {:#x}", phys, ptr, size);

        Ok(Self {
            ptr: ptr.cast(),
            size,
            phys,
        })
    }
}

impl Registers for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change the
        // value. ptr is from mmap in map(), valid for self.size; offset is
        // bounds-checked; registers are 4-byte aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side
        // effects. ptr valid for self.size; offset bounds-checked; aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - ptr/size were mapped in map(), Drop runs
        // at most once and no references outlive self.
        unsafe {
            // Ignore error in Drop (can't propagate, would need to log)
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("unmapped register window {:#x}", self.phys);
    }
}

/// Window at a fixed offset inside another register block.
///
/// The clock manager packs one channel per 8 bytes into a single page; both
/// peripherals' sequencers address their channel through a `Subregion` over
/// the same mapping.
#[derive(Clone)]
pub struct Subregion {
    inner: Arc<dyn Registers>,
    base: usize,
}

impl Subregion {
    /// View `inner` starting `base` bytes in.
    pub fn new(inner: Arc<dyn Registers>, base: usize) -> Self {
        Self { inner, base }
    }
}

impl Registers for Subregion {
    fn read32(&self, offset: usize) -> u32 {
        self.inner.read32(self.base + offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.inner.write32(self.base + offset, value);
    }
}

//! Userspace waveform-streaming driver for the Raspberry Pi piezo buzzer
//! (PCM block) and addressable LED strip (PWM serialiser).
//!
//! A logical request — "play this tone", "show these pixel colours" —
//! becomes a byte buffer whose bit pattern *is* the electrical waveform,
//! streamed into the peripheral FIFO by DMA at a bit rate fixed by the
//! clock manager. The hard parts live in three tightly coupled pieces:
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │  Waveform    │──▶│  Buffer lifecycle │──▶│  DMA transfer    │
//! │  encoder     │   │  (word-swapped    │   │  manager (one    │
//! │  (pure)      │   │   device copy)    │   │  in flight)      │
//! └──────────────┘   └───────────────────┘   └──────────────────┘
//!                                                   │ completion
//!          ┌───────────────────┐                    ▼ callback
//!          │  Clock sequencer  │            buffer returned to
//!          │  (password-gated, │            the producer side
//!          │   bounded waits)  │
//!          └───────────────────┘
//! ```
//!
//! Every hardware touchpoint is a seam ([`mmio::Registers`],
//! [`dma::DmaChannel`], [`buffer::DmaMemory`], [`clock::Delay`]), so the
//! whole engine runs against the in-process [`software`] engine in CI and
//! against `/dev/mem` plus a platform DMA provider on the Pi.
//!
//! # Quick start
//!
//! ```no_run
//! use piwave_driver::prelude::*;
//!
//! # fn main() -> piwave_driver::Result<()> {
//! let resources: PeripheralResources = todo!("platform glue");
//! let buzzer = Buzzer::init(resources, &BuzzerConfig::raspberry_pi()?)?;
//! buzzer.play_tone(440, 500)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod buffer;
pub mod buzzer;
pub mod clock;
pub mod discovery;
pub mod dma;
pub mod error;
pub mod mmio;
pub mod software;
pub mod strip;
pub mod waveform;

use std::sync::Arc;

/// Driver version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hardware handles one peripheral instance consumes, provided by the
/// surrounding platform glue: mapped register windows for the peripheral
/// and its clock channel, a slave-DMA channel already configured with bus
/// widths and DREQ id, a DMA-capable allocator, and a sleep primitive.
pub struct PeripheralResources {
    /// The peripheral's own register window.
    pub registers: Arc<dyn mmio::Registers>,
    /// The peripheral's clock-manager channel window.
    pub clock_registers: Arc<dyn mmio::Registers>,
    /// Slave-DMA channel feeding the peripheral FIFO.
    pub dma: Arc<dyn dma::DmaChannel>,
    /// Allocator for DMA-capable transfer buffers.
    pub memory: Arc<dyn buffer::DmaMemory>,
    /// Sleep provider for settle times and busy-wait polls.
    pub delay: Arc<dyn clock::Delay>,
}

pub use buffer::{BufferLifecycle, BusAddress, DmaMemory, DmaRegion};
pub use buzzer::{Buzzer, BuzzerConfig, Melody, Note};
pub use clock::{ClockConfig, ClockSequencer, ClockSource, Delay, MashStage, OsDelay};
pub use discovery::SocMap;
pub use dma::{DmaChannel, DmaStatus, SlaveConfig, TransferManager, TransferPhase};
pub use error::{AllocationError, ClockError, DmaError, PiwaveError, Result};
pub use mmio::{MappedRegion, Registers, Subregion};
pub use software::{InstantDelay, SoftwareDma, SoftwareRegisters};
pub use strip::{PixelStrip, StripConfig};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Buzzer, BuzzerConfig, ClockConfig, ClockSource, MashStage, Melody, PeripheralResources,
        PiwaveError, PixelStrip, Result, SocMap, StripConfig,
    };
}

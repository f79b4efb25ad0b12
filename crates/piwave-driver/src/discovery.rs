//! Runtime SoC discovery.
//!
//! The peripheral physical window moves between SoC generations
//! (BCM2835/Pi 1 at `0x2000_0000`, BCM2836/7/Pi 2–3 at `0x3F00_0000`,
//! BCM2711/Pi 4 at `0xFE00_0000`), so nothing is hardcoded: the base is
//! read from the device tree the firmware populated, and the register
//! windows are derived from it plus the fixed block offsets in
//! [`piwave_chip::soc`].

use crate::error::{PiwaveError, Result};
use piwave_chip::soc;
use std::fs::File;
use std::path::Path;

/// Device-tree property mapping the peripheral bus window to the ARM
/// physical window.
pub const SOC_RANGES: &str = "/proc/device-tree/soc/ranges";

/// Discovered SoC address map.
#[derive(Debug, Clone, Copy)]
pub struct SocMap {
    /// Physical base of the peripheral window.
    pub peripheral_base: u32,
}

impl SocMap {
    /// Read the peripheral base from the device tree.
    ///
    /// # Errors
    ///
    /// Returns an error when the ranges property is missing (not a
    /// Raspberry Pi, or no device-tree filesystem) or unparseable.
    pub fn discover() -> Result<Self> {
        let ranges = std::fs::read(Path::new(SOC_RANGES))?;
        let peripheral_base = parse_ranges(&ranges).ok_or_else(|| {
            PiwaveError::map_failed(format!("unparseable ranges property in {SOC_RANGES}"))
        })?;
        tracing::info!("SoC peripheral window at {peripheral_base:#x}");
        Ok(Self { peripheral_base })
    }

    /// Physical address of the PCM block.
    #[must_use]
    pub const fn pcm_block(&self) -> u64 {
        (self.peripheral_base + soc::PCM_BLOCK) as u64
    }

    /// Physical address of the PWM block.
    #[must_use]
    pub const fn pwm_block(&self) -> u64 {
        (self.peripheral_base + soc::PWM_BLOCK) as u64
    }

    /// Physical address of the clock-manager block.
    #[must_use]
    pub const fn clock_block(&self) -> u64 {
        (self.peripheral_base + soc::CM_BLOCK) as u64
    }
}

/// Open `/dev/mem` for register mapping.
///
/// # Errors
///
/// Returns the underlying I/O error (usually missing privileges).
pub fn open_devmem() -> Result<File> {
    Ok(File::options().read(true).write(true).open("/dev/mem")?)
}

/// Decode the `ranges` property: big-endian cells, child bus address
/// first, then the parent (physical) address — one cell on the older
/// SoCs, two on the BCM2711 where the high half is zero — then the size.
fn parse_ranges(ranges: &[u8]) -> Option<u32> {
    let cell = |index: usize| -> Option<u32> {
        let bytes: [u8; 4] = ranges.get(index * 4..index * 4 + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    };

    if cell(0)? != soc::PERIPHERAL_BUS_BASE {
        return None;
    }
    match cell(1)? {
        0 => cell(2),
        base => Some(base),
    }
}

//! Clock-manager sequencing.
//!
//! Brings a peripheral clock generator from an unknown state to a known
//! running state. The hardware is documented to glitch or hang if the steps
//! run out of order, so [`ClockSequencer::configure`] is the only write path
//! to the clock-manager registers. Every write carries the password in bits
//! 31–24; the hardware silently drops writes without it.

use crate::error::{ClockError, PiwaveError, Result};
use crate::mmio::Registers;
use piwave_chip::clockman as cm;
use std::sync::Arc;
use std::time::Duration;

/// Interval between busy-bit polls and between sequencing steps.
pub const SETTLE_MS: u64 = 100;

/// Busy polls before the sequencer gives up.
pub const BUSY_POLL_LIMIT: u32 = 100;

/// Sleep provider. Injectable so tests can run the sequencer (and its
/// timeout boundary) without wall-clock delays.
pub trait Delay: Send + Sync {
    /// Block the calling thread for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);
}

/// [`Delay`] backed by the OS scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsDelay;

impl Delay for OsDelay {
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// MASH noise-shaping stage for the fractional divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MashStage {
    /// Integer division only; the fractional part is ignored.
    Integer = 0,
    /// One-stage noise shaping.
    Stage1 = 1,
    /// Two-stage noise shaping.
    Stage2 = 2,
    /// Three-stage noise shaping.
    Stage3 = 3,
}

/// Clock-generator input select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Ground (no clock).
    Ground = 0,
    /// 19.2 MHz crystal oscillator.
    Oscillator = 1,
    /// PLLA per-core clock.
    PllA = 4,
    /// PLLC core clock (changes with the core frequency governor).
    PllC = 5,
    /// PLLD 500 MHz fixed clock, the usual peripheral source.
    PllD = 6,
    /// HDMI auxiliary clock.
    Hdmi = 7,
}

/// Validated divisor and source selection for one clock channel.
///
/// Effective output frequency is
/// `source_hz / (divisor_integer + divisor_fraction / 4096)`.
/// Computed once at peripheral init and never mutated while a transfer is
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    divisor_integer: u32,
    divisor_fraction: u32,
    mash: MashStage,
    source: ClockSource,
}

impl ClockConfig {
    /// Build a config from explicit divisor parts.
    ///
    /// # Errors
    ///
    /// Returns [`PiwaveError::InvalidDivisor`] if the integer part is
    /// outside `1..=4095` or the fractional part exceeds its 12-bit field.
    pub fn new(
        divisor_integer: u32,
        divisor_fraction: u32,
        mash: MashStage,
        source: ClockSource,
    ) -> Result<Self> {
        if divisor_integer == 0 || divisor_integer > cm::DIVISOR_FIELD_MAX {
            return Err(PiwaveError::InvalidDivisor {
                field: "integer divisor",
                value: divisor_integer,
            });
        }
        if divisor_fraction > cm::DIVISOR_FIELD_MAX {
            return Err(PiwaveError::InvalidDivisor {
                field: "fractional divisor",
                value: divisor_fraction,
            });
        }
        Ok(Self {
            divisor_integer,
            divisor_fraction,
            mash,
            source,
        })
    }

    /// Compute the divisor for a target generator frequency.
    ///
    /// # Errors
    ///
    /// Returns [`PiwaveError::InvalidDivisor`] if the required integer
    /// divisor does not fit its 12-bit field.
    pub fn for_frequency(
        source: ClockSource,
        source_hz: u32,
        target_hz: u32,
        mash: MashStage,
    ) -> Result<Self> {
        let divi = source_hz / target_hz;
        let divf =
            u32::try_from(u64::from(source_hz % target_hz) * 4096 / u64::from(target_hz))
                .unwrap_or(cm::DIVISOR_FIELD_MAX);
        Self::new(divi, divf, mash, source)
    }

    /// Integer divisor part.
    #[must_use]
    pub const fn divisor_integer(&self) -> u32 {
        self.divisor_integer
    }

    /// Fractional divisor part (in 1/4096ths).
    #[must_use]
    pub const fn divisor_fraction(&self) -> u32 {
        self.divisor_fraction
    }

    /// Divisor register value, without the password.
    #[must_use]
    pub const fn divisor_word(&self) -> u32 {
        cm::divisor(self.divisor_integer, self.divisor_fraction)
    }

    /// Control register value (source + MASH), without password or enable.
    #[must_use]
    pub const fn control_word(&self) -> u32 {
        cm::ctl::mash(self.mash as u32) | cm::ctl::src(self.source as u32)
    }
}

/// Drives one clock-manager channel through the disable → wait → configure
/// → enable sequence.
pub struct ClockSequencer {
    regs: Arc<dyn Registers>,
    delay: Arc<dyn Delay>,
}

impl ClockSequencer {
    /// Create a sequencer over one clock channel's register window.
    pub fn new(regs: Arc<dyn Registers>, delay: Arc<dyn Delay>) -> Self {
        Self { regs, delay }
    }

    /// Run the full sequence. On timeout the generator is left disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Timeout`] if the busy bit never clears.
    pub fn configure(&self, config: &ClockConfig) -> std::result::Result<(), ClockError> {
        // Stop the generator outright before touching the divisor.
        self.regs.write32(cm::CTL, cm::PASSWORD | cm::ctl::KILL);
        self.delay.sleep_ms(SETTLE_MS);

        let mut polls = 0;
        loop {
            let ctl = self.regs.read32(cm::CTL);
            if ctl & cm::ctl::BUSY == 0 {
                break;
            }
            tracing::debug!("waiting for clock busy bit: {ctl:#x}");
            self.delay.sleep_ms(SETTLE_MS);
            polls += 1;
            if polls == BUSY_POLL_LIMIT {
                tracing::warn!("clock busy bit stuck after {polls} polls");
                return Err(ClockError::Timeout { polls });
            }
        }
        self.delay.sleep_ms(SETTLE_MS);

        self.regs.write32(cm::DIV, cm::PASSWORD | config.divisor_word());
        self.delay.sleep_ms(SETTLE_MS);

        // Source and MASH first; the enable bit is raised separately once
        // the divider has taken the new configuration.
        self.regs.write32(cm::CTL, cm::PASSWORD | config.control_word());
        self.delay.sleep_ms(SETTLE_MS);

        let ctl = self.regs.read32(cm::CTL);
        self.regs.write32(cm::CTL, ctl | cm::PASSWORD | cm::ctl::ENAB);
        self.delay.sleep_ms(SETTLE_MS);

        // Diagnostic read-back only; the value is not consulted.
        let ctl = self.regs.read32(cm::CTL);
        tracing::debug!("clock generator enabled: {ctl:#x}");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{InstantDelay, SoftwareRegisters};
    use piwave_chip::soc;

    fn sequencer(regs: &Arc<SoftwareRegisters>) -> ClockSequencer {
        ClockSequencer::new(
            Arc::clone(regs) as Arc<dyn Registers>,
            Arc::new(InstantDelay::default()),
        )
    }

    #[test]
    fn divisor_for_pcm_and_pwm_rates() {
        let pcm = ClockConfig::for_frequency(
            ClockSource::PllD,
            soc::PLLD_HZ,
            5_000_000,
            MashStage::Integer,
        )
        .unwrap();
        assert_eq!(pcm.divisor_integer(), 100);
        assert_eq!(pcm.divisor_fraction(), 0);

        let pwm = ClockConfig::for_frequency(
            ClockSource::PllD,
            soc::PLLD_HZ,
            2_500_000,
            MashStage::Stage1,
        )
        .unwrap();
        assert_eq!(pwm.divisor_word(), 200 << 12);
    }

    #[test]
    fn divisor_bounds_are_enforced() {
        assert!(ClockConfig::new(0, 0, MashStage::Integer, ClockSource::PllD).is_err());
        assert!(ClockConfig::new(4096, 0, MashStage::Integer, ClockSource::PllD).is_err());
        assert!(ClockConfig::new(4095, 4096, MashStage::Integer, ClockSource::PllD).is_err());
        assert!(ClockConfig::new(4095, 4095, MashStage::Integer, ClockSource::PllD).is_ok());
    }

    #[test]
    fn configure_writes_in_hardware_order() {
        let regs = Arc::new(SoftwareRegisters::new());
        let config =
            ClockConfig::new(100, 0, MashStage::Integer, ClockSource::PllD).unwrap();
        sequencer(&regs).configure(&config).unwrap();

        let writes = regs.writes();
        assert_eq!(writes[0], (cm::CTL, cm::PASSWORD | cm::ctl::KILL));
        assert_eq!(writes[1], (cm::DIV, cm::PASSWORD | (100 << 12)));
        assert_eq!(
            writes[2],
            (cm::CTL, cm::PASSWORD | cm::ctl::src(6)),
            "enable must still be clear when source and MASH are set"
        );
        // Final write re-asserts the configuration with enable raised.
        let (offset, value) = writes[3];
        assert_eq!(offset, cm::CTL);
        assert_ne!(value & cm::ctl::ENAB, 0);
        assert_eq!(value & 0xFF00_0000, cm::PASSWORD);
    }

    #[test]
    fn stuck_busy_bit_times_out_without_enabling() {
        let regs = Arc::new(SoftwareRegisters::new());
        regs.force_bits(cm::CTL, cm::ctl::BUSY);
        let config =
            ClockConfig::new(100, 0, MashStage::Integer, ClockSource::PllD).unwrap();

        let err = sequencer(&regs).configure(&config).unwrap_err();
        assert_eq!(err, ClockError::Timeout { polls: BUSY_POLL_LIMIT });

        // Only the kill write happened; the enable bit was never raised.
        for (offset, value) in regs.writes() {
            if offset == cm::CTL {
                assert_eq!(value & cm::ctl::ENAB, 0);
            }
        }
    }

    #[test]
    fn timeout_sleeps_the_documented_interval() {
        let regs = Arc::new(SoftwareRegisters::new());
        regs.force_bits(cm::CTL, cm::ctl::BUSY);
        let delay = Arc::new(InstantDelay::default());
        let seq = ClockSequencer::new(Arc::clone(&regs) as Arc<dyn Registers>, delay.clone());
        let config =
            ClockConfig::new(100, 0, MashStage::Integer, ClockSource::PllD).unwrap();

        assert!(seq.configure(&config).is_err());
        // One settle sleep after kill plus one per failed poll.
        assert_eq!(delay.total_slept_ms(), SETTLE_MS * (1 + u64::from(BUSY_POLL_LIMIT)));
    }
}

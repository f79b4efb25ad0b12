//! Addressable LED strip on the PWM serialiser.
//!
//! Colour data leaves through the PWM FIFO as a 2.5 Mbit/s NRZ stream:
//! every colour bit is three output sub-bits, so the line carries 0.4 µs
//! pulses the pixels decode by pulse width. The frame buffer is encoded in
//! place by `set_pixel` and streamed by `show`; pixels that did not change
//! are never re-encoded.

use crate::buffer::{device_len, BufferLifecycle, BusAddress};
use crate::clock::{ClockConfig, ClockSequencer, ClockSource, Delay, MashStage};
use crate::dma::{SlaveConfig, TransferManager};
use crate::error::Result;
use crate::waveform;
use crate::PeripheralResources;
use piwave_chip::{pwm, soc};
use std::sync::Arc;

/// Sub-bit rate of the single-wire protocol: 0.4 µs per output bit.
const DEFAULT_BIT_HZ: u32 = 2_500_000;

/// Pause between the colour sweeps of [`PixelStrip::hardware_test`].
const TEST_HOLD_MS: u64 = 500;

/// Strip configuration, fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct StripConfig {
    /// Number of pixels on the strip.
    pub num_leds: usize,
    /// Clock-generator setup for the PWM clock channel.
    pub clock: ClockConfig,
    /// PWM FIFO register as the DMA engine must address it.
    pub fifo: BusAddress,
}

impl StripConfig {
    /// The Raspberry Pi configuration: PLLD ÷ 200 with one MASH stage for
    /// the 2.5 MHz sub-bit clock, FIFO on the fixed peripheral bus window.
    ///
    /// # Errors
    ///
    /// Propagates divisor validation (infallible for these constants).
    pub fn raspberry_pi(num_leds: usize) -> Result<Self> {
        Ok(Self {
            num_leds,
            clock: ClockConfig::for_frequency(
                ClockSource::PllD,
                soc::PLLD_HZ,
                DEFAULT_BIT_HZ,
                MashStage::Stage1,
            )?,
            fifo: BusAddress(soc::peripheral_bus_address(soc::PWM_BLOCK, pwm::FIF1)),
        })
    }
}

/// LED strip peripheral instance. Owns one frame buffer and one DMA
/// channel; a new `show` always preempts the previous one.
pub struct PixelStrip {
    pwm: Arc<dyn crate::mmio::Registers>,
    delay: Arc<dyn Delay>,
    lifecycle: BufferLifecycle,
    transfers: TransferManager,
    frame: Vec<u8>,
    num_leds: usize,
}

impl std::fmt::Debug for PixelStrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelStrip")
            .field("num_leds", &self.num_leds)
            .finish_non_exhaustive()
    }
}

impl PixelStrip {
    /// Bring up the PWM serialiser and clock generator, allocating the
    /// frame buffer for `config.num_leds` pixels.
    ///
    /// # Errors
    ///
    /// Clock bring-up failure is fatal: the peripheral is left disabled
    /// and the instance is not returned.
    pub fn init(resources: PeripheralResources, config: &StripConfig) -> Result<Self> {
        let PeripheralResources {
            registers,
            clock_registers,
            dma,
            memory,
            delay,
        } = resources;

        dma.configure(SlaveConfig { dst: config.fifo })?;

        let lifecycle = BufferLifecycle::new(memory);
        let transfers = TransferManager::new(dma, lifecycle.clone());
        let sequencer = ClockSequencer::new(clock_registers, Arc::clone(&delay));

        let strip = Self {
            pwm: registers,
            delay,
            lifecycle,
            transfers,
            frame: vec![0u8; waveform::frame_len(config.num_leds)],
            num_leds: config.num_leds,
        };
        strip.bring_up(&sequencer, config)?;
        tracing::info!("pixel strip initialised, {} leds", strip.num_leds);
        Ok(strip)
    }

    fn bring_up(&self, sequencer: &ClockSequencer, config: &StripConfig) -> Result<()> {
        // The serialiser consumes 32-bit FIFO words.
        self.pwm.write32(pwm::RNG1, 32);
        self.pwm.write32(pwm::DAT1, 0);

        self.pwm.write32(
            pwm::CTL,
            pwm::ctl::PWEN1
                | pwm::ctl::MODE1
                | pwm::ctl::USEF1
                | pwm::ctl::CLRF1
                | pwm::ctl::MSEN1,
        );

        self.pwm.write32(
            pwm::DMAC,
            pwm::dmac::ENAB | pwm::dmac::panic(4) | pwm::dmac::dreq(8),
        );

        sequencer.configure(&config.clock)?;
        Ok(())
    }

    /// Number of pixels on the strip.
    #[must_use]
    pub const fn num_leds(&self) -> usize {
        self.num_leds
    }

    /// Whether the most recent transfer ended in error. Such failures are
    /// retryable by re-issuing the show.
    #[must_use]
    pub fn last_transfer_failed(&self) -> bool {
        self.transfers.last_transfer_failed()
    }

    /// Encode one pixel into the frame buffer. An out-of-range index is a
    /// no-op: the strip accepts writes past the end silently, so callers
    /// that need strictness must check [`num_leds`](Self::num_leds) first.
    pub fn set_pixel(&mut self, index: usize, red: u8, green: u8, blue: u8) {
        if index >= self.num_leds {
            tracing::debug!("pixel {index} out of range ({} leds), ignored", self.num_leds);
            return;
        }
        waveform::encode_pixel(&mut self.frame, index, red, green, blue);
    }

    /// Set every pixel to the same colour.
    pub fn fill(&mut self, red: u8, green: u8, blue: u8) {
        for index in 0..self.num_leds {
            waveform::encode_pixel(&mut self.frame, index, red, green, blue);
        }
    }

    /// Stream the current frame to the strip. Preempts a show still in
    /// flight; the frame buffer itself stays untouched and reusable.
    ///
    /// # Errors
    ///
    /// Allocation and DMA failures are recoverable; the frame and the
    /// strip's last-shown state are unchanged and the caller may retry.
    pub fn show(&self) -> Result<()> {
        self.transfers.cancel_in_flight();
        let bus = self.lifecycle.acquire_for_device(&self.frame)?;
        self.transfers.start_transfer(bus, device_len(self.frame.len()))?;
        Ok(())
    }

    /// Sweep the whole strip through red, green, blue, then dark, one
    /// frame per colour.
    ///
    /// # Errors
    ///
    /// Propagates the first failed show.
    pub fn hardware_test(&mut self) -> Result<()> {
        for (red, green, blue) in [(255, 0, 0), (0, 255, 0), (0, 0, 255), (0, 0, 0)] {
            self.fill(red, green, blue);
            self.show()?;
            self.delay.sleep_ms(TEST_HOLD_MS);
        }
        Ok(())
    }

    /// Cancel any in-flight transfer and release resources.
    pub fn unload(self) {
        // Work happens in Drop.
    }
}

impl Drop for PixelStrip {
    fn drop(&mut self) {
        self.transfers.shutdown();
        tracing::info!("pixel strip unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClockError, PiwaveError};
    use crate::software::{InstantDelay, SoftwareDma, SoftwareRegisters};
    use piwave_chip::clockman as cm;

    fn software_strip(num_leds: usize) -> (PixelStrip, Arc<SoftwareDma>) {
        let engine = Arc::new(SoftwareDma::auto());
        let resources = PeripheralResources {
            registers: Arc::new(SoftwareRegisters::new()),
            clock_registers: Arc::new(SoftwareRegisters::new()),
            dma: Arc::clone(&engine) as Arc<dyn crate::dma::DmaChannel>,
            memory: Arc::clone(&engine) as Arc<dyn crate::buffer::DmaMemory>,
            delay: Arc::new(InstantDelay::default()),
        };
        let config = StripConfig::raspberry_pi(num_leds).unwrap();
        let strip = PixelStrip::init(resources, &config).unwrap();
        (strip, engine)
    }

    /// Undo the device word swap to recover the producer's byte order.
    fn unswap(wire: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; wire.len()];
        waveform::swap_words(wire, &mut out);
        out
    }

    #[test]
    fn show_streams_a_decodable_frame() {
        let (mut strip, engine) = software_strip(1);
        strip.set_pixel(0, 255, 0, 0);
        strip.show().unwrap();

        let records = engine.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len, device_len(waveform::frame_len(1)));
        assert_eq!(engine.configured_dst().unwrap().0, 0x7E20_C018);

        let frame = unswap(&records[0].wire_bytes);
        assert_eq!(waveform::decode_pixel(&frame[..9]), (255, 0, 0));
        // Reset tail holds the line low.
        assert!(frame[9..waveform::frame_len(1)].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_set_pixel_changes_nothing() {
        let (mut strip, engine) = software_strip(2);
        strip.set_pixel(0, 1, 2, 3);
        let before = strip.frame.clone();

        strip.set_pixel(2, 255, 255, 255);
        strip.set_pixel(usize::MAX, 255, 255, 255);
        assert_eq!(strip.frame, before);

        strip.show().unwrap();
        let frame = unswap(&engine.records()[0].wire_bytes);
        assert_eq!(waveform::decode_pixel(&frame[..9]), (1, 2, 3));
        assert_eq!(waveform::decode_pixel(&frame[9..18]), (0, 0, 0));
    }

    #[test]
    fn frame_survives_across_shows_without_reencoding() {
        let (mut strip, engine) = software_strip(1);
        strip.set_pixel(0, 10, 20, 30);
        strip.show().unwrap();
        strip.show().unwrap();

        let records = engine.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].wire_bytes, records[1].wire_bytes);
    }

    #[test]
    fn hardware_test_sweeps_four_frames() {
        let (mut strip, engine) = software_strip(3);
        strip.hardware_test().unwrap();

        let records = engine.records();
        assert_eq!(records.len(), 4);
        let last = unswap(&records[3].wire_bytes);
        for pixel in 0..3 {
            assert_eq!(
                waveform::decode_pixel(&last[pixel * 9..(pixel + 1) * 9]),
                (0, 0, 0)
            );
        }
    }

    #[test]
    fn stuck_clock_fails_init() {
        let engine = Arc::new(SoftwareDma::auto());
        let clock_regs = Arc::new(SoftwareRegisters::new());
        clock_regs.force_bits(cm::CTL, cm::ctl::BUSY);
        let resources = PeripheralResources {
            registers: Arc::new(SoftwareRegisters::new()),
            clock_registers: Arc::clone(&clock_regs) as Arc<dyn crate::mmio::Registers>,
            dma: Arc::clone(&engine) as Arc<dyn crate::dma::DmaChannel>,
            memory: Arc::clone(&engine) as Arc<dyn crate::buffer::DmaMemory>,
            delay: Arc::new(InstantDelay::default()),
        };
        let config = StripConfig::raspberry_pi(1).unwrap();
        let err = PixelStrip::init(resources, &config).unwrap_err();
        assert!(matches!(
            err,
            PiwaveError::Clock(ClockError::Timeout { polls: 100 })
        ));
    }
}

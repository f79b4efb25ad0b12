//! Piezo buzzer on the PCM block.
//!
//! The buzzer is driven by streaming a square-wave bitstream into the PCM
//! TX FIFO over DMA: the bit pattern *is* the electrical waveform. Bring-up
//! stops the PCM clock, sequences the clock generator, programs frame
//! pacing and DMA thresholds, then enables transmission.

use crate::buffer::{device_len, BufferLifecycle, BusAddress};
use crate::clock::{ClockConfig, ClockSequencer, ClockSource, Delay, MashStage, SETTLE_MS};
use crate::dma::{SlaveConfig, TransferManager};
use crate::error::{PiwaveError, Result};
use crate::waveform;
use crate::PeripheralResources;
use piwave_chip::{pcm, soc};
use std::sync::Arc;

/// Waveform bit rate the PCM block achieves with the default clock and
/// frame configuration. Measured on hardware; the generator runs at 5 MHz
/// but frame pacing brings the effective rate down to this value.
pub const DEFAULT_PCM_HZ: u32 = 125_000;

/// PCM generator target frequency for the default configuration.
const DEFAULT_CLOCK_HZ: u32 = 5_000_000;

/// Buzzer peripheral configuration, fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct BuzzerConfig {
    /// Clock-generator setup for the PCM clock channel.
    pub clock: ClockConfig,
    /// Effective waveform bit rate; drives all tone timing math.
    pub pcm_hz: u32,
    /// PCM TX FIFO register as the DMA engine must address it.
    pub fifo: BusAddress,
}

impl BuzzerConfig {
    /// The Raspberry Pi configuration: PLLD ÷ 100, 125 kbit/s waveform
    /// rate, FIFO on the fixed peripheral bus window.
    ///
    /// # Errors
    ///
    /// Propagates divisor validation (infallible for these constants).
    pub fn raspberry_pi() -> Result<Self> {
        Ok(Self {
            clock: ClockConfig::for_frequency(
                ClockSource::PllD,
                soc::PLLD_HZ,
                DEFAULT_CLOCK_HZ,
                MashStage::Integer,
            )?,
            pcm_hz: DEFAULT_PCM_HZ,
            fifo: BusAddress(soc::peripheral_bus_address(soc::PCM_BLOCK, pcm::FIFO_A)),
        })
    }
}

/// One note of a [`Melody`]: a tone request plus how long to hold before
/// the next note. A zero frequency is a rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    /// Tone frequency; zero rests instead of playing.
    pub frequency_hz: u32,
    /// Tone period passed to the encoder.
    pub period_ms: u32,
    /// Time to hold before the next note starts.
    pub hold_ms: u64,
}

const fn note(frequency_hz: u32, period_ms: u32, hold_ms: u64) -> Note {
    Note {
        frequency_hz,
        period_ms,
        hold_ms,
    }
}

/// A fixed sequence of notes played back-to-back. Each note preempts the
/// previous one's transfer, so the hold time paces the melody.
#[derive(Debug, Clone)]
pub struct Melody {
    notes: Vec<Note>,
}

impl Melody {
    /// A melody from explicit notes.
    #[must_use]
    pub fn new(notes: Vec<Note>) -> Self {
        Self { notes }
    }

    /// The notes, in playback order.
    #[must_use]
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// The access-denied jingle: C4/D4/E4/F4 phrases with repeated
    /// quarter-note endings.
    #[must_use]
    pub fn error() -> Self {
        Self::new(vec![
            note(261, 600, 600),
            note(294, 600, 600),
            note(329, 600, 600),
            note(349, 600, 600),
            note(349, 400, 500),
            note(349, 400, 500),
            note(261, 600, 600),
            note(294, 600, 600),
            note(261, 600, 600),
            note(294, 600, 600),
            note(294, 400, 500),
            note(294, 400, 500),
            note(261, 600, 600),
            note(392, 600, 600),
            note(349, 600, 600),
            note(329, 600, 600),
            note(329, 400, 500),
            note(329, 400, 500),
            note(261, 600, 600),
            note(294, 600, 600),
            note(329, 600, 600),
            note(349, 600, 600),
            note(349, 400, 500),
            note(349, 400, 500),
        ])
    }
}

/// Buzzer peripheral instance. Owns one DMA channel and one in-flight
/// waveform; a new tone always preempts the previous one.
pub struct Buzzer {
    pcm: Arc<dyn crate::mmio::Registers>,
    delay: Arc<dyn Delay>,
    lifecycle: BufferLifecycle,
    transfers: TransferManager,
    pcm_hz: u32,
}

impl Buzzer {
    /// Bring up the PCM block and clock generator.
    ///
    /// # Errors
    ///
    /// Clock bring-up failure ([`crate::error::ClockError`]) is fatal: the
    /// peripheral is left disabled and the instance is not returned.
    pub fn init(resources: PeripheralResources, config: &BuzzerConfig) -> Result<Self> {
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

        let buzzer = Self {
            pcm: registers,
            delay,
            lifecycle,
            transfers,
            pcm_hz: config.pcm_hz,
        };
        buzzer.bring_up(&sequencer, config)?;
        tracing::info!("buzzer initialised at {} bit/s", buzzer.pcm_hz);
        Ok(buzzer)
    }

    fn bring_up(&self, sequencer: &ClockSequencer, config: &BuzzerConfig) -> Result<()> {
        // Stop the PCM clock before the generator is reprogrammed.
        let mode = self.pcm.read32(pcm::MODE_A);
        self.pcm.write32(pcm::MODE_A, mode | pcm::mode::CLK_DIS);
        self.delay.sleep_ms(SETTLE_MS);

        sequencer.configure(&config.clock)?;

        // A frame is roughly one millisecond of buzzer audio.
        self.pcm
            .write32(pcm::MODE_A, pcm::mode::flen(127) | pcm::mode::fslen(127));
        self.delay.sleep_ms(SETTLE_MS);

        self.pcm.write32(pcm::RXC_A, 0);
        self.delay.sleep_ms(SETTLE_MS);

        self.pcm.write32(pcm::TXC_A, pcm::txc::CH1EN);
        self.delay.sleep_ms(SETTLE_MS);

        self.pcm
            .write32(pcm::DREQ_A, pcm::dreq::tx_panic(10) | pcm::dreq::tx(63));
        self.delay.sleep_ms(SETTLE_MS);

        self.pcm.write32(pcm::INTEN_A, 0);
        self.delay.sleep_ms(SETTLE_MS);

        self.pcm.write32(
            pcm::CS_A,
            pcm::cs::STBY
                | pcm::cs::DMAEN
                | pcm::cs::RXCLR
                | pcm::cs::TXCLR
                | pcm::cs::TXON
                | pcm::cs::EN,
        );
        self.delay.sleep_ms(SETTLE_MS);
        Ok(())
    }

    /// Encode and stream a square wave of `frequency_hz` for `period_ms`.
    /// Preempts any tone still playing.
    ///
    /// # Errors
    ///
    /// [`PiwaveError::InvalidFrequency`] for a zero frequency; allocation
    /// and DMA failures are recoverable and leave the last-good state.
    pub fn play_tone(&self, frequency_hz: u32, period_ms: u32) -> Result<()> {
        if frequency_hz == 0 {
            return Err(PiwaveError::InvalidFrequency);
        }
        let wave = waveform::encode_tone(self.pcm_hz, frequency_hz, period_ms);
        tracing::debug!(
            "tone {frequency_hz} Hz for {period_ms} ms: {} bytes, {}-byte half cycle",
            wave.len(),
            waveform::tone_half_cycle_bytes(self.pcm_hz, frequency_hz)
        );

        self.transfers.cancel_in_flight();
        let bus = self.lifecycle.acquire_for_device(&wave)?;
        self.transfers.start_transfer(bus, device_len(wave.len()))?;
        Ok(())
    }

    /// Play a melody, pacing notes with the hold time of each.
    ///
    /// # Errors
    ///
    /// Propagates the first failed tone request.
    pub fn play_melody(&self, melody: &Melody) -> Result<()> {
        for step in melody.notes() {
            if step.frequency_hz > 0 {
                self.play_tone(step.frequency_hz, step.period_ms)?;
            }
            self.delay.sleep_ms(step.hold_ms);
        }
        Ok(())
    }

    /// Effective waveform bit rate.
    #[must_use]
    pub const fn pcm_hz(&self) -> u32 {
        self.pcm_hz
    }

    /// Whether the most recent transfer ended in error. Such failures are
    /// retryable by re-issuing the request.
    #[must_use]
    pub fn last_transfer_failed(&self) -> bool {
        self.transfers.last_transfer_failed()
    }

    /// Cancel any in-flight transfer and release resources.
    pub fn unload(self) {
        // Work happens in Drop.
    }
}

impl Drop for Buzzer {
    fn drop(&mut self) {
        self.transfers.shutdown();
        tracing::info!("buzzer unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{InstantDelay, SoftwareDma, SoftwareRegisters};

    fn software_buzzer() -> (Buzzer, Arc<SoftwareDma>, Arc<SoftwareRegisters>) {
        let engine = Arc::new(SoftwareDma::auto());
        let pcm_regs = Arc::new(SoftwareRegisters::new());
        let resources = PeripheralResources {
            registers: Arc::clone(&pcm_regs) as Arc<dyn crate::mmio::Registers>,
            clock_registers: Arc::new(SoftwareRegisters::new()),
            dma: Arc::clone(&engine) as Arc<dyn crate::dma::DmaChannel>,
            memory: Arc::clone(&engine) as Arc<dyn crate::buffer::DmaMemory>,
            delay: Arc::new(InstantDelay::default()),
        };
        let config = BuzzerConfig::raspberry_pi().unwrap();
        let buzzer = Buzzer::init(resources, &config).unwrap();
        (buzzer, engine, pcm_regs)
    }

    #[test]
    fn bring_up_ends_with_the_enable_word() {
        let (_buzzer, engine, pcm_regs) = software_buzzer();
        let writes = pcm_regs.writes();
        // Clock disable first, CS enable last.
        assert_eq!(writes[0].0, pcm::MODE_A);
        assert_ne!(writes[0].1 & pcm::mode::CLK_DIS, 0);
        let (offset, value) = *writes.last().unwrap();
        assert_eq!(offset, pcm::CS_A);
        assert_ne!(value & pcm::cs::EN, 0);
        assert_ne!(value & pcm::cs::DMAEN, 0);
        // The channel aims at the PCM FIFO bus address.
        assert_eq!(
            engine.configured_dst().unwrap().0,
            0x7E20_3004
        );
    }

    #[test]
    fn zero_frequency_is_rejected() {
        let (buzzer, engine, _) = software_buzzer();
        assert!(matches!(
            buzzer.play_tone(0, 100),
            Err(PiwaveError::InvalidFrequency)
        ));
        assert!(engine.records().is_empty());
    }

    #[test]
    fn tone_scenario_streams_the_expected_length() {
        let (buzzer, engine, _) = software_buzzer();
        buzzer.play_tone(440, 500).unwrap();

        let records = engine.records();
        assert_eq!(records.len(), 1);
        // 78125 waveform bytes padded to the DMA word size.
        assert_eq!(records[0].len, 78_128);
        assert_eq!(records[0].wire_bytes.len(), 78_128);
        assert_eq!(records[0].outcome, Some(crate::dma::DmaStatus::Complete));
    }

    #[test]
    fn melody_plays_each_note_and_rests() {
        let (buzzer, engine, _) = software_buzzer();
        let melody = Melody::new(vec![
            note(440, 100, 100),
            note(0, 0, 50),
            note(880, 100, 100),
        ]);
        buzzer.play_melody(&melody).unwrap();
        assert_eq!(engine.records().len(), 2);
    }

    #[test]
    fn error_jingle_matches_the_access_denied_sequence() {
        let melody = Melody::error();
        assert_eq!(melody.notes().len(), 24);
        assert_eq!(melody.notes()[0], note(261, 600, 600));
        assert_eq!(melody.notes()[13], note(392, 600, 600));
    }
}

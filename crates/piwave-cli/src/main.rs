//! `piwave` — command-line harness for the waveform-streaming engine.
//!
//! ```text
//! USAGE:
//!   piwave info [--registers]        Discover the SoC map, dump registers
//!   piwave tone <freq-hz> <ms>       Encode and stream a tone
//!   piwave fill <r> <g> <b>          Fill the strip and show it
//!   piwave test                      Red/green/blue/dark sweep
//!   piwave jingle                    Play the access-denied jingle
//! ```
//!
//! The waveform commands drive the full engine — bring-up, encoding,
//! buffer hand-off, transfer management — against the in-process software
//! DMA engine and report what would have gone out on the wire. On-target
//! streaming additionally needs a platform DMA provider implementing
//! `DmaChannel`/`DmaMemory`. `info` touches the real hardware: it reads
//! the device tree and, with `--registers`, maps and dumps the PCM, PWM,
//! and clock-manager windows.

use anyhow::Result;
use clap::{Parser, Subcommand};
use piwave_driver::prelude::*;
use piwave_driver::software::{InstantDelay, SoftwareDma, SoftwareRegisters};
use piwave_driver::{discovery, MappedRegion, Registers, Subregion};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "piwave",
    about = "Raspberry Pi buzzer / pixel-strip waveform engine",
    version = piwave_driver::VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Discover the SoC peripheral windows.
    Info {
        /// Also map the windows and dump the live register values (root).
        #[arg(long)]
        registers: bool,
    },
    /// Encode a tone and stream it through the engine.
    Tone {
        /// Tone frequency in hertz.
        frequency_hz: u32,
        /// Tone period in milliseconds.
        period_ms: u32,
    },
    /// Fill the strip with one colour and show it.
    Fill {
        /// Red channel.
        red: u8,
        /// Green channel.
        green: u8,
        /// Blue channel.
        blue: u8,
        /// Number of pixels on the strip.
        #[arg(long, default_value_t = 8)]
        leds: usize,
    },
    /// Sweep the strip red, green, blue, then dark.
    Test {
        /// Number of pixels on the strip.
        #[arg(long, default_value_t = 8)]
        leds: usize,
    },
    /// Play the access-denied jingle.
    Jingle,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Info { registers } => cmd_info(registers)?,
        Cmd::Tone {
            frequency_hz,
            period_ms,
        } => cmd_tone(frequency_hz, period_ms)?,
        Cmd::Fill {
            red,
            green,
            blue,
            leds,
        } => cmd_fill(red, green, blue, leds)?,
        Cmd::Test { leds } => cmd_test(leds)?,
        Cmd::Jingle => cmd_jingle()?,
    }
    Ok(())
}

fn software_resources(engine: &Arc<SoftwareDma>) -> PeripheralResources {
    PeripheralResources {
        registers: Arc::new(SoftwareRegisters::new()),
        clock_registers: Arc::new(SoftwareRegisters::new()),
        dma: Arc::clone(engine) as _,
        memory: Arc::clone(engine) as _,
        delay: Arc::new(InstantDelay::default()),
    }
}

fn cmd_info(registers: bool) -> Result<()> {
    let map = SocMap::discover()?;
    println!("peripheral window  {:#010x}", map.peripheral_base);
    println!("pcm block          {:#010x}", map.pcm_block());
    println!("pwm block          {:#010x}", map.pwm_block());
    println!("clock manager      {:#010x}", map.clock_block());

    if registers {
        dump_registers(&map)?;
    }
    Ok(())
}

fn dump_registers(map: &SocMap) -> Result<()> {
    use piwave_chip::{clockman as cm, pcm, pwm, soc};

    let mem = discovery::open_devmem()?;
    let pcm_regs = MappedRegion::map(&mem, map.pcm_block(), 0x100)?;
    let pwm_regs = MappedRegion::map(&mem, map.pwm_block(), 0x100)?;
    let cm_regs: Arc<dyn Registers> =
        Arc::new(MappedRegion::map(&mem, map.clock_block(), 0x1000)?);
    let pcm_clock = Subregion::new(Arc::clone(&cm_regs), soc::CM_PCM_CHANNEL as usize);
    let pwm_clock = Subregion::new(cm_regs, soc::CM_PWM_CHANNEL as usize);

    println!();
    println!("PCM  CS   {:#010x}", pcm_regs.read32(pcm::CS_A));
    println!("PCM  MODE {:#010x}", pcm_regs.read32(pcm::MODE_A));
    println!("PCM  DREQ {:#010x}", pcm_regs.read32(pcm::DREQ_A));
    println!("PWM  CTL  {:#010x}", pwm_regs.read32(pwm::CTL));
    println!("PWM  DMAC {:#010x}", pwm_regs.read32(pwm::DMAC));
    println!("CM   PCM  ctl {:#010x} div {:#010x}",
        pcm_clock.read32(cm::CTL),
        pcm_clock.read32(cm::DIV));
    println!("CM   PWM  ctl {:#010x} div {:#010x}",
        pwm_clock.read32(cm::CTL),
        pwm_clock.read32(cm::DIV));
    Ok(())
}

fn cmd_tone(frequency_hz: u32, period_ms: u32) -> Result<()> {
    let engine = Arc::new(SoftwareDma::auto());
    let buzzer = Buzzer::init(software_resources(&engine), &BuzzerConfig::raspberry_pi()?)?;
    buzzer.play_tone(frequency_hz, period_ms)?;

    let record = &engine.records()[0];
    println!(
        "streamed {} waveform bytes ({frequency_hz} Hz for {period_ms} ms at {} bit/s)",
        record.len,
        buzzer.pcm_hz()
    );
    Ok(())
}

fn cmd_fill(red: u8, green: u8, blue: u8, leds: usize) -> Result<()> {
    let engine = Arc::new(SoftwareDma::auto());
    let mut strip = PixelStrip::init(
        software_resources(&engine),
        &StripConfig::raspberry_pi(leds)?,
    )?;
    strip.fill(red, green, blue);
    strip.show()?;

    let record = &engine.records()[0];
    println!(
        "streamed a {} byte frame: {leds} pixels of #{red:02x}{green:02x}{blue:02x}",
        record.len
    );
    Ok(())
}

fn cmd_test(leds: usize) -> Result<()> {
    let engine = Arc::new(SoftwareDma::auto());
    let mut strip = PixelStrip::init(
        software_resources(&engine),
        &StripConfig::raspberry_pi(leds)?,
    )?;
    strip.hardware_test()?;
    println!("swept {} frames over {leds} pixels", engine.records().len());
    Ok(())
}

fn cmd_jingle() -> Result<()> {
    let engine = Arc::new(SoftwareDma::auto());
    let buzzer = Buzzer::init(software_resources(&engine), &BuzzerConfig::raspberry_pi()?)?;
    let melody = Melody::error();
    buzzer.play_melody(&melody)?;
    println!(
        "played {} notes, {} transfers issued",
        melody.notes().len(),
        engine.records().len()
    );
    Ok(())
}

//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::controller::PixelFormat;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// 8-bit unsigned samples
    Ru8,
    /// 16-bit unsigned little-endian samples
    Ru16le,
}

impl From<Format> for PixelFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Ru8 => PixelFormat::Ru8,
            Format::Ru16le => PixelFormat::Ru16Le,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Number of bytes to capture
    #[clap(short, long, default_value_t = 16 * 1024 * 1024)]
    pub bytes: u64,
    /// Sample format
    #[clap(short, long, value_enum, default_value = "ru8")]
    pub format: Format,
    /// Requested sample rate in Hz, rounded to the nearest band
    #[clap(long)]
    pub frequency: Option<u32>,
    /// ADC gain
    #[clap(short, long, default_value_t = 0)]
    #[clap(value_parser = clap::value_parser!(u32).range(0..=31))]
    pub gain: u32,
    /// Analog input
    #[clap(short, long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u32).range(0..=3))]
    pub input: u32,
    /// PCI latency timer, clamped to 32..=248
    #[clap(short, long, default_value_t = 248)]
    pub latency: i32,
    /// Ring buffer capacity in MiB
    #[clap(short, long, default_value_t = 64)]
    pub capacity: usize,
    /// Output file, defaults to a timestamped name in the working directory
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Poll the ring instead of sleeping on interrupts
    #[clap(long)]
    pub non_blocking: bool,
    /// Print the registers of a mapped BAR 0 (e.g. a sysfs resource0 file) and exit
    #[clap(long, value_name = "RESOURCE")]
    pub dump_registers: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

//! Capture controller: sample format, sample rate band, gain and input.
//!
//! Pure register programming. Two formats times three bands gives six fixed
//! operating points; nothing is interpolated.

use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
    error::{Error, Result},
    regs::{self, RegisterWindow},
    XTAL_FREQ,
};

pub const GAIN_MAX: u32 = 31;
pub const INPUT_MAX: u32 = 3;

/// Names shown in the input selector menu
pub const INPUT_NAMES: [&str; 4] = ["Input 1", "Input 2", "Input 3", "Input 4"];

/// Tuner type reported for the ADC "tuner"
pub const TUNER_SDR: u32 = 4;
pub const TUNER_CAP_FREQ_BANDS: u32 = 0x0400;
pub const TUNER_CAP_1HZ: u32 = 0x1000;

pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

/// Raw samples as they come off the ADC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One unsigned byte per sample
    Ru8,
    /// Two bytes per sample, little-endian
    Ru16Le,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 2] = [PixelFormat::Ru8, PixelFormat::Ru16Le];

    pub fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Ru8 => fourcc(b'C', b'U', b'0', b'8'),
            PixelFormat::Ru16Le => fourcc(b'C', b'U', b'1', b'6'),
        }
    }

    pub fn from_fourcc(code: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.fourcc() == code)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pixel format {:#010x}", code)))
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::Ru8 => 1,
            PixelFormat::Ru16Le => 2,
        }
    }

    fn capture_ctrl(self) -> u32 {
        match self {
            PixelFormat::Ru8 => (1 << 6) | (3 << 1),
            PixelFormat::Ru16Le => (1 << 6) | (1 << 5) | (3 << 1),
        }
    }

    /// The three bands available in this format
    pub fn bands(self) -> [FrequencyBand; 3] {
        let (lo, mid, hi) = match self {
            PixelFormat::Ru8 => (XTAL_FREQ / 2, XTAL_FREQ, XTAL_FREQ * 5 / 4),
            PixelFormat::Ru16Le => (XTAL_FREQ / 4, XTAL_FREQ / 2, XTAL_FREQ * 5 / 8),
        };
        [
            FrequencyBand::fixed(0, lo),
            FrequencyBand::fixed(1, mid),
            FrequencyBand::fixed(2, hi),
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Ru8 => write!(f, "RU8"),
            PixelFormat::Ru16Le => write!(f, "RU16LE"),
        }
    }
}

/// Sample rate operating point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Band0,
    Band1,
    Band2,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Band0, Band::Band1, Band::Band2];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u32) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("no frequency band {}", index)))
    }

    /// (sample rate converter, PLL) register pair
    fn registers(self) -> (u32, u32) {
        match self {
            // Freq / 2, PLL Freq / 5 / 8 * 20
            Band::Band0 => ((1 << 17) * 2, (1 << 26) | (0x14 << 20)),
            // Freq, PLL Freq / 2 / 8 * 16
            Band::Band1 => (1 << 17, 0x10 << 20),
            // Freq * 5 / 4, PLL Freq / 2 / 8 * 20
            Band::Band2 => ((1 << 17) * 4 / 5, 0x14 << 20),
        }
    }
}

/// One fixed frequency band, as enumerated to the control framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyBand {
    pub tuner: u32,
    pub tuner_type: u32,
    pub index: u32,
    pub capability: u32,
    pub range_low: u32,
    pub range_high: u32,
}

impl FrequencyBand {
    const fn fixed(index: u32, freq: u32) -> Self {
        Self {
            tuner: 0,
            tuner_type: TUNER_SDR,
            index,
            capability: TUNER_CAP_1HZ | TUNER_CAP_FREQ_BANDS,
            range_low: freq,
            range_high: freq,
        }
    }
}

/// Configuration that outlives capture sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub pixel_format: PixelFormat,
    pub band: Band,
    pub gain: u32,
    pub input: u32,
    /// Reported buffer size field, always 1
    pub buffer_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Ru8,
            band: Band::Band1,
            gain: 0,
            input: 1,
            buffer_size: 1,
        }
    }
}

impl DeviceConfig {
    /// Current sample rate in Hz
    pub fn frequency(&self) -> u32 {
        self.pixel_format.bands()[self.band.index()].range_low
    }
}

pub struct CaptureController {
    regs: Arc<dyn RegisterWindow>,
    config: DeviceConfig,
}

impl CaptureController {
    pub fn new(regs: Arc<dyn RegisterWindow>, config: DeviceConfig) -> Self {
        Self { regs, config }
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    /// Stop the RISC engine, DMA, interrupts and capture
    pub fn shutdown(&self) {
        let r = &self.regs;
        r.write32(regs::MO_DEV_CNTRL2, 0);
        r.write32(regs::MO_VID_DMACNTRL, 0);
        r.write32(regs::MO_PCI_INTMSK, 0);
        r.write32(regs::MO_VID_INTMSK, 0);
        r.write32(regs::MO_CAPTURE_CTRL, 0);
        r.write32(regs::MO_VID_INTSTAT, !0);
    }

    /// Raw ADC output setup, then start the RISC engine and VBI DMA
    pub fn adc_setup(&self, cluster_size: u32) {
        let r = &self.regs;
        r.write32(regs::MO_VID_INTSTAT, r.read32(regs::MO_VID_INTSTAT));

        r.write32(regs::MO_OUTPUT_FORMAT, 0xf);
        r.write32(regs::MO_CONTR_BRIGHT, 0xff00);
        r.write32(regs::MO_COLOR_CTRL, (0xe << 4) | 0xe);
        r.write32(regs::MO_VBI_PACKET, (cluster_size << 17) | (2 << 11));

        // Power down audio and chroma DAC+ADC
        r.write32(regs::MO_AFECFG_IO, 0x12);

        r.write32(regs::MO_DEV_CNTRL2, 1 << 5);
        r.write32(regs::MO_VID_DMACNTRL, (1 << 7) | (1 << 3));
    }

    pub fn agc_setup(&self) {
        let r = &self.regs;
        r.write32(regs::MO_AGC_BACK_VBI, (1 << 25) | (0x100 << 16) | 0xfff);
        r.write32(regs::MO_AGC_SYNC_SLICER, 0x0);
        r.write32(regs::MO_AGC_SYNC_TIP2, (0x20 << 17) | 0xf);
        r.write32(regs::MO_AGC_SYNC_TIP3, (0x1e48 << 16) | (0xff << 8) | 0x8);
        r.write32(regs::MO_AGC_GAIN_ADJ2, (0x20 << 17) | 0xf);
        r.write32(regs::MO_AGC_GAIN_ADJ3, (0x28 << 16) | (0x28 << 8) | 0x50);
        self.write_gain();
    }

    pub fn enable_video_interrupts(&self) {
        self.regs.write32(regs::MO_VID_INTMSK, regs::INTERRUPT_MASK);
    }

    /// Program capture control, sample rate converter and PLL from the
    /// current format and band
    pub fn apply(&self) {
        let r = &self.regs;
        r.write32(regs::MO_CAPTURE_CTRL, self.config.pixel_format.capture_ctrl());
        let (sconv, pll) = self.config.band.registers();
        r.write32(regs::MO_SCONV_REG, sconv);
        r.write32(regs::MO_PLL_REG, pll);
        debug!(
            "ADC {} band {} ({} Hz)",
            self.config.pixel_format,
            self.config.band.index(),
            self.config.frequency()
        );
    }

    pub fn apply_format(&mut self, format: PixelFormat) {
        self.config.pixel_format = format;
        self.apply();
    }

    /// Set the format by fourcc; unknown codes fall back to 8-bit samples
    pub fn set_format_fourcc(&mut self, code: u32) -> PixelFormat {
        let format = PixelFormat::from_fourcc(code).unwrap_or(PixelFormat::Ru8);
        self.apply_format(format);
        format
    }

    pub fn apply_band(&mut self, band: Band) {
        self.config.band = band;
        self.apply();
    }

    /// Move to the band nearest `hz`. Always lands on one of the three bands.
    pub fn set_frequency(&mut self, hz: u32) -> Band {
        let bands = self.config.pixel_format.bands();
        let current = self.config.band;
        if current != Band::Band0 && hz < bands[1].range_low {
            self.config.band = Band::Band0;
        } else if current != Band::Band1
            && hz > bands[0].range_high
            && hz < bands[2].range_low
        {
            self.config.band = Band::Band1;
        } else if current != Band::Band2 && hz > bands[1].range_high {
            self.config.band = Band::Band2;
        }
        self.apply();
        self.config.band
    }

    pub fn set_gain(&mut self, gain: u32) -> Result<()> {
        if gain > GAIN_MAX {
            return Err(Error::InvalidArgument(format!(
                "gain {} outside of 0..={}",
                gain, GAIN_MAX
            )));
        }
        self.config.gain = gain;
        self.write_gain();
        Ok(())
    }

    fn write_gain(&self) {
        self.regs.write32(
            regs::MO_AGC_GAIN_ADJ4,
            (1 << 23) | (self.config.gain << 16) | (0xff << 8),
        );
    }

    pub fn set_input(&mut self, input: u32) -> Result<()> {
        if input > INPUT_MAX {
            return Err(Error::InvalidArgument(format!(
                "input {} outside of 0..={}",
                input, INPUT_MAX
            )));
        }
        self.config.input = input;
        self.write_input();
        Ok(())
    }

    pub fn write_input(&self) {
        self.regs.write32(
            regs::MO_INPUT_FORMAT,
            (1 << 16) | (self.config.input << 14) | (1 << 13) | (1 << 4) | 0x1,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    fn controller() -> (Arc<SimRegisters>, CaptureController) {
        let regs = Arc::new(SimRegisters::new());
        let ctl = CaptureController::new(regs.clone(), DeviceConfig::default());
        (regs, ctl)
    }

    #[test]
    fn test_band_tables() {
        let b = PixelFormat::Ru8.bands();
        assert_eq!(b[0].range_low, 14_318_181);
        assert_eq!(b[1].range_low, 28_636_363);
        assert_eq!(b[2].range_low, 35_795_453);
        let b = PixelFormat::Ru16Le.bands();
        assert_eq!(b[0].range_low, 7_159_090);
        assert_eq!(b[1].range_low, 14_318_181);
        assert_eq!(b[2].range_high, 17_897_726);
    }

    #[test]
    fn test_operating_points() {
        let (regs, mut ctl) = controller();
        ctl.apply_format(PixelFormat::Ru16Le);
        assert_eq!(regs.read32(regs::MO_CAPTURE_CTRL), 0x66);
        ctl.apply_band(Band::Band0);
        assert_eq!(regs.read32(regs::MO_SCONV_REG), 0x40000);
        assert_eq!(regs.read32(regs::MO_PLL_REG), 0x0540_0000);
        ctl.apply_band(Band::Band2);
        assert_eq!(regs.read32(regs::MO_SCONV_REG), 0x19999);
        assert_eq!(regs.read32(regs::MO_PLL_REG), 0x0140_0000);
        ctl.apply_format(PixelFormat::Ru8);
        assert_eq!(regs.read32(regs::MO_CAPTURE_CTRL), 0x46);
        ctl.apply_band(Band::Band1);
        assert_eq!(regs.read32(regs::MO_SCONV_REG), 0x20000);
        assert_eq!(regs.read32(regs::MO_PLL_REG), 0x0100_0000);
    }

    #[test]
    fn test_band_selection_ru8() {
        let (_, mut ctl) = controller();
        assert_eq!(ctl.set_frequency(28_636_362), Band::Band0);
        assert_eq!(ctl.set_frequency(14_318_181), Band::Band0);
        assert_eq!(ctl.set_frequency(28_636_363), Band::Band1);
        assert_eq!(ctl.set_frequency(28_636_364), Band::Band2);
        assert_eq!(ctl.set_frequency(35_795_452), Band::Band1);
        assert_eq!(ctl.set_frequency(u32::MAX), Band::Band2);
        assert_eq!(ctl.set_frequency(0), Band::Band0);
        // The exact centre of Band1 leaves Band1 selected
        ctl.apply_band(Band::Band1);
        assert_eq!(ctl.set_frequency(28_636_363), Band::Band1);
    }

    #[test]
    fn test_band_selection_ru16() {
        let (_, mut ctl) = controller();
        ctl.apply_format(PixelFormat::Ru16Le);
        assert_eq!(ctl.set_frequency(7_159_090), Band::Band0);
        assert_eq!(ctl.set_frequency(14_318_181), Band::Band1);
        assert_eq!(ctl.set_frequency(17_897_726), Band::Band2);
        assert_eq!(ctl.config().frequency(), 17_897_726);
    }

    #[test]
    fn test_format_fallback() {
        let (regs, mut ctl) = controller();
        ctl.apply_format(PixelFormat::Ru16Le);
        assert_eq!(ctl.set_format_fourcc(0xdead_beef), PixelFormat::Ru8);
        assert_eq!(regs.read32(regs::MO_CAPTURE_CTRL), 0x46);
        assert!(PixelFormat::from_fourcc(0xdead_beef).is_err());
        assert_eq!(
            PixelFormat::from_fourcc(fourcc(b'C', b'U', b'1', b'6')).unwrap(),
            PixelFormat::Ru16Le
        );
    }

    #[test]
    fn test_gain_and_input() {
        let (regs, mut ctl) = controller();
        ctl.set_gain(31).unwrap();
        assert_eq!(regs.read32(regs::MO_AGC_GAIN_ADJ4), 0x009f_ff00);
        assert!(matches!(ctl.set_gain(32), Err(Error::InvalidArgument(_))));
        assert_eq!(ctl.config().gain, 31);
        ctl.set_input(2).unwrap();
        assert_eq!(regs.read32(regs::MO_INPUT_FORMAT), 0x0001_a011);
        assert!(ctl.set_input(4).is_err());
        assert_eq!(ctl.config().input, 2);
    }

    #[test]
    fn test_shutdown_clears_status() {
        let (regs, ctl) = controller();
        ctl.adc_setup(2048);
        assert_eq!(regs.read32(regs::MO_VBI_PACKET), (2048 << 17) | (2 << 11));
        assert_eq!(regs.read32(regs::MO_DEV_CNTRL2), 0x20);
        ctl.enable_video_interrupts();
        ctl.shutdown();
        assert_eq!(regs.read32(regs::MO_DEV_CNTRL2), 0);
        assert_eq!(regs.read32(regs::MO_VID_INTMSK), 0);
        assert_eq!(regs.read32(regs::MO_VID_DMACNTRL), 0);
    }
}

//! The control surface a capture application sees: capability query,
//! format negotiation, the ADC "tuner", gain and input selection.

use tracing::info;

use crate::{
    controller::{
        Band, FrequencyBand, PixelFormat, INPUT_MAX, INPUT_NAMES, TUNER_CAP_1HZ,
        TUNER_CAP_FREQ_BANDS, TUNER_SDR,
    },
    device::Device,
    error::{Error, Result},
    DRV_NAME, MODULE_NAME,
};

pub const CAP_TUNER: u32 = 0x0001_0000;
pub const CAP_SDR_CAPTURE: u32 = 0x0010_0000;
pub const CAP_READWRITE: u32 = 0x0100_0000;

pub const TUNER_NAME: &str = "ADC: CX2388x SDR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub device_caps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDesc {
    pub index: u32,
    pub pixel_format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdrFormat {
    pub pixel_format: u32,
    pub buffer_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuner {
    pub index: u32,
    pub name: String,
    pub tuner_type: u32,
    pub capability: u32,
    pub range_low: u32,
    pub range_high: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    pub tuner: u32,
    pub tuner_type: u32,
    pub frequency: u32,
}

/// One entry of the input selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuItem {
    pub index: u32,
    pub name: &'static str,
}

fn check_tuner(tuner: u32) -> Result<()> {
    if tuner > 0 {
        return Err(Error::InvalidArgument(format!("no tuner {}", tuner)));
    }
    Ok(())
}

impl Device {
    pub fn querycap(&self) -> Capabilities {
        Capabilities {
            driver: MODULE_NAME.to_owned(),
            card: DRV_NAME.to_owned(),
            bus_info: format!("PCI:{}", self.bus_name()),
            device_caps: CAP_SDR_CAPTURE | CAP_TUNER | CAP_READWRITE,
        }
    }

    pub fn enum_format(&self, index: u32) -> Result<FormatDesc> {
        PixelFormat::ALL
            .get(index as usize)
            .map(|f| FormatDesc {
                index,
                pixel_format: f.fourcc(),
            })
            .ok_or_else(|| Error::InvalidArgument(format!("no format {}", index)))
    }

    /// What `set_format` would settle on, without touching the hardware
    pub fn try_format(&self, fourcc: u32) -> SdrFormat {
        let format = PixelFormat::from_fourcc(fourcc).unwrap_or(PixelFormat::Ru8);
        SdrFormat {
            pixel_format: format.fourcc(),
            buffer_size: self.controller().config().buffer_size,
        }
    }

    pub fn format(&self) -> SdrFormat {
        let config = self.controller().config();
        SdrFormat {
            pixel_format: config.pixel_format.fourcc(),
            buffer_size: config.buffer_size,
        }
    }

    /// Switch sample format; unknown codes select 8-bit samples
    pub fn set_format(&self, fourcc: u32) -> SdrFormat {
        let mut ctl = self.controller();
        let format = ctl.set_format_fourcc(fourcc);
        SdrFormat {
            pixel_format: format.fourcc(),
            buffer_size: ctl.config().buffer_size,
        }
    }

    /// The ADC, presented as a tuner covering every band of the current format
    pub fn tuner(&self, index: u32) -> Result<Tuner> {
        check_tuner(index)?;
        let bands = self.controller().config().pixel_format.bands();
        Ok(Tuner {
            index,
            name: TUNER_NAME.to_owned(),
            tuner_type: TUNER_SDR,
            capability: TUNER_CAP_1HZ | TUNER_CAP_FREQ_BANDS,
            range_low: bands[0].range_low,
            range_high: bands[2].range_high,
        })
    }

    pub fn set_tuner(&self, index: u32) -> Result<()> {
        check_tuner(index)
    }

    pub fn enum_freq_band(&self, tuner: u32, index: u32) -> Result<FrequencyBand> {
        check_tuner(tuner)?;
        let band = Band::from_index(index)?;
        Ok(self.controller().config().pixel_format.bands()[band.index()])
    }

    pub fn frequency(&self, tuner: u32) -> Result<Frequency> {
        check_tuner(tuner)?;
        Ok(Frequency {
            tuner,
            tuner_type: TUNER_SDR,
            frequency: self.controller().config().frequency(),
        })
    }

    /// Select the band nearest `hz`; returns the sample rate now in effect
    pub fn set_frequency(&self, tuner: u32, tuner_type: u32, hz: u32) -> Result<u32> {
        check_tuner(tuner)?;
        if tuner_type != TUNER_SDR {
            return Err(Error::InvalidArgument(format!(
                "tuner type {} is not an SDR tuner",
                tuner_type
            )));
        }
        let mut ctl = self.controller();
        ctl.set_frequency(hz);
        Ok(ctl.config().frequency())
    }

    pub fn gain(&self) -> u32 {
        self.controller().config().gain
    }

    pub fn set_gain(&self, gain: u32) -> Result<()> {
        self.controller().set_gain(gain)
    }

    pub fn input(&self) -> u32 {
        self.controller().config().input
    }

    pub fn set_input(&self, input: u32) -> Result<()> {
        self.controller().set_input(input)
    }

    pub fn input_menu(&self) -> Vec<MenuItem> {
        (0..=INPUT_MAX)
            .map(|i| MenuItem {
                index: i,
                name: INPUT_NAMES[i as usize],
            })
            .collect()
    }

    /// Log the current configuration
    pub fn log_status(&self) {
        let config = self.controller().config();
        info!(
            "{}: {} at {} Hz, gain {}, {}, session {}",
            self.name(),
            config.pixel_format,
            config.frequency(),
            config.gain,
            INPUT_NAMES[config.input as usize],
            if self.is_open() { "open" } else { "closed" }
        );
    }
}

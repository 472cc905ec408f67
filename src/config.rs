use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use confique::Config;
use serde::Deserialize;

use crate::block::DigitizerBlock;
use crate::error::{DaqError, DaqResult};

pub const MAX_ANALOG_CHANNELS: usize = 4;
pub const MAX_DIGITAL_PORTS: usize = 4;

/// Input ranges the hardware accepts, in volts.
pub const ANALOG_RANGES: [f64; 12] = [
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0,
];

// Channel status bits as reported by the driver.
pub const STATUS_OVERFLOW: u32 = 0x01;
pub const STATUS_REALIGNMENT_ERROR: u32 = 0x02;
pub const STATUS_NOT_ALL_DATA_EXTRACTED: u32 = 0x04;
pub const STATUS_TIMEOUT_WAITING: u32 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Coupling {
    /// AC coupling, 1 MOhm impedance.
    #[serde(rename = "ac_1m")]
    Ac1M,
    /// DC coupling, 1 MOhm impedance.
    #[serde(rename = "dc_1m")]
    Dc1M,
    /// DC coupling, 50 Ohm impedance.
    #[serde(rename = "dc_50")]
    Dc50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    Streaming,
    RapidBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsamplingMode {
    None,
    MinMax,
    Decimate,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    Rising,
    Falling,
    High,
    Low,
}

/// One physical analog input.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannelConfig {
    pub enabled: bool,
    /// Requested input range in volts, one of [`ANALOG_RANGES`].
    pub range: f64,
    pub offset: f64,
    pub coupling: Coupling,
    /// Range the driver actually accepted; equals `range` until configure.
    pub actual_range: f64,
}

impl Default for AnalogChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            range: 2.0,
            offset: 0.0,
            coupling: Coupling::Dc1M,
            actual_range: 2.0,
        }
    }
}

/// One 8-bit digital port.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalPortConfig {
    pub enabled: bool,
    /// Logic threshold in volts.
    pub logic_level: f64,
}

impl Default for DigitalPortConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            logic_level: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    None,
    /// Analog channel index (0 = A).
    Analog(usize),
    /// External trigger input.
    Aux,
    /// One pin of the digital ports; see `TriggerSettings::pin`.
    Digital,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSettings {
    pub source: TriggerSource,
    pub threshold: f64,
    pub direction: TriggerDirection,
    /// Pin number across all ports, digital source only.
    pub pin: u32,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            source: TriggerSource::None,
            threshold: 0.0,
            direction: TriggerDirection::Rising,
            pin: 0,
        }
    }
}

impl TriggerSettings {
    pub fn is_enabled(&self) -> bool {
        self.source != TriggerSource::None
    }

    pub fn is_analog(&self) -> bool {
        matches!(self.source, TriggerSource::Analog(_))
    }

    pub fn is_digital(&self) -> bool {
        self.source == TriggerSource::Digital
    }
}

/// Everything the driver needs to set up a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub sample_rate: f64,
    /// Rate the driver reported at configure time.
    pub actual_sample_rate: f64,
    /// Post-trigger samples per rapid-block waveform.
    pub samples: usize,
    /// Pre-trigger samples per rapid-block waveform.
    pub pre_samples: usize,
    pub nr_captures: usize,
    pub buffer_size: usize,
    pub nr_buffers: usize,
    pub driver_buffer_size: usize,
    /// Streaming poll interval in seconds.
    pub poll_rate: f64,
    pub mode: AcquisitionMode,
    pub downsampling_mode: DownsamplingMode,
    pub downsampling_factor: usize,
    pub auto_arm: bool,
    pub trigger_once: bool,
    /// Watchdog trips when the estimated rate drops below
    /// `actual_sample_rate * watchdog_threshold`.
    pub watchdog_threshold: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            sample_rate: 10_000.0,
            actual_sample_rate: 10_000.0,
            samples: 10_000,
            pre_samples: 1_000,
            nr_captures: 1,
            buffer_size: 8192,
            nr_buffers: 100,
            driver_buffer_size: 100_000,
            poll_rate: 0.001,
            mode: AcquisitionMode::Streaming,
            downsampling_mode: DownsamplingMode::None,
            downsampling_factor: 1,
            auto_arm: true,
            trigger_once: false,
            watchdog_threshold: 0.9,
        }
    }
}

impl AcquisitionSettings {
    pub fn pre_samples_downsampled(&self) -> usize {
        if self.downsampling_mode == DownsamplingMode::None {
            self.pre_samples
        } else {
            self.pre_samples / self.downsampling_factor
        }
    }

    pub fn post_samples_downsampled(&self) -> usize {
        if self.downsampling_mode == DownsamplingMode::None {
            self.samples
        } else {
            self.samples / self.downsampling_factor
        }
    }

    /// Raw samples per rapid-block waveform.
    pub fn block_size(&self) -> usize {
        self.samples + self.pre_samples
    }

    pub fn block_size_downsampled(&self) -> usize {
        self.pre_samples_downsampled() + self.post_samples_downsampled()
    }

    /// Seconds per output sample.
    pub fn timebase(&self) -> f64 {
        if self.downsampling_mode == DownsamplingMode::None {
            1.0 / self.actual_sample_rate
        } else {
            self.downsampling_factor as f64 / self.actual_sample_rate
        }
    }
}

/// Parse a channel id of the form `"A"`..`"D"` into its index.
pub fn parse_aichan_id(id: &str) -> DaqResult<usize> {
    let mut chars = id.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(DaqError::InvalidArgument(format!(
            "channel id should be a single character: {id:?}"
        )));
    };
    let idx = (c.to_ascii_uppercase() as i32) - ('A' as i32);
    if !(0..MAX_ANALOG_CHANNELS as i32).contains(&idx) {
        return Err(DaqError::InvalidArgument(format!(
            "invalid channel id: {id:?}"
        )));
    }
    Ok(idx as usize)
}

/// Parse a port id of the form `"port0"`..`"port3"` into its index.
pub fn parse_port_id(id: &str) -> DaqResult<usize> {
    let idx = id
        .strip_prefix("port")
        .and_then(|rest| rest.parse::<usize>().ok())
        .ok_or_else(|| {
            DaqError::InvalidArgument(format!(
                "invalid port id: {id:?}, expected \"port<digit>\""
            ))
        })?;
    if idx >= MAX_DIGITAL_PORTS {
        return Err(DaqError::InvalidArgument(format!(
            "invalid port number: {id:?}"
        )));
    }
    Ok(idx)
}

/// Check that `range` is one of the discrete hardware input ranges.
pub fn validate_range(range: f64) -> DaqResult<()> {
    if ANALOG_RANGES.iter().any(|r| (r - range).abs() < 1e-9) {
        Ok(())
    } else {
        Err(DaqError::InvalidArgument(format!(
            "input range {range} V is not supported"
        )))
    }
}

/// File-based block configuration.
///
/// Loads a TOML file and applies it to a block through the public
/// setter surface, so the same validation runs either way.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub acquisition: AcquisitionConf,
    #[config(nested)]
    pub trigger: TriggerConf,
    /// Analog channels keyed by id ("a".."d").
    pub channels: Option<HashMap<String, ChannelEntry>>,
    /// Digital ports keyed by id ("port0"..).
    pub ports: Option<HashMap<String, PortEntry>>,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionConf {
    pub sample_rate: f64,
    #[config(default = "streaming")]
    pub mode: AcquisitionMode,
    #[config(default = 10000)]
    pub samples: usize,
    #[config(default = 1000)]
    pub pre_samples: usize,
    #[config(default = 1)]
    pub nr_captures: usize,
    #[config(default = 8192)]
    pub buffer_size: usize,
    #[config(default = 100)]
    pub nr_buffers: usize,
    #[config(default = 100000)]
    pub driver_buffer_size: usize,
    #[config(default = 0.001)]
    pub poll_rate: f64,
    #[config(default = "none")]
    pub downsampling_mode: DownsamplingMode,
    #[config(default = 1)]
    pub downsampling_factor: usize,
    #[config(default = true)]
    pub auto_arm: bool,
    #[config(default = false)]
    pub trigger_once: bool,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerConf {
    /// "none", "a".."d", "aux" or "digital".
    #[config(default = "none")]
    pub source: String,
    #[config(default = 0.0)]
    pub threshold: f64,
    #[config(default = "rising")]
    pub direction: TriggerDirection,
    #[config(default = 0)]
    pub pin: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChannelEntry {
    pub enabled: bool,
    pub range: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_coupling")]
    pub coupling: Coupling,
}

fn default_coupling() -> Coupling {
    Coupling::Dc1M
}

#[derive(Deserialize, Debug, Clone)]
pub struct PortEntry {
    pub enabled: bool,
    #[serde(default = "default_logic_level")]
    pub logic_level: f64,
}

fn default_logic_level() -> f64 {
    1.5
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        Conf::builder()
            .file(path)
            .load()
            .with_context(|| format!("failed to load config from {}", path.display()))
    }

    /// Push this configuration into `block` through its setters.
    ///
    /// The block must not be armed.
    pub fn apply(&self, block: &mut DigitizerBlock) -> anyhow::Result<()> {
        let acq = &self.acquisition;

        block.set_samp_rate(acq.sample_rate)?;
        block.set_samples(acq.samples, acq.pre_samples)?;
        match acq.mode {
            AcquisitionMode::Streaming => {
                block.set_streaming(acq.poll_rate)?;
                block.set_buffer_size(acq.buffer_size)?;
            }
            AcquisitionMode::RapidBlock => block.set_rapid_block(acq.nr_captures)?,
        }
        block.set_nr_buffers(acq.nr_buffers)?;
        block.set_driver_buffer_size(acq.driver_buffer_size)?;
        block.set_downsampling(acq.downsampling_mode, acq.downsampling_factor)?;
        block.set_auto_arm(acq.auto_arm)?;
        block.set_trigger_once(acq.trigger_once)?;

        if let Some(channels) = &self.channels {
            for (id, entry) in channels {
                let dc = entry.coupling != Coupling::Ac1M;
                block
                    .set_aichan(id, entry.enabled, entry.range, dc, entry.offset)
                    .with_context(|| format!("channel {id:?}"))?;
                block
                    .set_aichan_coupling(id, entry.coupling)
                    .with_context(|| format!("channel {id:?}"))?;
            }
        }

        if let Some(ports) = &self.ports {
            for (id, entry) in ports {
                block
                    .set_diport(id, entry.enabled, entry.logic_level)
                    .with_context(|| format!("port {id:?}"))?;
            }
        }

        match self.trigger.source.to_ascii_lowercase().as_str() {
            "none" => block.disable_triggers()?,
            "digital" => block.set_di_trigger(self.trigger.pin, self.trigger.direction)?,
            source => block
                .set_aichan_trigger(source, self.trigger.direction, self.trigger.threshold)
                .context("trigger source")?,
        }

        Ok(())
    }
}

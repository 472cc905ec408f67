use rand::Rng;

use crate::buffer::AcquisitionChunk;
use crate::config::{
    AcquisitionMode, AcquisitionSettings, AnalogChannelConfig, DigitalPortConfig, TriggerSettings,
};
use crate::driver::{Driver, DriverHooks, OutputSlot};
use crate::error::{DaqError, DaqResult};
use crate::utils::timestamp_utc_ns;

/// Signal shape generated by the simulated device.
#[derive(Debug, Clone, Copy)]
pub enum Waveform {
    /// Sawtooth ramp from 0 to `amplitude` over `period` samples.
    Ramp { period: usize },
    /// Sine at `frequency` Hz referenced to the configured sample rate.
    Sine { frequency: f64 },
    /// Square wave with the given period in samples, high first.
    Square { period: usize },
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub waveform: Waveform,
    pub amplitude: f64,
    /// Uniform noise amplitude added to every sample.
    pub noise: f64,
    /// Fraction of the nominal rate reported per callback; below the
    /// watchdog threshold this makes the watchdog trip.
    pub rate_factor: f64,
    /// Make `configure` fail, for exercising the start error path.
    pub fail_configure: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            waveform: Waveform::Ramp { period: 1024 },
            amplitude: 1.0,
            noise: 0.0,
            rate_factor: 1.0,
            fail_configure: false,
        }
    }
}

/// Simulated digitizer backend.
///
/// Stands in for a hardware driver: streaming `poll` deposits one
/// generated chunk per call, rapid-block captures complete the moment
/// the device is armed. Lifecycle calls are counted so tests can
/// observe rearm behavior.
pub struct SimScope {
    cfg: SimConfig,
    hooks: Option<DriverHooks>,
    settings: AcquisitionSettings,
    channels: Vec<AnalogChannelConfig>,
    ports: Vec<DigitalPortConfig>,
    opened: bool,
    armed: bool,
    sample_clock: u64,
    arm_count: usize,
    disarm_count: usize,
    poll_count: usize,
}

impl SimScope {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            hooks: None,
            settings: AcquisitionSettings::default(),
            channels: Vec::new(),
            ports: Vec::new(),
            opened: false,
            armed: false,
            sample_clock: 0,
            arm_count: 0,
            disarm_count: 0,
            poll_count: 0,
        }
    }

    pub fn arm_count(&self) -> usize {
        self.arm_count
    }

    pub fn disarm_count(&self) -> usize {
        self.disarm_count
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count
    }

    fn sample(&self, idx: u64) -> f32 {
        let amp = self.cfg.amplitude;
        let base = match self.cfg.waveform {
            Waveform::Ramp { period } => {
                let period = period.max(1) as u64;
                (idx % period) as f64 / period as f64 * amp
            }
            Waveform::Sine { frequency } => {
                let t = idx as f64 / self.settings.actual_sample_rate;
                amp * (std::f64::consts::TAU * frequency * t).sin()
            }
            Waveform::Square { period } => {
                let period = period.max(2) as u64;
                if idx % period < period / 2 {
                    amp
                } else {
                    -amp
                }
            }
        };
        let noisy = if self.cfg.noise > 0.0 {
            base + rand::thread_rng().gen_range(-self.cfg.noise..self.cfg.noise)
        } else {
            base
        };
        noisy as f32
    }

    fn fill_chunk(&self, chunk: &mut AcquisitionChunk) {
        let size = self.settings.buffer_size;
        let half = (self.cfg.amplitude * 0.5) as f32;
        let error = (self.cfg.amplitude * 0.01) as f32;

        let mut row = 0;
        for channel in &self.channels {
            if !channel.enabled {
                continue;
            }
            for k in 0..size {
                let v = self.sample(self.sample_clock + k as u64);
                chunk.analog[[row, k]] = v;
                chunk.analog_errors[[row, k]] = error;
            }
            chunk.status[row] = 0;
            row += 1;
        }

        let mut port_row = 0;
        for port in &self.ports {
            if !port.enabled {
                continue;
            }
            for k in 0..size {
                let v = self.sample(self.sample_clock + k as u64);
                chunk.digital[[port_row, k]] = if v > half { 0xFF } else { 0x00 };
            }
            port_row += 1;
        }

        chunk.timestamp_ns = timestamp_utc_ns();
    }
}

impl Driver for SimScope {
    fn attach(&mut self, hooks: DriverHooks) {
        self.hooks = Some(hooks);
    }

    fn initialize(&mut self) -> DaqResult<()> {
        self.opened = true;
        Ok(())
    }

    fn configure(
        &mut self,
        settings: &AcquisitionSettings,
        channels: &mut [AnalogChannelConfig],
        ports: &[DigitalPortConfig],
        _trigger: &TriggerSettings,
    ) -> DaqResult<f64> {
        if !self.opened {
            return Err(DaqError::Driver("device not open".into()));
        }
        if self.cfg.fail_configure {
            return Err(DaqError::Config("simulated configure failure".into()));
        }
        // The simulated device accepts every requested range verbatim.
        for channel in channels.iter_mut() {
            channel.actual_range = channel.range;
        }
        self.settings = settings.clone();
        self.settings.actual_sample_rate = settings.sample_rate;
        self.channels = channels.to_vec();
        self.ports = ports.to_vec();
        Ok(settings.sample_rate)
    }

    fn arm(&mut self) -> DaqResult<()> {
        if !self.opened {
            return Err(DaqError::Driver("device not open".into()));
        }
        self.armed = true;
        self.arm_count += 1;
        if self.settings.mode == AcquisitionMode::RapidBlock {
            // All captures are available immediately.
            if let Some(hooks) = &self.hooks {
                hooks.data_ready.notify(None);
            }
        }
        Ok(())
    }

    fn disarm(&mut self) -> DaqResult<()> {
        self.armed = false;
        self.disarm_count += 1;
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        self.opened = false;
        self.armed = false;
        Ok(())
    }

    fn poll(&mut self) -> DaqResult<()> {
        self.poll_count += 1;
        if !self.armed {
            return Ok(());
        }
        let (buffer, watchdog) = match &self.hooks {
            Some(h) => (h.buffer.clone(), h.watchdog.clone()),
            None => return Err(DaqError::State("driver hooks not attached".into())),
        };

        let mut chunk = buffer.take_free();
        self.fill_chunk(&mut chunk);
        buffer.push(chunk);

        let reported = (self.settings.actual_sample_rate * self.cfg.rate_factor) as f32;
        watchdog.lock().unwrap().estimator.add(reported);

        self.sample_clock += self.settings.buffer_size as u64;
        Ok(())
    }

    fn prefetch_block(&mut self, _n_samples: usize, _waveform_idx: usize) -> DaqResult<()> {
        Ok(())
    }

    fn rapid_block_data(
        &mut self,
        offset: usize,
        n: usize,
        waveform_idx: usize,
        slots: &mut [OutputSlot<'_>],
        status: &mut [u32],
    ) -> DaqResult<()> {
        if !self.armed {
            return Err(DaqError::Driver("device not armed".into()));
        }
        let block = self.settings.block_size_downsampled();
        let base = (waveform_idx * block + offset) as u64;
        let error = (self.cfg.amplitude * 0.01) as f32;
        let half = (self.cfg.amplitude * 0.5) as f32;

        for (ch, channel) in self.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            if let Some(OutputSlot::Analog(values)) = slots.get_mut(2 * ch) {
                for k in 0..n.min(values.len()) {
                    values[k] = self.sample(base + k as u64);
                }
            }
            if let Some(OutputSlot::Analog(errors)) = slots.get_mut(2 * ch + 1) {
                for e in errors.iter_mut().take(n) {
                    *e = error;
                }
            }
            if ch < status.len() {
                status[ch] = 0;
            }
        }

        let first_port_slot = 2 * self.channels.len();
        for (p, port) in self.ports.iter().enumerate() {
            if !port.enabled {
                continue;
            }
            if let Some(OutputSlot::Digital(bits)) = slots.get_mut(first_port_slot + p) {
                for k in 0..n.min(bits.len()) {
                    bits[k] = if self.sample(base + k as u64) > half {
                        0xFF
                    } else {
                        0x00
                    };
                }
            }
        }

        Ok(())
    }
}

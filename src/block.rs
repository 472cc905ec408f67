use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::buffer::{AppBuffer, DataReady};
use crate::config::{
    parse_aichan_id, parse_port_id, validate_range, AcquisitionMode, AcquisitionSettings,
    AnalogChannelConfig, Coupling, DigitalPortConfig, DownsamplingMode, TriggerDirection,
    TriggerSettings, TriggerSource, MAX_ANALOG_CHANNELS, MAX_DIGITAL_PORTS,
};
use crate::driver::{DriverHooks, OutputSlot, SharedDriver};
use crate::error::{DaqError, DaqResult, ErrorEntry, ErrorRing};
use crate::poller::{Poller, WatchdogState};
use crate::rapid_block::{BlockPhase, RapidBlockState};
use crate::tags::{AcqInfo, StreamTag, Tag, TriggerTag};
use crate::trigger::TriggerDetector;
use crate::utils::timestamp_utc_ns;

const ERROR_HISTORY: usize = 128;
const RATE_HISTORY: usize = 100_000;

/// Lifecycle of the block. Configuration may change in any state except
/// `Armed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Uninitialized,
    Initialized,
    Armed,
}

/// Outcome of one `work()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    /// Samples were written into the output slots.
    Produced(usize),
    /// Nothing produced; call again.
    Again,
    /// End of stream.
    Done,
}

/// Output slots and the tags attached to them during one `work()` call.
///
/// The slot layout is fixed: two analog slots (values, error) per
/// channel in channel order, then one digital slot per port, present
/// whether or not the channel is enabled. Disabled slots receive no
/// writes.
pub struct WorkOutput<'a> {
    pub slots: Vec<OutputSlot<'a>>,
    pub tags: Vec<StreamTag>,
}

impl<'a> WorkOutput<'a> {
    pub fn new(slots: Vec<OutputSlot<'a>>) -> Self {
        Self {
            slots,
            tags: Vec::new(),
        }
    }
}

/// Cancellation handle usable while `work()` is blocked.
///
/// Cloneable and thread-safe; `request_stop` wakes any pending wait and
/// makes `work()` answer end-of-stream. The owner still calls
/// [`DigitizerBlock::stop`] afterwards to tear acquisition down.
#[derive(Clone)]
pub struct StopHandle {
    buffer: Arc<AppBuffer>,
    data_ready: Arc<DataReady>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.buffer.notify_data_ready(Some(DaqError::Stopped));
        self.data_ready.notify(Some(DaqError::Stopped));
    }
}

/// Multi-channel digitizer acquisition source.
///
/// Owns the driver handle, the producer/consumer buffer, the software
/// trigger detector and the streaming poll thread, and implements the
/// pull contract: `work()` fills caller-provided output slots one chunk
/// (streaming) or one waveform batch (rapid block) at a time.
pub struct DigitizerBlock {
    driver: SharedDriver,
    ai_channels: usize,
    di_ports: usize,

    settings: AcquisitionSettings,
    channels: Vec<AnalogChannelConfig>,
    ports: Vec<DigitalPortConfig>,
    trigger: TriggerSettings,

    state: BlockState,
    app_buffer: Arc<AppBuffer>,
    data_ready: Arc<DataReady>,
    watchdog: Arc<Mutex<WatchdogState>>,
    errors: ErrorRing,
    poller: Option<Poller>,
    bstate: RapidBlockState,
    detector: TriggerDetector,
    status: Vec<u32>,

    items_written: u64,
    timebase_published: bool,
    was_triggered_once: bool,
    configure_error: String,
}

impl DigitizerBlock {
    pub fn new(driver: SharedDriver, ai_channels: usize, di_ports: usize, auto_arm: bool) -> Self {
        assert!(ai_channels <= MAX_ANALOG_CHANNELS);
        assert!(di_ports <= MAX_DIGITAL_PORTS);

        let settings = AcquisitionSettings {
            auto_arm,
            ..Default::default()
        };
        let app_buffer = Arc::new(AppBuffer::new());
        let data_ready = Arc::new(DataReady::new());
        let watchdog = Arc::new(Mutex::new(WatchdogState::new(
            RATE_HISTORY,
            settings.watchdog_threshold,
        )));

        driver.lock().unwrap().attach(DriverHooks {
            buffer: Arc::clone(&app_buffer),
            data_ready: Arc::clone(&data_ready),
            watchdog: Arc::clone(&watchdog),
        });

        Self {
            driver,
            ai_channels,
            di_ports,
            settings,
            channels: vec![AnalogChannelConfig::default(); ai_channels],
            ports: vec![DigitalPortConfig::default(); di_ports],
            trigger: TriggerSettings::default(),
            state: BlockState::Uninitialized,
            app_buffer,
            data_ready,
            watchdog,
            errors: ErrorRing::new(ERROR_HISTORY),
            poller: None,
            bstate: RapidBlockState::new(),
            detector: TriggerDetector::new(),
            status: vec![0; ai_channels],
            items_written: 0,
            timebase_published: false,
            was_triggered_once: false,
            configure_error: String::new(),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state != BlockState::Uninitialized
    }

    pub fn is_armed(&self) -> bool {
        self.state == BlockState::Armed
    }

    pub fn acquisition_mode(&self) -> AcquisitionMode {
        self.settings.mode
    }

    /// Sample rate the device actually runs at.
    pub fn samp_rate(&self) -> f64 {
        self.settings.actual_sample_rate
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub fn enabled_aichan_count(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    pub fn enabled_diport_count(&self) -> usize {
        self.ports.iter().filter(|p| p.enabled).count()
    }

    /// Total number of output slots in the fixed layout.
    pub fn output_slot_count(&self) -> usize {
        2 * self.ai_channels + self.di_ports
    }

    /// Absolute offset of the next sample to be produced.
    pub fn items_written(&self) -> u64 {
        self.items_written
    }

    /// Snapshot of the recent error history.
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.errors.snapshot()
    }

    /// Message of the last failed `start()`, empty after a clean stop.
    pub fn configure_error_message(&self) -> String {
        self.configure_error.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            buffer: Arc::clone(&self.app_buffer),
            data_ready: Arc::clone(&self.data_ready),
        }
    }

    // ------------------------------------------------------------------
    // Configuration surface
    // ------------------------------------------------------------------

    fn ensure_not_armed(&self) -> DaqResult<()> {
        if self.state == BlockState::Armed {
            Err(DaqError::State("settings are locked while armed".into()))
        } else {
            Ok(())
        }
    }

    pub fn set_samp_rate(&mut self, rate: f64) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if !(rate > 0.0) {
            return Err(DaqError::InvalidArgument(
                "sample rate should be greater than zero".into(),
            ));
        }
        self.settings.sample_rate = rate;
        self.settings.actual_sample_rate = rate;
        Ok(())
    }

    /// Post- and pre-trigger samples per rapid-block waveform. Also
    /// resizes the streaming buffer to one full waveform.
    pub fn set_samples(&mut self, samples: usize, pre_samples: usize) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if samples < 1 {
            return Err(DaqError::InvalidArgument(
                "post-trigger samples can't be less than one".into(),
            ));
        }
        self.settings.samples = samples;
        self.settings.pre_samples = pre_samples;
        self.settings.buffer_size = samples + pre_samples;
        Ok(())
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) -> DaqResult<()> {
        self.ensure_not_armed()?;
        self.settings.buffer_size = buffer_size;
        Ok(())
    }

    pub fn set_nr_buffers(&mut self, nr_buffers: usize) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if nr_buffers < 1 {
            return Err(DaqError::InvalidArgument(
                "need at least one buffer".into(),
            ));
        }
        self.settings.nr_buffers = nr_buffers;
        Ok(())
    }

    pub fn set_driver_buffer_size(&mut self, driver_buffer_size: usize) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if driver_buffer_size < 1 {
            return Err(DaqError::InvalidArgument(
                "driver buffer size can't be zero".into(),
            ));
        }
        self.settings.driver_buffer_size = driver_buffer_size;
        Ok(())
    }

    /// Select continuous streaming with the given poll interval in
    /// seconds.
    pub fn set_streaming(&mut self, poll_rate: f64) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if !(poll_rate >= 0.0) {
            return Err(DaqError::InvalidArgument("poll rate can't be negative".into()));
        }
        self.settings.mode = AcquisitionMode::Streaming;
        self.settings.poll_rate = poll_rate;
        self.settings.nr_captures = 1;
        Ok(())
    }

    /// Select triggered rapid-block acquisition of `nr_captures`
    /// waveforms per arm.
    pub fn set_rapid_block(&mut self, nr_captures: usize) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if nr_captures < 1 {
            return Err(DaqError::InvalidArgument(
                "nr waveforms should be at least one".into(),
            ));
        }
        self.settings.mode = AcquisitionMode::RapidBlock;
        self.settings.nr_captures = nr_captures;
        Ok(())
    }

    pub fn set_downsampling(
        &mut self,
        mode: DownsamplingMode,
        mut factor: usize,
    ) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if mode == DownsamplingMode::None {
            factor = 1;
        } else if factor < 2 {
            return Err(DaqError::InvalidArgument(
                "downsampling factor should be at least 2".into(),
            ));
        }
        self.settings.downsampling_mode = mode;
        self.settings.downsampling_factor = factor;
        Ok(())
    }

    pub fn set_auto_arm(&mut self, auto_arm: bool) -> DaqResult<()> {
        self.ensure_not_armed()?;
        self.settings.auto_arm = auto_arm;
        Ok(())
    }

    pub fn set_trigger_once(&mut self, trigger_once: bool) -> DaqResult<()> {
        self.ensure_not_armed()?;
        self.settings.trigger_once = trigger_once;
        Ok(())
    }

    /// Watchdog trip point as a fraction of the expected sample rate.
    pub fn set_watchdog_threshold(&mut self, threshold: f64) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(DaqError::InvalidArgument(
                "watchdog threshold must be within (0, 1]".into(),
            ));
        }
        self.settings.watchdog_threshold = threshold;
        Ok(())
    }

    fn aichan_idx(&self, id: &str) -> DaqResult<usize> {
        let idx = parse_aichan_id(id)?;
        if idx >= self.ai_channels {
            return Err(DaqError::InvalidArgument(format!(
                "channel {id:?} not present on this device"
            )));
        }
        Ok(idx)
    }

    fn diport_idx(&self, id: &str) -> DaqResult<usize> {
        let idx = parse_port_id(id)?;
        if idx >= self.di_ports {
            return Err(DaqError::InvalidArgument(format!(
                "port {id:?} not present on this device"
            )));
        }
        Ok(idx)
    }

    pub fn set_aichan(
        &mut self,
        id: &str,
        enabled: bool,
        range: f64,
        dc_coupling: bool,
        offset: f64,
    ) -> DaqResult<()> {
        self.ensure_not_armed()?;
        let idx = self.aichan_idx(id)?;
        validate_range(range)?;
        let channel = &mut self.channels[idx];
        channel.enabled = enabled;
        channel.range = range;
        channel.actual_range = range;
        channel.offset = offset;
        channel.coupling = if dc_coupling {
            Coupling::Dc1M
        } else {
            Coupling::Ac1M
        };
        Ok(())
    }

    pub fn set_aichan_range(&mut self, id: &str, range: f64, offset: f64) -> DaqResult<()> {
        self.ensure_not_armed()?;
        let idx = self.aichan_idx(id)?;
        validate_range(range)?;
        self.channels[idx].range = range;
        self.channels[idx].actual_range = range;
        self.channels[idx].offset = offset;
        Ok(())
    }

    pub fn set_aichan_coupling(&mut self, id: &str, coupling: Coupling) -> DaqResult<()> {
        self.ensure_not_armed()?;
        let idx = self.aichan_idx(id)?;
        self.channels[idx].coupling = coupling;
        Ok(())
    }

    pub fn set_diport(&mut self, id: &str, enabled: bool, thresh_voltage: f64) -> DaqResult<()> {
        self.ensure_not_armed()?;
        let idx = self.diport_idx(id)?;
        self.ports[idx].enabled = enabled;
        self.ports[idx].logic_level = thresh_voltage;
        Ok(())
    }

    /// Software trigger on an analog channel, or on the AUX input.
    pub fn set_aichan_trigger(
        &mut self,
        id: &str,
        direction: TriggerDirection,
        threshold: f64,
    ) -> DaqResult<()> {
        self.ensure_not_armed()?;
        let source = if id.eq_ignore_ascii_case("aux") {
            TriggerSource::Aux
        } else {
            TriggerSource::Analog(self.aichan_idx(id)?)
        };
        self.trigger = TriggerSettings {
            source,
            threshold,
            direction,
            pin: 0,
        };
        Ok(())
    }

    /// Software trigger on one pin of the digital ports.
    pub fn set_di_trigger(&mut self, pin: u32, direction: TriggerDirection) -> DaqResult<()> {
        self.ensure_not_armed()?;
        if pin as usize >= self.di_ports * 8 {
            return Err(DaqError::InvalidArgument(format!(
                "pin {pin} out of range for {} ports",
                self.di_ports
            )));
        }
        self.trigger = TriggerSettings {
            source: TriggerSource::Digital,
            threshold: 0.0,
            direction,
            pin,
        };
        Ok(())
    }

    pub fn disable_triggers(&mut self) -> DaqResult<()> {
        self.ensure_not_armed()?;
        self.trigger.source = TriggerSource::None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn record(&self, error: DaqError) {
        self.errors.push(error);
    }

    /// Open the device. Idempotent after success.
    pub fn initialize(&mut self) -> DaqResult<()> {
        if self.state != BlockState::Uninitialized {
            return Ok(());
        }
        let result = self.driver.lock().unwrap().initialize();
        if let Err(e) = result {
            self.record(e.clone());
            return Err(e);
        }
        self.state = BlockState::Initialized;
        Ok(())
    }

    /// Push the current settings to the device and size the application
    /// buffer for the enabled channel set.
    pub fn configure(&mut self) -> DaqResult<()> {
        match self.state {
            BlockState::Uninitialized => {
                return Err(DaqError::State("initialize first".into()))
            }
            BlockState::Armed => return Err(DaqError::State("disarm first".into())),
            BlockState::Initialized => {}
        }

        let result = {
            let mut driver = self.driver.lock().unwrap();
            driver.configure(&self.settings, &mut self.channels, &self.ports, &self.trigger)
        };
        let actual_rate = match result {
            Ok(rate) => rate,
            Err(e) => {
                self.record(e.clone());
                return Err(e);
            }
        };
        self.settings.actual_sample_rate = actual_rate;

        self.app_buffer.initialize(
            self.enabled_aichan_count(),
            self.enabled_diport_count(),
            self.settings.buffer_size,
            self.settings.nr_buffers,
        );
        Ok(())
    }

    /// Start acquisition. Idempotent while armed.
    pub fn arm(&mut self) -> DaqResult<()> {
        match self.state {
            BlockState::Armed => return Ok(()),
            BlockState::Uninitialized => {
                return Err(DaqError::State("initialize first".into()))
            }
            BlockState::Initialized => {}
        }

        // TODO: reject trigger sources that point at disabled channels
        // here instead of silently skipping detection per chunk.

        // Baseline the watchdog at the expected rate so it holds off
        // until real callbacks accumulate.
        {
            let mut wd = self.watchdog.lock().unwrap();
            wd.expected_rate = self.settings.actual_sample_rate;
            wd.threshold = self.settings.watchdog_threshold;
            wd.estimator.prime(self.settings.actual_sample_rate as f32);
        }

        let result = self.driver.lock().unwrap().arm();
        if let Err(e) = result {
            self.record(e.clone());
            return Err(e);
        }

        self.state = BlockState::Armed;
        self.timebase_published = false;
        self.detector.reset();
        self.app_buffer.notify_data_ready(None);

        if self.settings.mode == AcquisitionMode::Streaming {
            if let Some(poller) = &self.poller {
                poller.transit_to_running();
            }
        }
        Ok(())
    }

    /// Halt acquisition. A driver failure is recorded but does not keep
    /// the block armed.
    pub fn disarm(&mut self) {
        if self.state != BlockState::Armed {
            return;
        }
        if self.settings.mode == AcquisitionMode::Streaming {
            if let Some(poller) = &self.poller {
                poller.transit_to_idle();
            }
        }
        let result = self.driver.lock().unwrap().disarm();
        if let Err(e) = result {
            warn!("disarm failed: {e}");
            self.record(e);
        }
        self.state = BlockState::Initialized;
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) {
        if self.state == BlockState::Uninitialized {
            return;
        }
        if self.state == BlockState::Armed {
            self.disarm();
        }
        let result = self.driver.lock().unwrap().close();
        if let Err(e) = result {
            warn!("close failed: {e}");
            self.record(e);
        }
        self.state = BlockState::Uninitialized;
    }

    /// Bring the block up: initialize, configure, spawn the poll thread
    /// and (in streaming mode with auto-arm) arm the device. Returns
    /// `false` with the failure stored in
    /// [`configure_error_message`](Self::configure_error_message) if
    /// anything goes wrong; no partial state survives a failure.
    pub fn start(&mut self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                error!("start failed: {e}");
                self.configure_error = e.to_string();
                if let Some(poller) = self.poller.take() {
                    poller.shutdown();
                }
                self.close();
                false
            }
        }
    }

    fn try_start(&mut self) -> DaqResult<()> {
        self.initialize()?;
        self.configure()?;

        // start/stop may cycle without dropping the block.
        self.was_triggered_once = false;
        self.data_ready.clear();

        if self.settings.mode == AcquisitionMode::Streaming {
            self.start_poll_thread();
            if self.settings.auto_arm {
                self.arm()?;
            }
        }
        Ok(())
    }

    fn start_poll_thread(&mut self) {
        if self.poller.is_none() {
            self.poller = Some(Poller::spawn(
                Arc::clone(&self.driver),
                Arc::clone(&self.app_buffer),
                Arc::clone(&self.watchdog),
                Duration::from_secs_f64(self.settings.poll_rate),
            ));
        }
    }

    /// Tear acquisition down: wake any blocked `work()`, disarm and
    /// join the poll thread.
    pub fn stop(&mut self) -> bool {
        if self.state == BlockState::Uninitialized {
            return true;
        }

        if self.state == BlockState::Armed {
            // Interrupt a blocked work() so it answers end-of-stream.
            self.app_buffer.notify_data_ready(Some(DaqError::Stopped));
            self.data_ready.notify(Some(DaqError::Stopped));
            self.disarm();
        }

        if let Some(poller) = self.poller.take() {
            poller.shutdown();
        }

        self.configure_error.clear();
        true
    }

    // ------------------------------------------------------------------
    // Work
    // ------------------------------------------------------------------

    /// Produce up to `noutput_items` samples into `out`.
    pub fn work(&mut self, noutput_items: usize, out: &mut WorkOutput<'_>) -> WorkResult {
        if out.slots.len() != self.output_slot_count() {
            self.record(DaqError::InvalidArgument(format!(
                "expected {} output slots, got {}",
                self.output_slot_count(),
                out.slots.len()
            )));
            return WorkResult::Done;
        }

        let result = match self.settings.mode {
            AcquisitionMode::Streaming => self.work_stream(noutput_items, out),
            AcquisitionMode::RapidBlock => self.work_rapid_block(noutput_items, out),
        };

        if let WorkResult::Produced(n) = result {
            if !self.timebase_published {
                let timebase = self.settings.timebase();
                for slot in 0..out.slots.len() {
                    out.tags.push(StreamTag {
                        slot,
                        offset: self.items_written,
                        tag: Tag::Timebase(timebase),
                    });
                }
                self.timebase_published = true;
            }
            self.items_written += n as u64;
        }
        result
    }

    fn handle_stream_error(&mut self, e: DaqError) -> WorkResult {
        self.record(e.clone());
        match e {
            DaqError::Stopped => {
                info!("stop requested");
                WorkResult::Done
            }
            DaqError::Watchdog => {
                error!("watchdog triggered, rearming device");
                self.disarm();
                if self.arm().is_err() {
                    return WorkResult::Done;
                }
                WorkResult::Again
            }
            other => {
                error!("error reading stream data: {other}");
                WorkResult::Done
            }
        }
    }

    fn work_stream(&mut self, noutput_items: usize, out: &mut WorkOutput<'_>) -> WorkResult {
        let size = self.settings.buffer_size;
        assert!(
            noutput_items >= size,
            "noutput_items must cover one full chunk"
        );

        if let Err(e) = self.app_buffer.wait_data_ready() {
            return self.handle_stream_error(e);
        }

        // Copy one chunk straight into the enabled output slots.
        let mut chunk_status: Vec<u32> = Vec::new();
        let mut timestamp_ns = 0i64;
        let lost;
        {
            let mut analog_out: Vec<&mut [f32]> = Vec::new();
            let mut errors_out: Vec<&mut [f32]> = Vec::new();
            let mut digital_out: Vec<&mut [u8]> = Vec::new();

            let (analog_slots, digital_slots) = out.slots.split_at_mut(2 * self.ai_channels);
            for (i, pair) in analog_slots.chunks_mut(2).enumerate() {
                if !self.channels[i].enabled {
                    continue;
                }
                match pair {
                    [OutputSlot::Analog(values), OutputSlot::Analog(errors)] => {
                        analog_out.push(&mut **values);
                        errors_out.push(&mut **errors);
                    }
                    _ => {
                        self.record(DaqError::InvalidArgument(
                            "analog output slots out of order".into(),
                        ));
                        return WorkResult::Done;
                    }
                }
            }
            for (p, slot) in digital_slots.iter_mut().enumerate() {
                if !self.ports[p].enabled {
                    continue;
                }
                match slot {
                    OutputSlot::Digital(bits) => digital_out.push(&mut **bits),
                    _ => {
                        self.record(DaqError::InvalidArgument(
                            "digital output slots out of order".into(),
                        ));
                        return WorkResult::Done;
                    }
                }
            }

            lost = match self.app_buffer.get_data_chunk(
                &mut analog_out,
                &mut errors_out,
                &mut digital_out,
                &mut chunk_status,
                &mut timestamp_ns,
            ) {
                Ok(lost) => lost,
                Err(e) => return self.handle_stream_error(e),
            };
        }

        if lost > 0 {
            warn!("{lost} digitizer data chunks lost");
            self.record(DaqError::BufferOverflow { lost });
        }

        // Acquisition info on the values slot of each enabled channel,
        // then on every enabled port with neutral status.
        let mut info = AcqInfo {
            timestamp_ns,
            timebase: self.settings.timebase(),
            user_delay: 0.0,
            actual_delay: 0.0,
            samples: size,
            status: 0,
            triggered: false,
            trigger_timestamp_ns: -1,
        };
        let mut row = 0;
        for (i, channel) in self.channels.iter().enumerate() {
            if !channel.enabled {
                continue;
            }
            info.status = chunk_status.get(row).copied().unwrap_or(0);
            out.tags.push(StreamTag {
                slot: 2 * i,
                offset: self.items_written,
                tag: Tag::AcqInfo(info.clone()),
            });
            row += 1;
        }
        info.status = 0;
        for (p, port) in self.ports.iter().enumerate() {
            if !port.enabled {
                continue;
            }
            out.tags.push(StreamTag {
                slot: 2 * self.ai_channels + p,
                offset: self.items_written,
                tag: Tag::AcqInfo(info.clone()),
            });
        }

        // Software trigger detection over the just-produced samples.
        let mut trigger_offsets = Vec::new();
        match self.trigger.source {
            TriggerSource::Analog(chan)
                if chan < self.ai_channels && self.channels[chan].enabled =>
            {
                let band = (self.channels[chan].actual_range / 100.0) as f32;
                let threshold = self.trigger.threshold as f32;
                if let OutputSlot::Analog(values) = &out.slots[2 * chan] {
                    trigger_offsets =
                        self.detector
                            .find_analog(values, threshold, band, self.trigger.direction);
                }
            }
            TriggerSource::Digital => {
                let port = (self.trigger.pin / 8) as usize;
                let mask = 1u8 << (self.trigger.pin % 8);
                if port < self.di_ports && self.ports[port].enabled {
                    if let OutputSlot::Digital(bits) = &out.slots[2 * self.ai_channels + port] {
                        trigger_offsets =
                            self.detector.find_digital(bits, mask, self.trigger.direction);
                    }
                }
            }
            _ => {}
        }

        for &offset in &trigger_offsets {
            let abs_offset = self.items_written + offset as u64;
            for (i, channel) in self.channels.iter().enumerate() {
                if channel.enabled {
                    out.tags.push(StreamTag {
                        slot: 2 * i,
                        offset: abs_offset,
                        tag: Tag::Trigger,
                    });
                }
            }
            for (p, port) in self.ports.iter().enumerate() {
                if port.enabled {
                    out.tags.push(StreamTag {
                        slot: 2 * self.ai_channels + p,
                        offset: abs_offset,
                        tag: Tag::Trigger,
                    });
                }
            }
        }

        WorkResult::Produced(size)
    }

    fn work_rapid_block(&mut self, noutput_items: usize, out: &mut WorkOutput<'_>) -> WorkResult {
        if self.bstate.phase == BlockPhase::Waiting {
            if self.settings.trigger_once && self.was_triggered_once {
                return WorkResult::Done;
            }

            if self.settings.auto_arm {
                self.disarm();
                if self.arm().is_err() {
                    return WorkResult::Done;
                }
            }

            let ec = self.data_ready.wait();
            self.data_ready.clear();
            match ec {
                Some(DaqError::Stopped) => {
                    info!("stop requested");
                    return WorkResult::Done;
                }
                Some(e) => {
                    error!("error while waiting for data: {e}");
                    self.record(e);
                    return WorkResult::Again;
                }
                // All captures are ready; start fetching them.
                None => self.bstate.start_sequence(self.settings.nr_captures),
            }
        }

        if self.bstate.phase == BlockPhase::ReadingPart1 {
            // With trigger_once set, the next Waiting entry signals done.
            self.was_triggered_once = true;

            let samples_to_fetch = self.settings.block_size();
            let downsampled = self.settings.block_size_downsampled();

            let result = self
                .driver
                .lock()
                .unwrap()
                .prefetch_block(samples_to_fetch, self.bstate.waveform_idx);
            if let Err(e) = result {
                self.record(e);
                return WorkResult::Done;
            }

            self.bstate.set_waveform_params(0, downsampled);
            let n = noutput_items.min(self.bstate.samples_left);

            let result = {
                let mut driver = self.driver.lock().unwrap();
                driver.rapid_block_data(
                    self.bstate.offset,
                    n,
                    self.bstate.waveform_idx,
                    &mut out.slots,
                    &mut self.status,
                )
            };
            if let Err(e) = result {
                self.record(e);
                return WorkResult::Done;
            }

            // Two tags per enabled output: capture metadata at the block
            // start and a marker at the trigger position.
            let pre = self.settings.pre_samples_downsampled();
            let post = self.settings.post_samples_downsampled();
            let timebase = self.settings.timebase();
            let timestamp_ns = timestamp_utc_ns();
            let marker_offset = self.items_written + pre as u64;

            for (i, channel) in self.channels.iter().enumerate() {
                if !channel.enabled {
                    continue;
                }
                let tag = TriggerTag {
                    pre_samples: pre,
                    post_samples: post,
                    status: self.status.get(i).copied().unwrap_or(0),
                    timebase,
                    timestamp_ns,
                };
                out.tags.push(StreamTag {
                    slot: 2 * i,
                    offset: self.items_written,
                    tag: Tag::TriggerInfo(tag),
                });
                out.tags.push(StreamTag {
                    slot: 2 * i,
                    offset: marker_offset,
                    tag: Tag::Trigger,
                });
            }
            let port_tag = TriggerTag {
                pre_samples: pre,
                post_samples: post,
                status: 0,
                timebase,
                timestamp_ns,
            };
            for (p, port) in self.ports.iter().enumerate() {
                if !port.enabled {
                    continue;
                }
                let slot = 2 * self.ai_channels + p;
                out.tags.push(StreamTag {
                    slot,
                    offset: self.items_written,
                    tag: Tag::TriggerInfo(port_tag.clone()),
                });
                out.tags.push(StreamTag {
                    slot,
                    offset: marker_offset,
                    tag: Tag::Trigger,
                });
            }

            self.bstate.advance(n);
            return WorkResult::Produced(n);
        }

        if self.bstate.phase == BlockPhase::ReadingRest {
            let n = noutput_items.min(self.bstate.samples_left);
            let result = {
                let mut driver = self.driver.lock().unwrap();
                driver.rapid_block_data(
                    self.bstate.offset,
                    n,
                    self.bstate.waveform_idx,
                    &mut out.slots,
                    &mut self.status,
                )
            };
            if let Err(e) = result {
                self.record(e);
                return WorkResult::Done;
            }
            self.bstate.advance(n);
            return WorkResult::Produced(n);
        }

        WorkResult::Done
    }
}

impl Drop for DigitizerBlock {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimScope};

    fn sim_block(ai_channels: usize, di_ports: usize) -> (DigitizerBlock, Arc<Mutex<SimScope>>) {
        sim_block_with(ai_channels, di_ports, SimConfig::default())
    }

    fn sim_block_with(
        ai_channels: usize,
        di_ports: usize,
        cfg: SimConfig,
    ) -> (DigitizerBlock, Arc<Mutex<SimScope>>) {
        let sim = Arc::new(Mutex::new(SimScope::new(cfg)));
        let driver: SharedDriver = sim.clone();
        let block = DigitizerBlock::new(driver, ai_channels, di_ports, false);
        (block, sim)
    }

    #[test]
    fn setters_validate_arguments() {
        let (mut block, _) = sim_block(2, 1);

        assert!(block.set_samp_rate(0.0).is_err());
        assert!(block.set_samp_rate(-1.0).is_err());
        assert!(block.set_samp_rate(1e6).is_ok());

        assert!(block.set_samples(0, 10).is_err());
        assert!(block.set_samples(100, 10).is_ok());
        assert_eq!(block.settings().buffer_size, 110);

        assert!(block.set_nr_buffers(0).is_err());
        assert!(block.set_driver_buffer_size(0).is_err());
        assert!(block.set_streaming(-0.1).is_err());
        assert!(block.set_rapid_block(0).is_err());
        assert!(block.set_watchdog_threshold(0.0).is_err());
        assert!(block.set_watchdog_threshold(1.5).is_err());
        assert!(block.set_watchdog_threshold(0.8).is_ok());

        assert!(block.set_downsampling(DownsamplingMode::MinMax, 1).is_err());
        assert!(block.set_downsampling(DownsamplingMode::MinMax, 4).is_ok());
        // NONE forces the factor back to one.
        assert!(block.set_downsampling(DownsamplingMode::None, 7).is_ok());
        assert_eq!(block.settings().downsampling_factor, 1);

        assert!(block.set_aichan("E", true, 5.0, true, 0.0).is_err());
        assert!(block.set_aichan("C", true, 5.0, true, 0.0).is_err()); // only 2 channels
        assert!(block.set_aichan("A", true, 3.3, true, 0.0).is_err()); // bad range
        assert!(block.set_aichan("A", true, 5.0, true, 0.0).is_ok());

        assert!(block.set_diport("port1", true, 1.5).is_err()); // only 1 port
        assert!(block.set_diport("port0", true, 1.5).is_ok());

        assert!(block.set_di_trigger(8, TriggerDirection::Rising).is_err());
        assert!(block.set_di_trigger(3, TriggerDirection::Rising).is_ok());
        assert!(block
            .set_aichan_trigger("B", TriggerDirection::Falling, 0.25)
            .is_ok());
        assert!(block
            .set_aichan_trigger("aux", TriggerDirection::Rising, 0.0)
            .is_ok());
        assert!(block.disable_triggers().is_ok());
    }

    #[test]
    fn setters_fail_while_armed() {
        let (mut block, _) = sim_block(1, 0);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
        block.initialize().unwrap();
        block.configure().unwrap();
        block.arm().unwrap();

        let before = block.settings().clone();
        assert_eq!(
            block.set_samp_rate(123.0),
            Err(DaqError::State("settings are locked while armed".into()))
        );
        assert!(block.set_buffer_size(1).is_err());
        assert!(block.set_aichan("A", false, 5.0, true, 0.0).is_err());
        assert!(block.disable_triggers().is_err());
        assert_eq!(block.settings(), &before);

        block.disarm();
        assert!(block.set_samp_rate(123.0).is_ok());
    }

    #[test]
    fn lifecycle_idempotence() {
        let (mut block, sim) = sim_block(1, 0);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();

        block.initialize().unwrap();
        block.initialize().unwrap();
        block.configure().unwrap();
        block.configure().unwrap();

        block.arm().unwrap();
        block.arm().unwrap();
        assert_eq!(sim.lock().unwrap().arm_count(), 1);

        block.disarm();
        block.disarm();
        assert_eq!(sim.lock().unwrap().disarm_count(), 1);

        block.close();
        block.close();
        assert!(!block.is_initialized());
    }

    #[test]
    fn configure_requires_initialize() {
        let (mut block, _) = sim_block(1, 0);
        assert!(matches!(block.configure(), Err(DaqError::State(_))));
        assert!(matches!(block.arm(), Err(DaqError::State(_))));
    }

    #[test]
    fn start_failure_is_captured() {
        let cfg = SimConfig {
            fail_configure: true,
            ..Default::default()
        };
        let (mut block, _) = sim_block_with(1, 0, cfg);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();

        assert!(!block.start());
        assert!(block
            .configure_error_message()
            .contains("simulated configure failure"));
        assert!(!block.is_initialized());
        assert!(!block.errors().is_empty());
    }

    #[test]
    fn start_stop_cycle() {
        let (mut block, sim) = sim_block(1, 0);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
        block.set_streaming(0.001).unwrap();
        block.set_auto_arm(true).unwrap();

        assert!(block.start());
        assert!(block.is_armed());
        assert!(block.stop());
        assert!(!block.is_armed());
        assert!(block.is_initialized());
        assert!(block.configure_error_message().is_empty());
        assert_eq!(sim.lock().unwrap().disarm_count(), 1);

        // A second stop is a no-op.
        assert!(block.stop());
        assert_eq!(sim.lock().unwrap().disarm_count(), 1);
    }

    #[test]
    fn watchdog_recovery_rearms_once() {
        let (mut block, sim) = sim_block(1, 0);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
        block.set_buffer_size(16).unwrap();
        block.initialize().unwrap();
        block.configure().unwrap();
        block.arm().unwrap();
        assert_eq!(sim.lock().unwrap().arm_count(), 1);

        block
            .stop_handle()
            .buffer
            .notify_data_ready(Some(DaqError::Watchdog));

        let mut values = vec![0f32; 16];
        let mut errors = vec![0f32; 16];
        let mut out = WorkOutput::new(vec![
            OutputSlot::Analog(&mut values),
            OutputSlot::Analog(&mut errors),
        ]);
        assert_eq!(block.work(16, &mut out), WorkResult::Again);
        assert!(out.tags.is_empty());

        let sim = sim.lock().unwrap();
        assert_eq!(sim.disarm_count(), 1);
        assert_eq!(sim.arm_count(), 2);
        drop(sim);

        let recorded = block.errors();
        assert!(recorded.iter().any(|e| e.error == DaqError::Watchdog));
    }

    #[test]
    fn slot_layout_mismatch_ends_stream() {
        let (mut block, _) = sim_block(1, 0);
        block.set_aichan("A", true, 5.0, true, 0.0).unwrap();
        block.initialize().unwrap();
        block.configure().unwrap();

        let mut values = vec![0f32; 16];
        let mut out = WorkOutput::new(vec![OutputSlot::Analog(&mut values)]);
        assert_eq!(block.work(16, &mut out), WorkResult::Done);
        assert!(matches!(
            block.errors().last().map(|e| e.error.clone()),
            Some(DaqError::InvalidArgument(_))
        ));
    }
}

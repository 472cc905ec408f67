use std::sync::{Arc, Mutex};

use crate::buffer::{AppBuffer, DataReady};
use crate::config::{
    AcquisitionSettings, AnalogChannelConfig, DigitalPortConfig, TriggerSettings,
};
use crate::error::DaqResult;
use crate::poller::WatchdogState;

/// Borrowed view of one output stream during `work()`.
///
/// The slot layout is fixed by configuration: two `Analog` slots
/// (values, estimated error) per analog channel in channel order,
/// then one `Digital` slot per port.
#[derive(Debug)]
pub enum OutputSlot<'a> {
    Analog(&'a mut [f32]),
    Digital(&'a mut [u8]),
}

/// Shared state a backend needs while acquisition runs.
///
/// Streaming backends deposit chunks into `buffer` and feed one rate
/// estimate per callback into `watchdog`; rapid-block backends signal
/// `data_ready` when a capture sequence completes.
#[derive(Clone)]
pub struct DriverHooks {
    pub buffer: Arc<AppBuffer>,
    pub data_ready: Arc<DataReady>,
    pub watchdog: Arc<Mutex<WatchdogState>>,
}

/// Capability set of a digitizer backend.
///
/// Device families are independent implementations of this trait,
/// selected when the block is constructed; the core never sees past
/// it. Every operation reports failures as structured errors.
pub trait Driver: Send {
    /// Receive the block's shared state. Called once before any other
    /// operation.
    fn attach(&mut self, hooks: DriverHooks);

    /// Open the physical device.
    fn initialize(&mut self) -> DaqResult<()>;

    /// Push the full configuration to the device. Returns the sample
    /// rate the device actually runs at; accepted per-channel ranges
    /// are written back into `channels`.
    fn configure(
        &mut self,
        settings: &AcquisitionSettings,
        channels: &mut [AnalogChannelConfig],
        ports: &[DigitalPortConfig],
        trigger: &TriggerSettings,
    ) -> DaqResult<f64>;

    fn arm(&mut self) -> DaqResult<()>;

    fn disarm(&mut self) -> DaqResult<()>;

    fn close(&mut self) -> DaqResult<()>;

    /// Service the device in streaming mode. May synchronously invoke
    /// the backend's buffer callback, depositing ready chunks.
    fn poll(&mut self) -> DaqResult<()>;

    /// Ask the device to start materializing one captured waveform.
    /// Backends may treat this as a no-op.
    fn prefetch_block(&mut self, n_samples: usize, waveform_idx: usize) -> DaqResult<()>;

    /// Copy `n` samples starting at `offset` within the chosen waveform
    /// into the enabled output slots, and per-channel status bits into
    /// `status`.
    fn rapid_block_data(
        &mut self,
        offset: usize,
        n: usize,
        waveform_idx: usize,
        slots: &mut [OutputSlot<'_>],
        status: &mut [u32],
    ) -> DaqResult<()>;
}

/// A driver as shared between the block and the poller thread.
pub type SharedDriver = Arc<Mutex<dyn Driver>>;

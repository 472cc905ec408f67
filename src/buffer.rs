use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use ndarray::Array2;

use crate::error::{DaqError, DaqResult};

/// One buffer-sized slice of multi-channel samples from the producer.
///
/// Analog rows hold the enabled channels in configuration order; the
/// `status` entry at the same row index carries that channel's status
/// bits. Digital rows hold the enabled ports, one packed byte per
/// sample.
#[derive(Debug, Clone)]
pub struct AcquisitionChunk {
    /// Shape (enabled analog channels, buffer_size), volts.
    pub analog: Array2<f32>,
    /// Estimated error per sample, same shape as `analog`.
    pub analog_errors: Array2<f32>,
    /// Shape (enabled digital ports, buffer_size), packed bits.
    pub digital: Array2<u8>,
    pub status: Vec<u32>,
    /// Capture time, UTC nanoseconds.
    pub timestamp_ns: i64,
}

impl AcquisitionChunk {
    pub fn new(n_analog: usize, n_digital: usize, size: usize) -> Self {
        Self {
            analog: Array2::zeros((n_analog, size)),
            analog_errors: Array2::zeros((n_analog, size)),
            digital: Array2::zeros((n_digital, size)),
            status: vec![0; n_analog],
            timestamp_ns: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.analog.ncols().max(self.digital.ncols())
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    queue: VecDeque<AcquisitionChunk>,
    free: Vec<AcquisitionChunk>,
    capacity: usize,
    shape: (usize, usize, usize),
    lost: u64,
    error: Option<DaqError>,
}

/// Bounded multi-channel ring between the driver callback and `work()`.
///
/// The producer deposits one chunk per callback; when the ring is full
/// the oldest chunk is overwritten and counted as lost. A single
/// condition variable doubles as the error channel: `notify_data_ready`
/// with an error wakes the consumer, discards queued data and makes the
/// next wait return that error.
#[derive(Debug)]
pub struct AppBuffer {
    inner: Mutex<BufferInner>,
    data_ready: Condvar,
}

impl Default for AppBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            data_ready: Condvar::new(),
        }
    }

    /// Size the ring for the current channel configuration. Clears any
    /// queued chunks and resets the lost counter and error condition.
    pub fn initialize(&self, n_analog: usize, n_digital: usize, size: usize, nr_buffers: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.free.clear();
        inner.capacity = nr_buffers;
        inner.shape = (n_analog, n_digital, size);
        inner.lost = 0;
        inner.error = None;
        for _ in 0..nr_buffers {
            inner.free.push(AcquisitionChunk::new(n_analog, n_digital, size));
        }
    }

    /// Hand out chunk storage for the producer to fill.
    pub fn take_free(&self) -> AcquisitionChunk {
        let mut inner = self.inner.lock().unwrap();
        let (n_analog, n_digital, size) = inner.shape;
        inner
            .free
            .pop()
            .unwrap_or_else(|| AcquisitionChunk::new(n_analog, n_digital, size))
    }

    /// Enqueue a filled chunk, overwriting the oldest when full.
    pub fn push(&self, chunk: AcquisitionChunk) {
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity == 0 {
            return;
        }
        if inner.queue.len() == inner.capacity {
            if let Some(stale) = inner.queue.pop_front() {
                inner.free.push(stale);
            }
            inner.lost += 1;
        }
        inner.queue.push_back(chunk);
        drop(inner);
        self.data_ready.notify_one();
    }

    /// Wake the consumer. With an error set, queued data is discarded
    /// and the next wait returns the error; with `None` a previously
    /// set error condition is cleared.
    pub fn notify_data_ready(&self, error: Option<DaqError>) {
        let mut inner = self.inner.lock().unwrap();
        match error {
            Some(e) => {
                while let Some(chunk) = inner.queue.pop_front() {
                    inner.free.push(chunk);
                }
                inner.error = Some(e);
            }
            None => inner.error = None,
        }
        drop(inner);
        self.data_ready.notify_all();
    }

    /// Block until a chunk or an error is pending. A pending error is
    /// consumed and returned.
    pub fn wait_data_ready(&self) -> DaqResult<()> {
        let mut inner = self.inner.lock().unwrap();
        while inner.error.is_none() && inner.queue.is_empty() {
            inner = self.data_ready.wait(inner).unwrap();
        }
        match inner.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Consume one chunk into the supplied output slots.
    ///
    /// Slices must be given in chunk row order (enabled channels/ports
    /// only). Returns the number of chunks lost to overwrites since the
    /// previous call and resets that counter.
    pub fn get_data_chunk(
        &self,
        analog_out: &mut [&mut [f32]],
        errors_out: &mut [&mut [f32]],
        digital_out: &mut [&mut [u8]],
        status_out: &mut Vec<u32>,
        timestamp_ns: &mut i64,
    ) -> DaqResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        while inner.error.is_none() && inner.queue.is_empty() {
            inner = self.data_ready.wait(inner).unwrap();
        }
        if let Some(e) = inner.error.take() {
            return Err(e);
        }

        // The single consumer is the only popper, so the front chunk
        // observed above is still there.
        let chunk = match inner.queue.pop_front() {
            Some(chunk) => chunk,
            None => return Err(DaqError::Interrupted),
        };

        for (row, out) in analog_out.iter_mut().enumerate() {
            for (dst, src) in out.iter_mut().zip(chunk.analog.row(row)) {
                *dst = *src;
            }
        }
        for (row, out) in errors_out.iter_mut().enumerate() {
            for (dst, src) in out.iter_mut().zip(chunk.analog_errors.row(row)) {
                *dst = *src;
            }
        }
        for (row, out) in digital_out.iter_mut().enumerate() {
            for (dst, src) in out.iter_mut().zip(chunk.digital.row(row)) {
                *dst = *src;
            }
        }
        status_out.clear();
        status_out.extend_from_slice(&chunk.status);
        *timestamp_ns = chunk.timestamp_ns;

        inner.free.push(chunk);
        let lost = inner.lost;
        inner.lost = 0;
        Ok(lost)
    }

    /// Number of chunks currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}

/// Completion condition for rapid-block captures.
///
/// The driver signals it when a capture sequence is ready (or failed);
/// `work()` blocks on it while waiting for the next waveform set.
#[derive(Debug, Default)]
pub struct DataReady {
    state: Mutex<(bool, Option<DaqError>)>,
    cv: Condvar,
}

impl DataReady {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, error: Option<DaqError>) {
        let mut state = self.state.lock().unwrap();
        *state = (true, error);
        drop(state);
        self.cv.notify_all();
    }

    /// Block until notified; returns the error that was posted, if any.
    pub fn wait(&self) -> Option<DaqError> {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.cv.wait(state).unwrap();
        }
        state.1.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        *state = (false, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn test_chunk(buffer: &AppBuffer, marker: f32) -> AcquisitionChunk {
        let mut chunk = buffer.take_free();
        chunk.analog.fill(marker);
        chunk.analog_errors.fill(marker * 0.01);
        chunk.digital.fill(marker as u8);
        chunk.status = vec![0; chunk.analog.nrows()];
        chunk.timestamp_ns = 42;
        chunk
    }

    fn consume(buffer: &AppBuffer, size: usize) -> DaqResult<(Vec<f32>, u64)> {
        let mut values = vec![0f32; size];
        let mut errors = vec![0f32; size];
        let mut bits = vec![0u8; size];
        let mut status = Vec::new();
        let mut ts = 0i64;
        let lost = buffer.get_data_chunk(
            &mut [&mut values],
            &mut [&mut errors],
            &mut [&mut bits],
            &mut status,
            &mut ts,
        )?;
        Ok((values, lost))
    }

    #[test]
    fn fifo_order_and_copy() {
        let buffer = AppBuffer::new();
        buffer.initialize(1, 1, 8, 4);

        buffer.push(test_chunk(&buffer, 1.0));
        buffer.push(test_chunk(&buffer, 2.0));

        let (values, lost) = consume(&buffer, 8).unwrap();
        assert_eq!(lost, 0);
        assert_eq!(values, vec![1.0; 8]);

        let (values, _) = consume(&buffer, 8).unwrap();
        assert_eq!(values, vec![2.0; 8]);
    }

    #[test]
    fn overflow_counts_lost_chunks() {
        let buffer = AppBuffer::new();
        buffer.initialize(1, 1, 4, 4);

        for i in 0..6 {
            buffer.push(test_chunk(&buffer, i as f32));
        }
        assert_eq!(buffer.len(), 4);

        // Chunks 0 and 1 were overwritten; the first consumed is 2.
        let (values, lost) = consume(&buffer, 4).unwrap();
        assert_eq!(lost, 2);
        assert_eq!(values, vec![2.0; 4]);

        let (_, lost) = consume(&buffer, 4).unwrap();
        assert_eq!(lost, 0);
    }

    #[test]
    fn error_notification_discards_data() {
        let buffer = AppBuffer::new();
        buffer.initialize(1, 0, 4, 4);

        buffer.push(test_chunk(&buffer, 1.0));
        buffer.notify_data_ready(Some(DaqError::Stopped));

        assert_eq!(buffer.wait_data_ready(), Err(DaqError::Stopped));
        assert!(buffer.is_empty());

        // The error was consumed; a fresh push works again.
        buffer.push(test_chunk(&buffer, 2.0));
        assert_eq!(buffer.wait_data_ready(), Ok(()));
    }

    #[test]
    fn clearing_error_condition() {
        let buffer = AppBuffer::new();
        buffer.initialize(1, 0, 4, 4);

        buffer.notify_data_ready(Some(DaqError::Watchdog));
        buffer.notify_data_ready(None);
        buffer.push(test_chunk(&buffer, 1.0));
        assert_eq!(buffer.wait_data_ready(), Ok(()));
    }

    #[test]
    fn wait_wakes_on_cross_thread_push() {
        let buffer = Arc::new(AppBuffer::new());
        buffer.initialize(1, 0, 4, 4);

        let producer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(test_chunk(&producer, 7.0));
        });

        assert_eq!(buffer.wait_data_ready(), Ok(()));
        handle.join().unwrap();
    }

    #[test]
    fn data_ready_roundtrip() {
        let ready = DataReady::new();
        ready.notify(None);
        assert_eq!(ready.wait(), None);

        ready.clear();
        ready.notify(Some(DaqError::Stopped));
        assert_eq!(ready.wait(), Some(DaqError::Stopped));
    }
}

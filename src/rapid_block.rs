/// Where the per-waveform fetch loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    /// No waveform in progress; waiting for the next capture sequence.
    Waiting,
    /// First batch of a waveform, where trigger tags are attached.
    ReadingPart1,
    /// Remaining batches of the current waveform.
    ReadingRest,
}

/// Tracks the two-phase fetch of `nr_captures` waveforms across
/// successive `work()` calls.
#[derive(Debug)]
pub struct RapidBlockState {
    pub phase: BlockPhase,
    pub waveform_idx: usize,
    pub nr_captures: usize,
    /// Read offset within the current waveform.
    pub offset: usize,
    pub samples_left: usize,
}

impl Default for RapidBlockState {
    fn default() -> Self {
        Self::new()
    }
}

impl RapidBlockState {
    pub fn new() -> Self {
        Self {
            phase: BlockPhase::Waiting,
            waveform_idx: 0,
            nr_captures: 0,
            offset: 0,
            samples_left: 0,
        }
    }

    /// Begin fetching a fresh capture sequence.
    pub fn start_sequence(&mut self, nr_captures: usize) {
        self.phase = BlockPhase::ReadingPart1;
        self.waveform_idx = 0;
        self.nr_captures = nr_captures;
        self.offset = 0;
        self.samples_left = 0;
    }

    /// Reset the read window for the waveform about to be fetched.
    pub fn set_waveform_params(&mut self, offset: usize, samples: usize) {
        self.offset = offset;
        self.samples_left = samples;
    }

    /// Account for `n` samples just read and step the phase machine.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        self.samples_left = self.samples_left.saturating_sub(n);

        if self.samples_left > 0 {
            self.phase = BlockPhase::ReadingRest;
            return;
        }

        self.waveform_idx += 1;
        if self.waveform_idx >= self.nr_captures {
            self.phase = BlockPhase::Waiting;
        } else {
            self.phase = BlockPhase::ReadingPart1;
        }
    }
}

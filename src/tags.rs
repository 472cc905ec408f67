//! Sample metadata attached to output-stream offsets.

/// Metadata carried by a triggered rapid-block capture.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerTag {
    /// Samples captured before the trigger event (after downsampling).
    pub pre_samples: usize,
    /// Samples captured after the trigger event (after downsampling).
    pub post_samples: usize,
    /// Channel status bitmask at capture time.
    pub status: u32,
    /// Seconds per output sample.
    pub timebase: f64,
    pub timestamp_ns: i64,
}

/// Per-chunk acquisition info attached to every streaming chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AcqInfo {
    pub timestamp_ns: i64,
    /// Seconds per output sample.
    pub timebase: f64,
    pub user_delay: f64,
    pub actual_delay: f64,
    /// Number of samples this info applies to.
    pub samples: usize,
    /// Channel status bitmask.
    pub status: u32,
    pub triggered: bool,
    /// -1 when the chunk is not tied to a trigger event.
    pub trigger_timestamp_ns: i64,
}

/// The three kinds of sample metadata the block emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    /// Marks a trigger event position.
    Trigger,
    /// Capture metadata for a triggered block.
    TriggerInfo(TriggerTag),
    /// Chunk-level acquisition info.
    AcqInfo(AcqInfo),
    /// Seconds per output sample, republished on every (re)start.
    Timebase(f64),
}

/// A tag bound to one output slot at an absolute stream offset.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTag {
    pub slot: usize,
    pub offset: u64,
    pub tag: Tag,
}

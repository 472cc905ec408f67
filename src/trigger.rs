use crate::config::TriggerDirection;

/// Software trigger detection over chunk-sized sample runs.
///
/// Analog detection applies a hysteresis band below (rising) or above
/// (falling) the threshold so noise around the threshold fires at most
/// once per crossing. Digital detection watches one bit for
/// transitions. The armed/fired state persists across calls, so an
/// edge straddling two chunks is reported exactly once.
#[derive(Debug, Default)]
pub struct TriggerDetector {
    fired: bool,
}

impl TriggerDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current state; called when the block is armed.
    pub fn reset(&mut self) {
        self.fired = false;
    }

    /// Offsets within `samples` where the analog trigger fired.
    pub fn find_analog(
        &mut self,
        samples: &[f32],
        threshold: f32,
        band: f32,
        direction: TriggerDirection,
    ) -> Vec<usize> {
        let mut offsets = Vec::new();

        match direction {
            TriggerDirection::Rising | TriggerDirection::High => {
                let lo = threshold - band;
                for (i, &sample) in samples.iter().enumerate() {
                    if !self.fired && sample >= threshold {
                        self.fired = true;
                        offsets.push(i);
                    } else if self.fired && sample <= lo {
                        self.fired = false;
                    }
                }
            }
            TriggerDirection::Falling | TriggerDirection::Low => {
                let hi = threshold + band;
                for (i, &sample) in samples.iter().enumerate() {
                    if self.fired && sample <= threshold {
                        self.fired = false;
                        offsets.push(i);
                    } else if !self.fired && sample >= hi {
                        self.fired = true;
                    }
                }
            }
        }

        offsets
    }

    /// Offsets within `samples` where the masked bit transitioned in
    /// the configured direction.
    pub fn find_digital(
        &mut self,
        samples: &[u8],
        mask: u8,
        direction: TriggerDirection,
    ) -> Vec<usize> {
        let mut offsets = Vec::new();

        match direction {
            TriggerDirection::Rising | TriggerDirection::High => {
                for (i, &sample) in samples.iter().enumerate() {
                    if !self.fired && sample & mask != 0 {
                        self.fired = true;
                        offsets.push(i);
                    } else if self.fired && sample & mask == 0 {
                        self.fired = false;
                    }
                }
            }
            TriggerDirection::Falling | TriggerDirection::Low => {
                for (i, &sample) in samples.iter().enumerate() {
                    if self.fired && sample & mask == 0 {
                        self.fired = false;
                        offsets.push(i);
                    } else if !self.fired && sample & mask != 0 {
                        self.fired = true;
                    }
                }
            }
        }

        offsets
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::utils::timestamp_utc_ns;

/// Everything that can go wrong inside the acquisition core.
///
/// Driver backends report `Driver` and `Config`; the remaining variants
/// originate in the core itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DaqError {
    #[error("driver error: {0}")]
    Driver(String),
    #[error("configuration rejected by driver: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    State(String),
    #[error("estimated sample rate below watchdog threshold")]
    Watchdog,
    #[error("acquisition stopped")]
    Stopped,
    #[error("{lost} data chunks lost")]
    BufferOverflow { lost: u64 },
    #[error("wait interrupted")]
    Interrupted,
    #[error("unknown error")]
    Unknown,
}

pub type DaqResult<T> = Result<T, DaqError>;

/// One recorded failure, stamped when it was pushed.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp_ns: i64,
    pub error: DaqError,
}

/// Bounded history of recent errors.
///
/// Pushing never blocks on capacity; when full, the oldest entry is
/// overwritten. Any thread may push or snapshot.
#[derive(Debug)]
pub struct ErrorRing {
    entries: Mutex<VecDeque<ErrorEntry>>,
    capacity: usize,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, error: DaqError) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ErrorEntry {
            timestamp_ns: timestamp_utc_ns(),
            error,
        });
    }

    /// Copy of the current history, oldest first.
    pub fn snapshot(&self) -> Vec<ErrorEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_snapshot() {
        let ring = ErrorRing::new(4);
        ring.push(DaqError::Watchdog);
        ring.push(DaqError::Stopped);

        let errors = ring.snapshot();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error, DaqError::Watchdog);
        assert_eq!(errors[1].error, DaqError::Stopped);
        assert!(errors[0].timestamp_ns > 0);
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let ring = ErrorRing::new(3);
        for lost in 0..5u64 {
            ring.push(DaqError::BufferOverflow { lost });
        }

        let errors = ring.snapshot();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].error, DaqError::BufferOverflow { lost: 2 });
        assert_eq!(errors[2].error, DaqError::BufferOverflow { lost: 4 });
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            DaqError::Driver("no device found".into()).to_string(),
            "driver error: no device found"
        );
        assert_eq!(
            DaqError::BufferOverflow { lost: 7 }.to_string(),
            "7 data chunks lost"
        );
    }
}

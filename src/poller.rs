use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::buffer::AppBuffer;
use crate::driver::SharedDriver;
use crate::error::DaqError;
use crate::utils::MovingAverage;

/// How long a state transition may go unacknowledged before we log and
/// move on.
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

/// Iterations between re-reads of the shared state variable.
const STATE_CHECK_INTERVAL: u32 = 10;

/// Sleep between iterations while not running.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    PendIdle,
    PendExit,
    Exit,
}

/// Watchdog inputs shared between driver callbacks and the poll loop.
///
/// Callbacks add one rate estimate per buffer under this lock; the
/// poll loop compares the mean against `expected_rate * threshold`.
#[derive(Debug)]
pub struct WatchdogState {
    pub estimator: MovingAverage,
    pub expected_rate: f64,
    pub threshold: f64,
}

impl WatchdogState {
    pub fn new(history: usize, threshold: f64) -> Self {
        Self {
            estimator: MovingAverage::new(history),
            expected_rate: 0.0,
            threshold,
        }
    }
}

struct PollerShared {
    state: Mutex<PollerState>,
    cv: Condvar,
}

/// Background thread that services the driver in streaming mode.
///
/// The thread starts idle; the owner requests transitions and observes
/// the acknowledged states (`Idle`, `Exit`) under a bounded wait. The
/// loop reads the state variable lazily to keep lock traffic off the
/// poll path.
pub struct Poller {
    shared: Arc<PollerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn(
        driver: SharedDriver,
        buffer: Arc<AppBuffer>,
        watchdog: Arc<Mutex<WatchdogState>>,
        poll_rate: Duration,
    ) -> Self {
        let shared = Arc::new(PollerShared {
            state: Mutex::new(PollerState::Idle),
            cv: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || poll_loop(loop_shared, driver, buffer, watchdog, poll_rate))
            .ok();
        if handle.is_none() {
            error!("failed to spawn poller thread");
        }
        Self { shared, handle }
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn transit_to_running(&self) {
        let mut state = self.shared.state.lock().unwrap();
        *state = PollerState::Running;
    }

    /// Request idle and wait for the loop to acknowledge.
    pub fn transit_to_idle(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == PollerState::Exit {
            return;
        }
        *state = PollerState::PendIdle;
        let (state, timeout) = self
            .shared
            .cv
            .wait_timeout_while(state, TRANSITION_TIMEOUT, |s| *s != PollerState::Idle)
            .unwrap();
        drop(state);
        if timeout.timed_out() {
            warn!("poller did not acknowledge idle transition within 5 s");
        }
    }

    /// Request exit and join the thread. The join happens even when the
    /// acknowledgement window elapses.
    pub fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = PollerState::PendExit;
            let (state, timeout) = self
                .shared
                .cv
                .wait_timeout_while(state, TRANSITION_TIMEOUT, |s| *s != PollerState::Exit)
                .unwrap();
            drop(state);
            if timeout.timed_out() {
                warn!("poller did not acknowledge exit within 5 s, joining anyway");
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("poller thread panicked");
            }
        }
    }
}

fn poll_loop(
    shared: Arc<PollerShared>,
    driver: SharedDriver,
    buffer: Arc<AppBuffer>,
    watchdog: Arc<Mutex<WatchdogState>>,
    poll_rate: Duration,
) {
    let mut state = PollerState::Idle;
    // Start at the interval so the first iteration reads the real state.
    let mut check_counter = STATE_CHECK_INTERVAL;

    loop {
        check_counter += 1;
        if check_counter >= STATE_CHECK_INTERVAL {
            state = *shared.state.lock().unwrap();
            check_counter = 0;
        }

        if state == PollerState::Running {
            let poll_start = Instant::now();

            let result = driver.lock().unwrap().poll();
            if let Err(e) = result {
                error!("poll failed: {e}");
                // The consumer will disarm and rearm as needed.
                buffer.notify_data_ready(Some(e));
            }

            let (estimated, expected, threshold) = {
                let wd = watchdog.lock().unwrap();
                (
                    f64::from(wd.estimator.average()),
                    wd.expected_rate,
                    wd.threshold,
                )
            };
            if estimated < expected * threshold {
                error!("watchdog: estimated sample rate {estimated:.0} Hz, expected {expected:.0} Hz");
                buffer.notify_data_ready(Some(DaqError::Watchdog));
            }

            let elapsed = poll_start.elapsed();
            if poll_rate > elapsed {
                thread::sleep(poll_rate - elapsed);
            }
        } else {
            if state == PollerState::PendIdle {
                let mut shared_state = shared.state.lock().unwrap();
                *shared_state = PollerState::Idle;
                state = PollerState::Idle;
                drop(shared_state);
                shared.cv.notify_all();
            } else if state == PollerState::PendExit {
                let mut shared_state = shared.state.lock().unwrap();
                *shared_state = PollerState::Exit;
                drop(shared_state);
                shared.cv.notify_all();
                return;
            }

            thread::sleep(IDLE_SLEEP);
        }
    }
}

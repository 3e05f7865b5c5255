//! Cooperative worker thread with an atomic state word.
//!
//! Every long-running role in the gateway (tuner reader, RTP writer, RTCP
//! reporter, decrypt client, session sweeper) runs on one of these. The
//! owner drives it through the state word; the worker observes it at each
//! loop boundary, so all suspension points are explicit:
//!
//! ```text
//! Starting -> Started <-> (Pausing -> Paused) -> Stopping -> Stopped
//! ```
//!
//! `stop()` waits up to 5 s for the thread to exit, then detaches it.
//! `pause()` waits up to 2.5 s (50 × 50 ms) for the worker to observe the
//! transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PAUSE_POLL: Duration = Duration::from_millis(50);
const PAUSE_POLL_COUNT: u32 = 50;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Unknown = 0,
    Starting = 1,
    Started = 2,
    Pausing = 3,
    Paused = 4,
    Stopping = 5,
    Stopped = 6,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Stopping,
            6 => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// A named OS thread driven by a shared state word.
///
/// The tick closure runs once per loop iteration while the state is
/// `Started`; returning `false` stops the worker. Errors must not escape
/// the closure — workers absorb failures and continue or bail out cleanly.
pub struct Worker {
    name: String,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker running `tick` until stopped.
    pub fn spawn<F>(name: &str, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));
        let thread_state = state.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::trace!(worker = %thread_name, "worker entry");
                loop {
                    match WorkerState::from_u8(thread_state.load(Ordering::Acquire)) {
                        WorkerState::Starting => {
                            thread_state.store(WorkerState::Started as u8, Ordering::Release);
                        }
                        WorkerState::Started => {
                            if !tick() {
                                break;
                            }
                        }
                        WorkerState::Pausing => {
                            thread_state.store(WorkerState::Paused as u8, Ordering::Release);
                        }
                        WorkerState::Paused => {
                            thread::sleep(PAUSE_POLL);
                        }
                        _ => break,
                    }
                }
                thread_state.store(WorkerState::Stopped as u8, Ordering::Release);
                tracing::trace!(worker = %thread_name, "worker exit");
            })
            .expect("spawn worker thread");

        Worker {
            name: name.to_string(),
            state,
            handle: Some(handle),
        }
    }

    /// Current observed state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the thread is still running (any state before `Stopped`).
    pub fn running(&self) -> bool {
        !matches!(self.state(), WorkerState::Stopped | WorkerState::Unknown)
    }

    /// Ask the worker to pause and wait for it to comply.
    ///
    /// Returns `false` when the worker did not reach `Paused` within
    /// 50 × 50 ms.
    pub fn pause(&self) -> bool {
        match self.state() {
            WorkerState::Started | WorkerState::Starting => {
                self.state
                    .store(WorkerState::Pausing as u8, Ordering::Release);
            }
            WorkerState::Paused | WorkerState::Pausing => return true,
            _ => return false,
        }
        for _ in 0..PAUSE_POLL_COUNT {
            if self.state() == WorkerState::Paused {
                return true;
            }
            thread::sleep(PAUSE_POLL);
        }
        tracing::error!(worker = %self.name, "pause timeout");
        false
    }

    /// Resume a paused worker (also restarts the tick loop after `Starting`).
    pub fn resume(&self) {
        self.state
            .store(WorkerState::Started as u8, Ordering::Release);
    }

    /// Stop the worker: set `Stopping`, give the thread 5 s to exit, then
    /// detach it.
    pub fn stop(&mut self) {
        let current = self.state();
        if !matches!(current, WorkerState::Stopped | WorkerState::Unknown) {
            self.state
                .store(WorkerState::Stopping as u8, Ordering::Release);
        }
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + STOP_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::error!(worker = %self.name, "stop timeout, detaching thread");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#![allow(dead_code)]

use kqport::{Channel, Ready};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }

    condition()
}

/// Channel that records every callback it receives.
#[derive(Default)]
pub struct RecordingChannel {
    pub calls: Mutex<Vec<(Ready, bool)>>,
    pub closed: AtomicBool,
}

impl RecordingChannel {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn union(&self) -> Ready {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .fold(Ready::empty(), |acc, (ready, _)| acc | *ready)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for RecordingChannel {
    fn on_event(&self, ready: Ready, on_pool_thread: bool) {
        self.calls.lock().unwrap().push((ready, on_pool_thread));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

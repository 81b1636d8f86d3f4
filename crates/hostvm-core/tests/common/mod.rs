//! Shared fixtures for hostvm integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use hostvm_core::Runtime;

/// Runtime double that records every call it receives.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    pub boots: AtomicUsize,
    pub attaches: AtomicUsize,
    pub detaches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub refuse_boot: AtomicBool,
    pub refuse_attaches: AtomicUsize,
    pub boot_delay_ms: AtomicUsize,
}

#[derive(Debug)]
pub struct RecordingEnv {
    pub vm: &'static str,
    pub thread: ThreadId,
}

impl RecordingRuntime {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Runtime for RecordingRuntime {
    type Config = &'static str;
    type Handle = &'static str;
    type Env = RecordingEnv;
    type Error = String;

    fn boot(&self, config: &'static str) -> Result<&'static str, String> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        let delay = self.boot_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay as u64));
        }
        if self.refuse_boot.load(Ordering::SeqCst) {
            return Err(format!("{} refused to boot", config));
        }
        Ok(config)
    }

    fn attach_current_thread(&self, vm: &&'static str) -> Result<RecordingEnv, String> {
        let refused = self
            .refuse_attaches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err("attach refused".to_string());
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingEnv {
            vm: *vm,
            thread: thread::current().id(),
        })
    }

    fn detach_current_thread(&self, _vm: &&'static str, env: RecordingEnv) {
        assert_eq!(env.thread, thread::current().id());
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self, _vm: &'static str) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or five seconds pass.
pub fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

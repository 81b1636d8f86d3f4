//! In-process runtime double for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::queue::Job;
use crate::runtime::Runtime;

/// Counts every call and can be told to fail.
#[derive(Debug, Default)]
pub(crate) struct FakeRuntime {
    boots: AtomicUsize,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_boot: AtomicBool,
    panic_boot: AtomicBool,
    failing_attaches: AtomicUsize,
    panicking_attaches: AtomicUsize,
    panic_detach: AtomicBool,
    panic_shutdown: AtomicBool,
}

/// Environment of one attached thread.
#[derive(Debug)]
pub(crate) struct FakeEnv {
    pub(crate) vm: u64,
    pub(crate) thread: ThreadId,
}

impl FakeRuntime {
    pub(crate) fn fail_boots(&self, fail: bool) {
        self.fail_boot.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn panic_on_boot(&self, panic: bool) {
        self.panic_boot.store(panic, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_attaches(&self, count: usize) {
        self.failing_attaches.store(count, Ordering::SeqCst);
    }

    pub(crate) fn panic_next_attaches(&self, count: usize) {
        self.panicking_attaches.store(count, Ordering::SeqCst);
    }

    pub(crate) fn panic_on_detach(&self, panic: bool) {
        self.panic_detach.store(panic, Ordering::SeqCst);
    }

    pub(crate) fn panic_on_shutdown(&self, panic: bool) {
        self.panic_shutdown.store(panic, Ordering::SeqCst);
    }

    pub(crate) fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub(crate) fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub(crate) fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Runtime for FakeRuntime {
    type Config = u64;
    type Handle = u64;
    type Env = FakeEnv;
    type Error = String;

    fn boot(&self, config: u64) -> Result<u64, String> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if self.panic_boot.load(Ordering::SeqCst) {
            panic!("fake boot exploded");
        }
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err("boot refused".to_string());
        }
        Ok(config)
    }

    fn attach_current_thread(&self, handle: &u64) -> Result<FakeEnv, String> {
        let exploded = self
            .panicking_attaches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if exploded {
            panic!("fake attach exploded");
        }
        let refused = self
            .failing_attaches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err("attach refused".to_string());
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(FakeEnv {
            vm: *handle,
            thread: thread::current().id(),
        })
    }

    fn detach_current_thread(&self, _handle: &u64, env: FakeEnv) {
        assert_eq!(env.thread, thread::current().id(), "detached from a foreign thread");
        self.detaches.fetch_add(1, Ordering::SeqCst);
        if self.panic_detach.load(Ordering::SeqCst) {
            panic!("fake detach exploded");
        }
    }

    fn shutdown(&self, _handle: u64) {
        if self.panic_shutdown.load(Ordering::SeqCst) {
            panic!("fake shutdown exploded");
        }
        assert_eq!(
            self.attaches(),
            self.detaches(),
            "shutdown with threads still attached"
        );
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Box a closure as a job, fixing its argument type.
pub(crate) fn job(f: impl FnOnce(&mut FakeEnv) + Send + 'static) -> Job<FakeRuntime> {
    Box::new(f)
}

/// Poll `condition` until it holds or five seconds pass.
pub(crate) fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

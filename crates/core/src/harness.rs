//! Test harness abstraction: failure reporting plus LIFO cleanup.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use tracing::{debug, error};

/// A teardown callback. It receives the running test so it can inspect or
/// report failure without holding a reference to it.
pub type CleanupFn = Box<dyn FnOnce(&dyn TestHandle) + Send>;

pub trait TestHandle: Send + Sync {
    fn name(&self) -> &str;

    fn failed(&self) -> bool;

    /// Marks the test as failed without interrupting it.
    fn fail(&self, message: String);

    /// Queues `f`; callbacks run in reverse registration order.
    fn cleanup(&self, f: CleanupFn);
}

/// A named test run that owns its cleanup stack.
///
/// Cleanups are unwound by [`TestInstance::finish`] or, failing that, on
/// drop. Failures recorded through [`TestHandle::fail`] turn into a panic at
/// drop unless the thread is already panicking.
pub struct TestInstance {
    name: String,
    failed: AtomicBool,
    failures: Mutex<Vec<String>>,
    cleanups: Mutex<Vec<CleanupFn>>,
}

impl TestInstance {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            failed: AtomicBool::new(false),
            failures: Mutex::new(vec![]),
            cleanups: Mutex::new(vec![]),
        })
    }

    /// Runs every queued cleanup, most recent first.
    pub fn finish(&self) {
        loop {
            // the lock is released before the callback runs so it may queue more
            let next = self
                .cleanups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();

            let Some(cleanup) = next else {
                break;
            };

            cleanup(self);
        }
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drains the recorded failure messages.
    pub fn take_failures(&self) -> Vec<String> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl TestHandle for TestInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || thread::panicking()
    }

    fn fail(&self, message: String) {
        error!(test = %self.name, %message, "test marked as failed");

        self.failed.store(true, Ordering::SeqCst);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn cleanup(&self, f: CleanupFn) {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(f);

        debug!(test = %self.name, "cleanup registered");
    }
}

impl Drop for TestInstance {
    fn drop(&mut self) {
        self.finish();

        let failures = self.take_failures();

        if !failures.is_empty() && !thread::panicking() {
            panic!("test {} failed: {}", self.name, failures.join("; "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanups_run_in_reverse_order() {
        let test = TestInstance::new("lifo");
        let order = Arc::new(Mutex::new(vec![]));

        for i in 0..3 {
            let order = order.clone();
            test.cleanup(Box::new(move |_| order.lock().unwrap().push(i)));
        }

        assert_eq!(test.pending_cleanups(), 3);

        test.finish();

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(test.pending_cleanups(), 0);
    }

    #[test]
    fn cleanup_sees_failure() {
        let test = TestInstance::new("failing");
        let seen = Arc::new(AtomicBool::new(false));

        let flag = seen.clone();
        test.cleanup(Box::new(move |t| flag.store(t.failed(), Ordering::SeqCst)));

        test.fail("boom".into());
        test.finish();

        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(test.take_failures(), vec!["boom".to_string()]);
    }

    #[test]
    fn cleanup_may_queue_more_cleanups() {
        let test = TestInstance::new("nested");
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        test.cleanup(Box::new(move |t| {
            t.cleanup(Box::new(move |_| flag.store(true, Ordering::SeqCst)));
        }));

        test.finish();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "test dropped failed: late")]
    fn drop_panics_on_recorded_failure() {
        let test = TestInstance::new("dropped");
        test.fail("late".into());
    }
}

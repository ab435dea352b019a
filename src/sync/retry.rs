//! Rate-limited retry queue.
//!
//! A single worker thread drains tasks FIFO. Steady state: the next task
//! starts no sooner than `interval` (± jitter) after the previous one
//! completes. Failure: the SAME task is retried with exponential backoff
//! (`min_retry * factor^k` ± jitter, capped at `max_retry`) until it
//! succeeds. `push` appends at the tail, `unshift` at the head — the head
//! slot is how a forced conflict-override jumps the line. Before/after hooks
//! expose task boundaries for observability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub min_retry: Duration,
    pub max_retry: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: config.interval(),
            min_retry: config.min_retry(),
            max_retry: config.max_retry(),
            factor: config.retry_factor.max(1.0),
            jitter: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    fn jittered<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        let spread = 1.0 + self.jitter * (2.0 * rng.r#gen::<f64>() - 1.0);
        base.mul_f64(spread.max(0.0))
    }
}

pub(crate) struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.min_retry,
        }
    }

    pub(crate) fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.policy.jittered(self.current, rng);
        self.current = self
            .current
            .mul_f64(self.policy.factor)
            .min(self.policy.max_retry);
        delay
    }
}

/// A queued attempt: returns true when done, false to retry.
struct QueuedTask {
    label: &'static str,
    run: Box<dyn FnMut() -> bool + Send>,
}

type Hook = Box<dyn Fn(&'static str) + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    pub before: Option<Hook>,
    pub after: Option<Hook>,
}

struct Inner {
    queue: Mutex<VecDeque<QueuedTask>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Inner {
    fn pop_blocking(&self) -> Option<QueuedTask> {
        let mut queue = self.queue.lock().expect("retry queue mutex");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            queue = self
                .available
                .wait(queue)
                .expect("retry queue mutex");
        }
    }

    /// Interruptible sleep: returns early on shutdown.
    fn sleep(&self, duration: Duration) {
        let queue = self.queue.lock().expect("retry queue mutex");
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let _ = self
            .available
            .wait_timeout(queue, duration)
            .expect("retry queue mutex");
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

pub struct RetryQueue {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl RetryQueue {
    pub fn start(policy: RetryPolicy, hooks: Hooks) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("braid-retry".to_string())
            .spawn(move || run_worker(worker_inner, policy, hooks))
            .expect("spawn retry worker");
        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Enqueue at the tail.
    pub fn push(&self, label: &'static str, run: Box<dyn FnMut() -> bool + Send>) {
        let mut queue = self.inner.queue.lock().expect("retry queue mutex");
        queue.push_back(QueuedTask { label, run });
        drop(queue);
        self.inner.available.notify_all();
    }

    /// Enqueue at the head, ahead of everything already waiting.
    pub fn unshift(&self, label: &'static str, run: Box<dyn FnMut() -> bool + Send>) {
        let mut queue = self.inner.queue.lock().expect("retry queue mutex");
        queue.push_front(QueuedTask { label, run });
        drop(queue);
        self.inner.available.notify_all();
    }

    /// Enqueue a task producing a value and block until it succeeds.
    /// Returns `None` only when the queue shuts down first.
    pub fn call<T, F>(&self, label: &'static str, attempt: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        self.submit(label, attempt, false)
    }

    /// `call`, but at the head of the queue.
    pub fn call_front<T, F>(&self, label: &'static str, attempt: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        self.submit(label, attempt, true)
    }

    fn submit<T, F>(&self, label: &'static str, mut attempt: F, front: bool) -> Option<T>
    where
        T: Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let run = Box::new(move || match attempt() {
            Some(value) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        });
        if front {
            self.unshift(label, run);
        } else {
            self.push(label, run);
        }
        rx.recv().ok()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Ask the worker to stop without joining it. Queued tasks are dropped,
    /// which unblocks any caller waiting in `call`.
    pub fn request_stop(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner
            .queue
            .lock()
            .expect("retry queue mutex")
            .clear();
        self.inner.available.notify_all();
    }

    fn stop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(inner: Arc<Inner>, policy: RetryPolicy, hooks: Hooks) {
    let mut rng = rand::thread_rng();
    while let Some(mut task) = inner.pop_blocking() {
        if let Some(before) = &hooks.before {
            before(task.label);
        }
        let mut backoff = Backoff::new(policy);
        loop {
            if (task.run)() {
                break;
            }
            if inner.is_shut_down() {
                return;
            }
            let delay = backoff.next_delay(&mut rng);
            tracing::debug!(task = task.label, ?delay, "task failed, backing off");
            inner.sleep(delay);
            if inner.is_shut_down() {
                return;
            }
        }
        if let Some(after) = &hooks.after {
            after(task.label);
        }
        // Steady-state throttle between tasks.
        inner.sleep(policy.jittered(policy.interval, &mut rng));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            min_retry: Duration::from_millis(1),
            max_retry: Duration::from_millis(8),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        let mut backoff = Backoff::new(RetryPolicy {
            interval: Duration::from_millis(0),
            min_retry: Duration::from_millis(10),
            max_retry: Duration::from_millis(40),
            factor: 2.0,
            jitter: 0.0,
        });
        let mut rng = rand::thread_rng();
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(40));
    }

    #[test]
    fn failing_task_is_retried_until_it_succeeds() {
        let queue = RetryQueue::start(fast_policy(), Hooks::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let value = queue.call("flaky", move || {
            if seen.fetch_add(1, Ordering::SeqCst) < 3 {
                None
            } else {
                Some(42)
            }
        });
        assert_eq!(value, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        queue.shutdown();
    }

    #[test]
    fn tasks_run_in_order_and_unshift_jumps_the_line() {
        let queue = RetryQueue::start(fast_policy(), Hooks::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        // A slow first task keeps the worker busy while we queue the rest.
        let gate = Arc::new(AtomicBool::new(false));
        let first_attempts = Arc::new(AtomicUsize::new(0));
        let gate_in_task = Arc::clone(&gate);
        let first_seen = Arc::clone(&first_attempts);
        let log_a = Arc::clone(&log);
        queue.push(
            "first",
            Box::new(move || {
                first_seen.fetch_add(1, Ordering::SeqCst);
                if !gate_in_task.load(Ordering::SeqCst) {
                    return false;
                }
                log_a.lock().unwrap().push("first");
                true
            }),
        );
        // Wait until the worker holds "first" so the later entries really
        // queue behind it.
        while first_attempts.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let log_b = Arc::clone(&log);
        queue.push(
            "tail",
            Box::new(move || {
                log_b.lock().unwrap().push("tail");
                true
            }),
        );
        let log_c = Arc::clone(&log);
        queue.unshift(
            "head",
            Box::new(move || {
                log_c.lock().unwrap().push("head");
                true
            }),
        );
        gate.store(true, Ordering::SeqCst);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if log.lock().unwrap().len() == 3 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "tasks did not finish");
            std::thread::sleep(Duration::from_millis(2));
        }
        // The worker was already retrying "first" when the others were
        // queued, so it completes first; the unshifted task then runs ahead
        // of the tail.
        assert_eq!(*log.lock().unwrap(), vec!["first", "head", "tail"]);
        queue.shutdown();
    }

    #[test]
    fn hooks_fire_around_each_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let before_count = Arc::clone(&count);
        let after_count = Arc::clone(&count);
        let queue = RetryQueue::start(
            fast_policy(),
            Hooks {
                before: Some(Box::new(move |_| {
                    before_count.fetch_add(1, Ordering::SeqCst);
                })),
                after: Some(Box::new(move |_| {
                    after_count.fetch_add(10, Ordering::SeqCst);
                })),
            },
        );
        assert_eq!(queue.call("noop", || Some(())), Some(()));
        queue.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }
}

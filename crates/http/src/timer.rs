//! A single-shot timer that can be stopped and resumed without losing its
//! deadline.
//!
//! A connection conceptually has one timeout at a time, but that timeout
//! must survive being suspended while some other bounded operation runs
//! (for example a socket-level read during a handler's synchronous body
//! read). `stop` disarms the timer but keeps the recorded deadline;
//! `resume` re-arms it for whatever budget remains. `start` always resets
//! the deadline and supersedes any pending fire, which is what phase
//! transitions use since each phase has its own budget.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// A pausable single-shot timer.
///
/// The callback runs at most once per arming, on a runtime task. All three
/// operations are safe to call concurrently with the fire callback: a fire
/// whose generation has been superseded by a later `start`/`stop`/`resume`
/// is discarded.
///
/// Cloning is shallow; clones share the same deadline and callback.
#[derive(Clone)]
pub struct ResumableTimer {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    callback: Box<dyn Fn() + Send + Sync>,
}

struct State {
    deadline: Instant,
    generation: u64,
    armed: bool,
}

impl ResumableTimer {
    /// Creates a disarmed timer that will invoke `callback` when it fires.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { deadline: Instant::now(), generation: 0, armed: false }),
                callback: Box::new(callback),
            }),
        }
    }

    /// Arms the timer to fire once after `timeout`, resetting the deadline.
    /// Any previously pending fire is superseded.
    pub fn start(&self, timeout: Duration) {
        let (deadline, generation) = {
            let mut state = self.inner.state.lock().unwrap();
            state.deadline = Instant::now() + timeout;
            state.generation += 1;
            state.armed = true;
            (state.deadline, state.generation)
        };
        self.arm(deadline, generation);
    }

    /// Disarms the timer. The recorded deadline is retained for `resume`.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.generation += 1;
        state.armed = false;
    }

    /// Re-arms a stopped timer for the remainder of its budget. A deadline
    /// already in the past fires immediately.
    pub fn resume(&self) {
        let (deadline, generation) = {
            let mut state = self.inner.state.lock().unwrap();
            state.generation += 1;
            state.armed = true;
            (state.deadline, state.generation)
        };
        self.arm(deadline, generation);
    }

    /// Time remaining until the recorded deadline, zero if it has passed.
    pub fn remaining(&self) -> Duration {
        let state = self.inner.state.lock().unwrap();
        state.deadline.saturating_duration_since(Instant::now())
    }

    fn arm(&self, deadline: Instant, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut state = inner.state.lock().unwrap();
                if state.armed && state.generation == generation {
                    state.armed = false;
                    true
                } else {
                    false
                }
            };
            if fire {
                (inner.callback)();
            }
        });
    }
}

impl fmt::Debug for ResumableTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ResumableTimer")
            .field("armed", &state.armed)
            .field("deadline", &state.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer() -> (ResumableTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = ResumableTimer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let (timer, fired) = counting_timer();

        timer.start(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_previous_deadline() {
        let (timer, fired) = counting_timer();

        timer.start(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timer.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_resume_preserve_remaining_budget() {
        let (timer, fired) = counting_timer();

        timer.start(Duration::from_millis(150));
        tokio::time::advance(Duration::from_millis(100)).await;
        timer.stop();
        assert_eq!(timer.remaining(), Duration::from_millis(50));

        // stopped: the original deadline passes without a fire
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // ~30ms of the original budget is left after resuming
        timer.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_with_expired_deadline_fires_immediately() {
        let (timer, fired) = counting_timer();

        timer.start(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(40)).await;
        timer.stop();
        tokio::time::advance(Duration::from_millis(500)).await;

        timer.resume();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_most_once_per_arming() {
        let (timer, fired) = counting_timer();

        timer.start(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(200)).await;
        timer.resume();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // the resume re-armed an already-expired deadline: one extra fire,
        // not a burst
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}

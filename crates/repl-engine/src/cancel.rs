//! Cross-thread cancellation and cooperative sleep.
//!
//! The stop cell is a single shared integer.  The controlling side sets it to
//! 1; the module's interrupt check reads and clears it in one atomic step, so
//! each stop request interrupts exactly one in-flight call.  A request issued
//! between two polls stays set until the next poll.
//!
//! The sleep cell lets the module block for a bounded time without spinning,
//! while still being woken as soon as a stop is requested.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use log::trace;
use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Sleep cell: a generation counter guarded by a mutex, plus the condition
/// variable sleepers wait on.  Each wake bumps the generation.
#[derive(Debug, Default)]
struct SleepCell {
    generation: Mutex<u64>,
    signal: Condvar,
}

/// The shared cells between a controller and the execution thread.  Cloning
/// shares the cells, it does not copy them.
#[derive(Debug, Clone, Default)]
pub struct CancellationChannel {
    stop: Arc<AtomicI32>,
    sleep: Arc<SleepCell>,
}

impl CancellationChannel {
    /// Creates a channel with no stop pending.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a stop as requested and wakes any cooperative sleeper.
    pub fn request_stop(&self) {
        self.stop.store(1, Ordering::SeqCst);
        trace!("Stop requested.");
        self.wake();
    }

    /// The interrupt check: returns 1 if a stop was pending and clears it.
    #[inline]
    pub fn take_stop(&self) -> i32 {
        self.stop.swap(0, Ordering::SeqCst)
    }

    /// Peeks at the stop cell without clearing it.
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) != 0
    }

    /// Clears any pending stop.  Called at the start of every run.
    #[inline]
    pub fn reset(&self) {
        self.stop.store(0, Ordering::SeqCst);
    }

    /// Wakes every thread blocked in `sleep`.
    pub fn wake(&self) {
        if let Ok(mut generation) = self.sleep.generation.lock() {
            *generation = generation.wrapping_add(1);
        }
        self.sleep.signal.notify_all();
    }

    /// Blocks for up to `duration`.  Returns `true` if woken early, either by
    /// `wake` or because a stop is pending.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut generation = match self.sleep.generation.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        // Checked under the lock so a concurrent `request_stop` either is seen
        // here or bumps the generation while we wait.
        if self.is_stop_requested() {
            return true;
        }
        let start = *generation;

        while *generation == start {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            generation = match self.sleep.signal.wait_timeout(generation, deadline - now) {
                Ok((guard, _timeout)) => guard,
                Err(_) => return false,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stop_is_observed_exactly_once() {
        let channel = CancellationChannel::new();
        assert_eq!(channel.take_stop(), 0);
        channel.request_stop();
        assert_eq!(channel.take_stop(), 1);
        assert_eq!(channel.take_stop(), 0);
    }

    #[test]
    fn stop_between_polls_is_not_lost() {
        let channel = CancellationChannel::new();
        let remote = channel.clone();
        thread::spawn(move || remote.request_stop()).join().unwrap();
        assert!(channel.is_stop_requested());
        assert_eq!(channel.take_stop(), 1);
    }

    #[test]
    fn reset_discards_a_stale_stop() {
        let channel = CancellationChannel::new();
        channel.request_stop();
        channel.reset();
        assert_eq!(channel.take_stop(), 0);
    }

    #[test]
    fn sleep_times_out_without_a_wake() {
        let channel = CancellationChannel::new();
        let started = Instant::now();
        assert!(!channel.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn stop_wakes_a_sleeper_early() {
        let channel = CancellationChannel::new();
        let remote = channel.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request_stop();
        });
        let started = Instant::now();
        assert!(channel.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
        // Waking does not consume the stop.
        assert_eq!(channel.take_stop(), 1);
    }

    #[test]
    fn sleep_returns_at_once_if_stop_pending() {
        let channel = CancellationChannel::new();
        channel.request_stop();
        assert!(channel.sleep(Duration::from_secs(10)));
    }
}

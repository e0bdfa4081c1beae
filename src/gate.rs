use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Poll interval for the gated read; keeps every blocking wait on this path
/// a fixed-duration timed wait.
const PASS_POLL: Duration = Duration::from_millis(1);

/// Pause/resume gate for an in-flight reader, built on a one-permit counting
/// semaphore rather than a boolean flag so a pause takes effect against the
/// very next read:
///
/// - `pause` drains the permit count to zero; the next gated read blocks.
/// - `resume` posts the count back to exactly one only if it is below one,
///   so repeated resumes never accumulate permits.
/// - A gated read holds the permit for the duration of the read, which means
///   a pause issued during active consumption lands before the reader's next
///   pass.
#[derive(Debug, Default)]
pub struct PauseGate {
    permits: Mutex<u8>,
    resumed: Condvar,
}

fn lock(m: &Mutex<u8>) -> MutexGuard<'_, u8> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PauseGate {
    /// Starts resumed (one permit available).
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(1),
            resumed: Condvar::new(),
        }
    }

    /// Drains the semaphore to zero. Subsequent [`PauseGate::pass`] calls
    /// block until a resume.
    pub fn pause(&self) {
        let mut permits = lock(&self.permits);
        while *permits > 0 {
            *permits -= 1;
        }
    }

    /// Posts the semaphore back to exactly one, only if its current value is
    /// below one. Idempotent: back-to-back resumes leave one permit.
    pub fn resume(&self) {
        let mut permits = lock(&self.permits);
        if *permits < 1 {
            *permits = 1;
            self.resumed.notify_one();
        }
    }

    /// Runs `read` while holding the gate's permit, blocking first if the
    /// gate is paused. The permit is restored when the read completes.
    pub fn pass<R>(&self, read: impl FnOnce() -> R) -> R {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let (guard, _timeout) = self
                .resumed
                .wait_timeout(permits, PASS_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
        *permits -= 1;
        let value = read();
        *permits = 1;
        value
    }

    /// Non-blocking probe: runs `read` only if the gate is open.
    pub fn try_pass<R>(&self, read: impl FnOnce() -> R) -> Option<R> {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        let value = read();
        *permits = 1;
        Some(value)
    }

    /// Current permit count; never exceeds one.
    pub fn available(&self) -> u8 {
        *lock(&self.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_resume_does_not_accumulate() {
        let gate = PauseGate::new();
        gate.resume();
        gate.resume();
        assert_eq!(gate.available(), 1);
        gate.pause();
        assert_eq!(gate.available(), 0);
        gate.resume();
        gate.resume();
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn pause_blocks_try_pass_until_resume() {
        let gate = PauseGate::new();
        assert_eq!(gate.try_pass(|| 7), Some(7));
        gate.pause();
        assert_eq!(gate.try_pass(|| 7), None);
        gate.resume();
        assert_eq!(gate.try_pass(|| 7), Some(7));
    }
}

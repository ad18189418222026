//! Cancellable one-shot timers driven by an explicit clock.
//!
//! Nothing here reads the wall clock. The owner passes `now` in and asks
//! whether the deadline has passed, so debounce and confirmation races can be
//! replayed exactly in tests.

/// Milliseconds on the host's monotonic clock.
pub type Millis = u64;

/// A single pending deadline carrying a payload.
///
/// Scheduling replaces whatever was pending; cancelling an idle timer is a no-op.
#[derive(Debug, Clone)]
pub struct Timer<T> {
    pending: Option<(Millis, T)>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `delay` ms after `now`, returning the payload it replaced.
    pub fn schedule(&mut self, now: Millis, delay: Millis, payload: T) -> Option<T> {
        let deadline = now.saturating_add(delay);
        self.pending
            .replace((deadline, payload))
            .map(|(_, old)| old)
    }

    /// Disarm the timer. Returns the payload if something was pending.
    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|(_, payload)| payload)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Millis> {
        self.pending.as_ref().map(|(deadline, _)| *deadline)
    }

    pub fn payload(&self) -> Option<&T> {
        self.pending.as_ref().map(|(_, payload)| payload)
    }

    /// Fire the timer if its deadline is at or before `now`.
    pub fn take_due(&mut self, now: Millis) -> Option<T> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.cancel(),
            _ => None,
        }
    }
}

//! Mock helpers for resilience tests
//!
//! [`Script`] hands out a fixed sequence of outcomes, one per call, which is
//! how tests model "fails twice, then succeeds" providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared call counter
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    count: Arc<AtomicUsize>,
}

impl CallCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return the new total
    pub fn hit(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of calls recorded so far
    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Scripted sequence of outcomes
///
/// Each call to [`Script::next`] pops the next outcome. Once the script is
/// down to its last entry that entry is repeated forever.
#[derive(Debug, Clone)]
pub struct Script<T, E> {
    outcomes: Arc<Mutex<VecDeque<Result<T, E>>>>,
    calls: CallCounter,
}

impl<T: Clone, E: Clone> Script<T, E> {
    /// Create a script from an ordered list of outcomes
    pub fn new(outcomes: Vec<Result<T, E>>) -> Self {
        Self { outcomes: Arc::new(Mutex::new(outcomes.into())), calls: CallCounter::new() }
    }

    /// Script that fails `failures` times with `error`, then returns `value`
    pub fn fail_then_succeed(failures: usize, error: E, value: T) -> Self {
        let mut outcomes: Vec<Result<T, E>> = (0..failures).map(|_| Err(error.clone())).collect();
        outcomes.push(Ok(value));
        Self::new(outcomes)
    }

    /// Script that always fails with `error`
    pub fn always_fail(error: E) -> Self {
        Self::new(vec![Err(error)])
    }

    /// Take the next outcome
    ///
    /// # Panics
    ///
    /// Panics if the script was created empty.
    #[allow(clippy::expect_used)]
    pub fn next(&self) -> Result<T, E> {
        self.calls.hit();
        let mut outcomes = self.outcomes.lock();
        if outcomes.len() > 1 {
            outcomes.pop_front().expect("length checked above")
        } else {
            outcomes.front().cloned().expect("script must not be empty")
        }
    }

    /// Number of outcomes handed out so far
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates that the last scripted outcome repeats.
    ///
    /// Assertions:
    /// - Confirms the third and fourth calls both return `Ok(1)`.
    #[test]
    fn test_script_repeats_last_outcome() {
        let script: Script<u8, &str> = Script::fail_then_succeed(2, "down", 1);
        assert_eq!(script.next(), Err("down"));
        assert_eq!(script.next(), Err("down"));
        assert_eq!(script.next(), Ok(1));
        assert_eq!(script.next(), Ok(1));
        assert_eq!(script.calls(), 4);
    }

    /// Validates that clones share the same sequence.
    #[test]
    fn test_script_clones_share_state() {
        let script: Script<u8, &str> = Script::new(vec![Ok(1), Ok(2)]);
        let clone = script.clone();
        assert_eq!(script.next(), Ok(1));
        assert_eq!(clone.next(), Ok(2));
        assert_eq!(script.calls(), 2);
    }
}

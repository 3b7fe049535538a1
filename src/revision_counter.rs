use std::sync::Mutex;

use tracing::trace;

/// Gatekeeper for monotonically increasing revisions of a single logical stream, rejecting stale
///  or duplicate updates.
///
/// Revisions are free-running `i32` values that are expected to overflow eventually, so the
///  comparison is wrap-aware: a value from the lowest eighth of the value range following a
///  value from the highest eighth is treated as having crossed the wrap boundary.
pub trait RevisionCounter: Send + Sync {
    /// Returns `true` and stores the value if it is newer than the current one
    fn try_advance(&self, next: i32) -> bool;
}

const EIGHTH: i32 = 1 << 29;

#[derive(Default, Debug)]
pub struct RevisionCounterImpl {
    current: Mutex<Option<i32>>,
}

impl RevisionCounterImpl {
    pub fn new() -> RevisionCounterImpl {
        Default::default()
    }

    pub fn current(&self) -> Option<i32> {
        *self.current.lock().unwrap()
    }

    fn is_newer(current: i32, next: i32) -> bool {
        if next > current {
            return true;
        }
        next < i32::MIN + EIGHTH && current > i32::MAX - EIGHTH
    }
}

impl RevisionCounter for RevisionCounterImpl {
    fn try_advance(&self, next: i32) -> bool {
        let mut current = self.current.lock().unwrap();
        match *current {
            Some(c) if !Self::is_newer(c, next) => {
                trace!("rejecting revision {} as stale, current is {}", next, c);
                false
            }
            _ => {
                *current = Some(next);
                true
            }
        }
    }
}

//! Fault injection for the in-memory backends.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of upcoming calls that should fail.
#[derive(Debug, Default)]
pub struct FaultBudget(AtomicUsize);

impl FaultBudget {
    /// Make the next `n` calls fail.
    pub fn arm(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    /// Consume one failure if any are armed.
    pub fn trip(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_exactly_armed_times() {
        let f = FaultBudget::default();
        assert!(!f.trip());
        f.arm(2);
        assert!(f.trip());
        assert!(f.trip());
        assert!(!f.trip());
    }
}

use std::sync::Mutex;

/// Tracks the number of host threads currently inside a team region
/// (§3, §4.5). Protected by its own mutex, separate from the registry's
/// global-table mutex, so that team-begin, team-end, join, and the patch
/// gate all observe the same value without contending with statistics
/// updates.
pub struct ActiveThreads {
    count: Mutex<u64>,
}

impl ActiveThreads {
    pub fn new() -> ActiveThreads {
        ActiveThreads { count: Mutex::new(0) }
    }

    pub fn team_begin(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    pub fn team_end(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
    }

    /// Runs `f` only if the observed thread count is zero, with the
    /// mutex held for the duration of the check and the callback. This
    /// is the patch window gate (§5): the lock ensures no team-begin can
    /// race between the zero observation and the patch attempt.
    pub fn if_quiescent<F: FnOnce()>(&self, f: F) {
        let count = self.count.lock().unwrap();
        if *count == 0 {
            f();
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> u64 {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn starts_at_zero_and_runs_gate() {
        let threads = ActiveThreads::new();
        let ran = AtomicBool::new(false);
        threads.if_quiescent(|| ran.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn gate_is_skipped_while_a_team_is_active() {
        let threads = ActiveThreads::new();
        threads.team_begin();
        let ran = AtomicBool::new(false);
        threads.if_quiescent(|| ran.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        threads.team_end();
        threads.if_quiescent(|| ran.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn team_end_never_underflows() {
        let threads = ActiveThreads::new();
        threads.team_end();
        assert_eq!(threads.current(), 0);
    }
}

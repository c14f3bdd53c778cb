//! Failure/recovery hysteresis for one probe
//!
//! Turns a sequence of exit codes into at most one stable-failure event per
//! failure streak. A streak only ends with a stable recovery: enough
//! consecutive successes while failures are outstanding.

/// Event produced by [`Hysteresis::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Failures in the current streak exceeded the allowance.
    StableFailure,
    /// Required consecutive successes reached; the streak is over.
    StableRecovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hysteresis {
    allowed_failures: u32,
    recovery_successes: u32,
    total_failures: u64,
    failures_since_recovery: u32,
    recovery_attempt: u32,
    notified: bool,
}

impl Hysteresis {
    pub fn new(allowed_failures: u32, recovery_successes: u32) -> Self {
        Self {
            allowed_failures,
            recovery_successes,
            total_failures: 0,
            failures_since_recovery: 0,
            recovery_attempt: 0,
            notified: false,
        }
    }

    /// Feed one exit code.
    pub fn observe(&mut self, exit_code: i32) -> Option<Transition> {
        if exit_code != 0 {
            self.total_failures += 1;
            self.failures_since_recovery = self.failures_since_recovery.saturating_add(1);
            self.recovery_attempt = 0;

            if self.failures_since_recovery > self.allowed_failures && !self.notified {
                self.notified = true;
                return Some(Transition::StableFailure);
            }
            return None;
        }

        if self.failures_since_recovery == 0 {
            return None;
        }

        self.recovery_attempt += 1;
        if self.recovery_attempt >= self.recovery_successes {
            self.failures_since_recovery = 0;
            self.recovery_attempt = 0;
            self.notified = false;
            return Some(Transition::StableRecovery);
        }
        None
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn failures_since_recovery(&self) -> u32 {
        self.failures_since_recovery
    }

    pub fn recovery_attempt(&self) -> u32 {
        self.recovery_attempt
    }

    pub fn allowed_failures(&self) -> u32 {
        self.allowed_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_with_zero_allowance_notifies() {
        let mut h = Hysteresis::new(0, 1);
        assert_eq!(h.observe(2), Some(Transition::StableFailure));
        assert_eq!(h.failures_since_recovery(), 1);
    }

    #[test]
    fn test_second_failure_crosses_allowance_of_one() {
        let mut h = Hysteresis::new(1, 1);
        assert_eq!(h.observe(1), None);
        assert_eq!(h.observe(1), Some(Transition::StableFailure));
    }

    #[test]
    fn test_failure_then_success_recovers_below_threshold() {
        let mut h = Hysteresis::new(2, 1);
        assert_eq!(h.observe(1), None);
        assert_eq!(h.observe(0), Some(Transition::StableRecovery));
        assert_eq!(h.failures_since_recovery(), 0);
        assert_eq!(h.recovery_attempt(), 0);
        assert_eq!(h.total_failures(), 1);
    }

    #[test]
    fn test_notifies_once_per_streak() {
        let mut h = Hysteresis::new(0, 2);
        assert_eq!(h.observe(1), Some(Transition::StableFailure));
        assert_eq!(h.observe(1), None);
        assert_eq!(h.observe(0), None);
        assert_eq!(h.observe(1), None);
        assert_eq!(h.failures_since_recovery(), 3);
        assert_eq!(h.total_failures(), 3);
    }

    #[test]
    fn test_failure_resets_recovery_credit() {
        let mut h = Hysteresis::new(5, 3);
        h.observe(1);
        h.observe(0);
        h.observe(0);
        assert_eq!(h.recovery_attempt(), 2);
        h.observe(1);
        assert_eq!(h.recovery_attempt(), 0);
        assert_eq!(h.failures_since_recovery(), 2);
    }

    #[test]
    fn test_recovery_rearms_notification() {
        let mut h = Hysteresis::new(0, 1);
        assert_eq!(h.observe(1), Some(Transition::StableFailure));
        assert_eq!(h.observe(0), Some(Transition::StableRecovery));
        assert_eq!(h.observe(1), Some(Transition::StableFailure));
    }

    #[test]
    fn test_success_without_failures_is_quiet() {
        let mut h = Hysteresis::new(0, 1);
        for _ in 0..5 {
            assert_eq!(h.observe(0), None);
        }
        assert_eq!(h.recovery_attempt(), 0);
    }
}

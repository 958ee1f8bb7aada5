//! Retry policy: decides whether a failed task may run again.

/// Caller-supplied retry policy for failed tasks.
///
/// The core never retries on its own; `TaskQueue::retry` consults the policy
/// the caller hands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Whether a task that has been dispatched `attempts` times may run again.
    ///
    /// Example with max_retries=3:
    /// - attempts 1..=3: allowed
    /// - attempts 4 (first run + 3 retries): exhausted
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RetryPolicy::none(), 1, false)]
    #[case(RetryPolicy::new(1), 1, true)]
    #[case(RetryPolicy::new(1), 2, false)]
    #[case(RetryPolicy::default(), 3, true)]
    #[case(RetryPolicy::default(), 4, false)]
    fn retry_budget(#[case] policy: RetryPolicy, #[case] attempts: u32, #[case] allowed: bool) {
        assert_eq!(policy.allows(attempts), allowed);
    }
}

use std::time::Duration;

/// Hard ceiling on automatic reconnection attempts after a transport drop.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Lower bound for the first reconnection delay.
pub const MIN_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Bounded exponential backoff used after the transport drops.
///
/// Delays double on every attempt starting from `initial_delay`, so with the
/// attempt ceiling the sequence is strictly increasing and finite
/// (1s, 2s, 4s, 8s, 16s by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    initial_delay: Duration,
}

impl ReconnectPolicy {
    /// Build a policy, clamping `max_attempts` into `1..=5` and
    /// `initial_delay` to at least one second.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_RECONNECT_ATTEMPTS),
            initial_delay: initial_delay.max(MIN_INITIAL_DELAY),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Delay to wait before the zero-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(MAX_RECONNECT_ATTEMPTS);
        self.initial_delay.saturating_mul(1_u32 << shift)
    }

    /// Every delay this policy will use, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS, MIN_INITIAL_DELAY)
    }
}

//! Reconnect policy: capped exponential backoff with two-sided jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectOptions;

/// Computes the delay before each reconnect attempt in a burst.
///
/// The base delay grows as `initial_delay * multiplier^(attempt - 1)`,
/// capped at `max_delay`, so consecutive base delays never decrease
/// within a burst. Jitter multiplies by a uniform factor in
/// `[1 - f, 1 + f]` and the result is clamped back into
/// `[1ms, max_delay]` — never shorter than 1ms (which would spin),
/// never above the configured ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    options: ReconnectOptions,
    enabled: bool,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(options: ReconnectOptions) -> Self {
        let enabled = options.enabled;
        Self {
            options,
            enabled,
            attempt_count: 0,
        }
    }

    /// Advance to the next attempt and return its delay, or `None` when
    /// the policy says to stop (disabled, or attempts exhausted).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_reconnect() {
            return None;
        }

        self.attempt_count += 1;
        let mut delay = self.base_delay();
        if self.options.jitter_enabled && self.options.max_jitter_fraction > 0.0 {
            delay = self.jittered(delay);
        }
        Some(delay)
    }

    /// Whether another attempt is allowed.
    pub fn should_reconnect(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.options.max_attempts == 0 || self.attempt_count < self.options.max_attempts
    }

    /// Reset the burst. Called exactly when a new authenticated session
    /// is established.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Current attempt number (1-based after `next_delay`).
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disable (or re-enable) reconnection, e.g. on explicit disconnect.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn should_resubscribe(&self) -> bool {
        self.options.resubscribe_on_reconnect
    }

    fn base_delay(&self) -> Duration {
        if self.attempt_count <= 1 {
            return self.options.initial_delay;
        }
        let initial = self.options.initial_delay.as_millis() as f64;
        let grown = initial
            * self
                .options
                .backoff_multiplier
                .powi(self.attempt_count as i32 - 1);
        let capped = grown.min(self.options.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let f = self.options.max_jitter_fraction;
        let factor = 1.0 + rand::thread_rng().gen_range(-f..=f);
        let ms = (delay.as_millis() as f64 * factor) as u64;
        let ms = ms.clamp(1, self.options.max_delay.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max_attempts: u32) -> ReconnectOptions {
        ReconnectOptions {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            backoff_multiplier: 2.0,
            jitter_enabled: false,
            max_jitter_fraction: 0.25,
            max_attempts,
            resubscribe_on_reconnect: true,
        }
    }

    #[test]
    fn backoff_sequence_is_capped_and_non_decreasing() {
        let mut policy = ReconnectPolicy::new(options(5));
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
        // Sixth call refuses.
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 5);
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let mut policy = ReconnectPolicy::new(options(0));
        for _ in 0..1_000 {
            assert!(policy.next_delay().is_some());
        }
        assert_eq!(policy.attempt_count(), 1_000);
    }

    #[test]
    fn reset_restarts_the_burst() {
        let mut policy = ReconnectPolicy::new(options(0));
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn disabled_policy_refuses() {
        let mut policy = ReconnectPolicy::new(ReconnectOptions {
            enabled: false,
            ..options(0)
        });
        assert_eq!(policy.next_delay(), None);

        let mut policy = ReconnectPolicy::new(options(0));
        policy.set_enabled(false);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn jitter_stays_within_window_and_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectOptions {
            jitter_enabled: true,
            max_jitter_fraction: 0.25,
            ..options(0)
        });
        for attempt in 1..=50u32 {
            let delay = policy.next_delay().expect("unlimited").as_millis() as u64;
            let base = (100f64 * 2f64.powi(attempt as i32 - 1)).min(800.0);
            // One ms of slack absorbs the float-to-integer truncation.
            let low = ((base * 0.75) as u64).saturating_sub(1).max(1);
            assert!(delay >= low, "attempt {attempt}: {delay} < {low}");
            assert!(delay <= 800, "attempt {attempt}: {delay} > cap");
        }
    }

    #[test]
    fn jitter_never_drops_below_one_ms() {
        let mut policy = ReconnectPolicy::new(ReconnectOptions {
            initial_delay: Duration::from_millis(1),
            jitter_enabled: true,
            max_jitter_fraction: 1.0,
            ..options(0)
        });
        for _ in 0..100 {
            assert!(policy.next_delay().expect("unlimited") >= Duration::from_millis(1));
        }
    }
}

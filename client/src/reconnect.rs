//! Reconnection backoff for the agent

use std::time::Duration;

use tracing::debug;

use crate::config::ReconnectConfig;

/// Exponential backoff, doubling per failed attempt up to a ceiling.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        )
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::from_config(&ReconnectConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}

use std::{fmt::Debug, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Produces the delay schedule followed when reconnecting to a downed host.
pub trait ReconnectionPolicy: Send + Sync + Debug {
    /// A fresh, infinite schedule. Pools create a new one for each outage, so a
    /// successful reconnection resets the delays.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send>;
}

/// A lazy, infinite sequence of delays.
pub trait ReconnectionSchedule {
    /// The next delay to wait before an attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same delay before every attempt.
#[derive(Clone, Copy, Debug)]
pub struct ConstantReconnectionPolicy {
    /// The delay between attempts.
    pub delay: Duration,
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        struct Constant(Duration);
        impl ReconnectionSchedule for Constant {
            fn next_delay(&mut self) -> Duration {
                self.0
            }
        }
        Box::new(Constant(self.delay))
    }
}

/// Doubles the delay on each attempt up to a cap, with ±15% jitter so that many
/// clients reconnecting to the same node spread out.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialReconnectionPolicy {
    /// The delay of the first (non-zero) attempt.
    pub base_delay: Duration,
    /// The ceiling the delays grow to.
    pub max_delay: Duration,
    /// When set, the first attempt happens immediately.
    pub start_with_no_delay: bool,
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10 * 60),
            start_with_no_delay: true,
        }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ExponentialSchedule {
            base_ms: self.base_delay.as_millis() as u64,
            max_ms: self.max_delay.as_millis() as u64,
            start_with_no_delay: self.start_with_no_delay,
            index: if self.start_with_no_delay { -1 } else { 0 },
            rng: SmallRng::from_os_rng(),
        })
    }
}

struct ExponentialSchedule {
    base_ms: u64,
    max_ms: u64,
    start_with_no_delay: bool,
    index: i32,
    rng: SmallRng,
}

impl ExponentialSchedule {
    fn nominal(&self) -> u64 {
        if self.index >= 64 {
            return self.max_ms;
        }
        let doubled = (1u128 << self.index) * self.base_ms as u128;
        doubled.min(self.max_ms as u128) as u64
    }

    /// Jitter rules: 100-115% when sitting at the base delay (and the schedule did
    /// not start at zero), 85-100% once the cap is reached, ±15% in between. A zero
    /// delay is never jittered.
    fn jittered(&mut self, value_ms: u64) -> u64 {
        if value_ms == 0 {
            return 0;
        }
        let (low, spread) = if value_ms == self.base_ms && !self.start_with_no_delay {
            (1.0, 0.15)
        } else if value_ms == self.max_ms {
            (0.85, 0.15)
        } else {
            (0.85, 0.30)
        };
        let factor: f64 = low + self.rng.random::<f64>() * spread;
        (value_ms as f64 * factor).floor() as u64
    }
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        if self.index == -1 {
            self.index = 0;
            return Duration::ZERO;
        }
        let nominal = self.nominal();
        if self.index < 64 {
            self.index += 1;
        }
        Duration::from_millis(self.jittered(nominal))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy {
            delay: Duration::from_millis(250),
        };
        let mut schedule = policy.new_schedule();
        for _ in 0..10 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn zero_delay_is_emitted_only_when_starting_with_no_delay() {
        let policy = ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(256_000),
            start_with_no_delay: true,
        };
        let mut schedule = policy.new_schedule();
        assert_eq!(schedule.next_delay(), Duration::ZERO);
        assert_ne!(schedule.next_delay(), Duration::ZERO);

        let policy = ExponentialReconnectionPolicy {
            start_with_no_delay: false,
            ..policy
        };
        let mut schedule = policy.new_schedule();
        assert_ne!(schedule.next_delay(), Duration::ZERO);
    }

    #[test]
    fn delays_stay_within_jitter_bounds() {
        let policy = ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(256_000),
            start_with_no_delay: false,
        };
        for _ in 0..1000 {
            let mut schedule = policy.new_schedule();
            for i in 0..10u32 {
                let nominal = (2u64.pow(i) * 1000).min(256_000);
                let delay = schedule.next_delay().as_millis() as u64;
                let low = (nominal as f64 * 0.85).floor() as u64;
                let high = (nominal as f64 * 1.15).ceil() as u64;
                assert!(
                    (low..=high).contains(&delay),
                    "delay {} out of [{}, {}] at index {}",
                    delay,
                    low,
                    high,
                    i
                );
            }
        }
    }

    #[test]
    fn first_nonzero_base_delay_only_jitters_upward() {
        let policy = ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(256_000),
            start_with_no_delay: false,
        };
        for _ in 0..200 {
            let mut schedule = policy.new_schedule();
            let first = schedule.next_delay().as_millis() as u64;
            assert!((1000..=1150).contains(&first), "first delay {}", first);
        }
    }

    #[test]
    fn capped_delay_only_jitters_downward() {
        let policy = ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(4000),
            start_with_no_delay: false,
        };
        for _ in 0..200 {
            let mut schedule = policy.new_schedule();
            // Indexes 0 and 1; index 2 reaches the 4000ms cap.
            schedule.next_delay();
            schedule.next_delay();
            let capped = schedule.next_delay().as_millis() as u64;
            assert!((3400..=4000).contains(&capped), "capped delay {}", capped);
        }
    }

    #[test]
    fn index_64_and_beyond_yield_the_cap() {
        let policy = ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1_000_000),
            start_with_no_delay: false,
        };
        let mut schedule = policy.new_schedule();
        for _ in 0..80 {
            schedule.next_delay();
        }
        let late = schedule.next_delay().as_millis() as u64;
        assert!((850_000..=1_000_000).contains(&late));
    }
}

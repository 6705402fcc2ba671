use std::{
    fmt::Debug,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Generates the client-side default timestamp attached to mutating requests.
pub trait TimestampGenerator: Send + Sync + Debug {
    /// The next timestamp in microseconds since the epoch, or `None` to let the
    /// coordinator assign one.
    fn next(&self) -> Option<i64>;
}

/// Microsecond wall-clock timestamps, strictly monotonic within the process even when
/// the clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
}

impl MonotonicTimestampGenerator {
    /// Creates the generator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> Option<i64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self.last.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(next),
                Err(observed) => last = observed,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let generator = MonotonicTimestampGenerator::new();
        let mut previous = i64::MIN;
        for _ in 0..10_000 {
            let ts = generator.next().unwrap();
            assert!(ts > previous);
            previous = ts;
        }
    }
}

use std::{fmt::Debug, time::Duration};

/// Schedules parallel alternate-host executions for a request that is taking too
/// long. Only idempotent requests are ever speculated on.
pub trait SpeculativeExecutionPolicy: Send + Sync + Debug {
    /// A fresh plan for one request.
    fn new_plan(&self, keyspace: Option<&str>) -> Box<dyn SpeculativeExecutionPlan + Send>;
}

/// Yields the delay before each next speculative execution, or `None` to stop
/// spawning.
pub trait SpeculativeExecutionPlan {
    /// The delay until the next speculative execution should start.
    fn next_execution(&mut self) -> Option<Duration>;
}

/// Never speculates; the default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSpeculativeExecutionPolicy;

impl SpeculativeExecutionPolicy for NoSpeculativeExecutionPolicy {
    fn new_plan(&self, _keyspace: Option<&str>) -> Box<dyn SpeculativeExecutionPlan + Send> {
        struct Never;
        impl SpeculativeExecutionPlan for Never {
            fn next_execution(&mut self) -> Option<Duration> {
                None
            }
        }
        Box::new(Never)
    }
}

/// Starts up to `max_executions` extra executions, each `delay` after the previous
/// one.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSpeculativeExecutionPolicy {
    /// The delay before each speculative execution.
    pub delay: Duration,
    /// How many speculative executions may run per request.
    pub max_executions: usize,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn new_plan(&self, _keyspace: Option<&str>) -> Box<dyn SpeculativeExecutionPlan + Send> {
        struct Plan {
            delay: Duration,
            remaining: usize,
        }
        impl SpeculativeExecutionPlan for Plan {
            fn next_execution(&mut self) -> Option<Duration> {
                if self.remaining == 0 {
                    return None;
                }
                self.remaining -= 1;
                Some(self.delay)
            }
        }
        Box::new(Plan {
            delay: self.delay,
            remaining: self.max_executions,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_speculation_yields_nothing() {
        let mut plan = NoSpeculativeExecutionPolicy.new_plan(None);
        assert_eq!(plan.next_execution(), None);
    }

    #[test]
    fn constant_plan_yields_delay_up_to_max() {
        let policy = ConstantSpeculativeExecutionPolicy {
            delay: Duration::from_millis(100),
            max_executions: 2,
        };
        let mut plan = policy.new_plan(Some("ks"));
        assert_eq!(plan.next_execution(), Some(Duration::from_millis(100)));
        assert_eq!(plan.next_execution(), Some(Duration::from_millis(100)));
        assert_eq!(plan.next_execution(), None);
    }
}

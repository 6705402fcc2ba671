use std::{fmt::Debug, sync::Arc};

use crate::{
    error::{Error, WriteType},
    options::Consistency,
};

/// What the request handler should do with a retryable error.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    /// Try again, optionally at a different consistency. With `use_current_host` the
    /// same host is re-borrowed; if it has no usable connection the handler falls
    /// through to the next host in the plan.
    Retry {
        /// Overrides the request consistency for the retried attempt.
        consistency: Option<Consistency>,
        /// Whether to retry on the host that just failed.
        use_current_host: bool,
    },
    /// Surface the error to the caller.
    Rethrow,
    /// Swallow the error and report an empty result.
    Ignore,
}

impl RetryDecision {
    /// Retry on the next host of the plan.
    pub fn retry_next_host() -> Self {
        RetryDecision::Retry {
            consistency: None,
            use_current_host: false,
        }
    }

    /// Retry on the host that just failed.
    pub fn retry_current_host() -> Self {
        RetryDecision::Retry {
            consistency: None,
            use_current_host: true,
        }
    }
}

/// Request properties a retry policy may take into account.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct RetryContext {
    /// Whether the failed request was declared idempotent.
    pub is_idempotent: bool,
}

/// Decides whether a failed request is tried again. `nb_retry` is the number of
/// retries already performed for the request, across all hosts.
pub trait RetryPolicy: Send + Sync + Debug {
    /// The coordinator did not see enough live replicas.
    fn on_unavailable(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        required: i32,
        alive: i32,
        nb_retry: u32,
    ) -> RetryDecision;

    /// The coordinator timed out waiting for read replicas.
    fn on_read_timeout(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        nb_retry: u32,
    ) -> RetryDecision;

    /// The coordinator timed out waiting for write replicas.
    fn on_write_timeout(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: &WriteType,
        nb_retry: u32,
    ) -> RetryDecision;

    /// The request failed before a response arrived (connection error, client-side
    /// timeout, overloaded coordinator).
    fn on_request_error(&self, ctx: &RetryContext, error: &Error, nb_retry: u32) -> RetryDecision;
}

/// The default policy: retry once in the narrow cases where it is known safe, rethrow
/// everything else.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_unavailable(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        nb_retry: u32,
    ) -> RetryDecision {
        // A different coordinator may see a healthier set of replicas.
        if nb_retry == 0 {
            RetryDecision::retry_next_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_read_timeout(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        nb_retry: u32,
    ) -> RetryDecision {
        // Enough replicas answered but the data round was missing: the coordinator
        // will have it on a prompt retry.
        if nb_retry == 0 && received >= block_for && !data_present {
            RetryDecision::retry_current_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        _received: i32,
        _block_for: i32,
        write_type: &WriteType,
        nb_retry: u32,
    ) -> RetryDecision {
        // A batch-log write timing out means the batch was not applied; replaying it
        // is safe.
        if nb_retry == 0 && *write_type == WriteType::BatchLog {
            RetryDecision::retry_current_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(
        &self,
        _ctx: &RetryContext,
        _error: &Error,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::retry_next_host()
    }
}

/// Wraps a child policy and refuses to retry non-idempotent requests on errors where
/// the write may have been applied.
#[derive(Clone, Debug)]
pub struct IdempotenceAwareRetryPolicy {
    child: Arc<dyn RetryPolicy>,
}

impl IdempotenceAwareRetryPolicy {
    /// Wraps a child policy.
    pub fn new(child: Arc<dyn RetryPolicy>) -> Self {
        Self { child }
    }
}

impl RetryPolicy for IdempotenceAwareRetryPolicy {
    fn on_unavailable(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        required: i32,
        alive: i32,
        nb_retry: u32,
    ) -> RetryDecision {
        self.child
            .on_unavailable(ctx, consistency, required, alive, nb_retry)
    }

    fn on_read_timeout(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        nb_retry: u32,
    ) -> RetryDecision {
        self.child
            .on_read_timeout(ctx, consistency, received, block_for, data_present, nb_retry)
    }

    fn on_write_timeout(
        &self,
        ctx: &RetryContext,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: &WriteType,
        nb_retry: u32,
    ) -> RetryDecision {
        if ctx.is_idempotent {
            self.child
                .on_write_timeout(ctx, consistency, received, block_for, write_type, nb_retry)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, ctx: &RetryContext, error: &Error, nb_retry: u32) -> RetryDecision {
        if ctx.is_idempotent {
            self.child.on_request_error(ctx, error, nb_retry)
        } else {
            RetryDecision::Rethrow
        }
    }
}

/// Never retries; every error is surfaced to the application.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_unavailable(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_read_timeout(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        _received: i32,
        _block_for: i32,
        _data_present: bool,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _ctx: &RetryContext,
        _consistency: Consistency,
        _received: i32,
        _block_for: i32,
        _write_type: &WriteType,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_request_error(
        &self,
        _ctx: &RetryContext,
        _error: &Error,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CTX: RetryContext = RetryContext {
        is_idempotent: false,
    };
    const IDEMPOTENT: RetryContext = RetryContext {
        is_idempotent: true,
    };

    #[test]
    fn default_retries_unavailable_once_on_next_host() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_unavailable(&CTX, Consistency::Quorum, 2, 1, 0),
            RetryDecision::retry_next_host()
        );
        assert_eq!(
            policy.on_unavailable(&CTX, Consistency::Quorum, 2, 1, 1),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn default_read_timeout_retries_only_without_data() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_read_timeout(&CTX, Consistency::Quorum, 2, 2, false, 0),
            RetryDecision::retry_current_host()
        );
        assert_eq!(
            policy.on_read_timeout(&CTX, Consistency::Quorum, 2, 2, true, 0),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_read_timeout(&CTX, Consistency::Quorum, 1, 2, false, 0),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_read_timeout(&CTX, Consistency::Quorum, 2, 2, false, 1),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn default_write_timeout_retries_batch_log_only() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_write_timeout(&CTX, Consistency::Quorum, 0, 2, &WriteType::BatchLog, 0),
            RetryDecision::retry_current_host()
        );
        assert_eq!(
            policy.on_write_timeout(&CTX, Consistency::Quorum, 0, 2, &WriteType::Simple, 0),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn idempotence_wrapper_blocks_unsafe_retries() {
        let policy = IdempotenceAwareRetryPolicy::new(Arc::new(DefaultRetryPolicy));
        let error = crate::error::Error::connection_closed("test");

        assert_eq!(
            policy.on_request_error(&CTX, &error, 0),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_request_error(&IDEMPOTENT, &error, 0),
            RetryDecision::retry_next_host()
        );
        assert_eq!(
            policy.on_write_timeout(&CTX, Consistency::One, 0, 1, &WriteType::BatchLog, 0),
            RetryDecision::Rethrow
        );
        // Reads are forwarded regardless of idempotence.
        assert_eq!(
            policy.on_read_timeout(&CTX, Consistency::One, 1, 1, false, 0),
            RetryDecision::retry_current_host()
        );
    }
}

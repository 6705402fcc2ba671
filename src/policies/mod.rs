//! The pluggable policies governing request routing and recovery.
//!
//! Policies compose: the token-aware and allow-list load balancers wrap a child
//! policy, and the idempotence-aware retry policy wraps a child retry policy.

mod address_translation;
mod load_balancing;
mod reconnection;
mod retry;
mod speculative;
mod timestamp;

pub use address_translation::{AddressTranslator, IdentityAddressTranslator};
pub use load_balancing::{
    AllowListPolicy,
    DcAwareRoundRobinPolicy,
    DefaultLoadBalancingPolicy,
    LoadBalancingPolicy,
    QueryPlan,
    RequestInfo,
    RoundRobinPolicy,
    TokenAwarePolicy,
};
pub use reconnection::{
    ConstantReconnectionPolicy,
    ExponentialReconnectionPolicy,
    ReconnectionPolicy,
    ReconnectionSchedule,
};
pub use retry::{
    DefaultRetryPolicy,
    FallthroughRetryPolicy,
    IdempotenceAwareRetryPolicy,
    RetryContext,
    RetryDecision,
    RetryPolicy,
};
pub use speculative::{
    ConstantSpeculativeExecutionPolicy,
    NoSpeculativeExecutionPolicy,
    SpeculativeExecutionPlan,
    SpeculativeExecutionPolicy,
};
pub use timestamp::{MonotonicTimestampGenerator, TimestampGenerator};

//! Retry escalation and disposition planning.
//!
//! Both functions are pure so every retry/quarantine decision can be tested
//! without a broker.

use crate::error::HandlerError;
use crate::topology::Topology;

/// Outcome of the retry escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Quarantine,
}

/// Decide what to do with a job that has now failed `retry_count` times.
pub fn decide(retry_count: u32, max_retries: u32) -> RetryDecision {
    if retry_count < max_retries {
        RetryDecision::Retry
    } else {
        RetryDecision::Quarantine
    }
}

/// Terminal decision for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded.
    Acknowledge,
    /// Publish to the retry queue with this count, then acknowledge.
    RequeueRetry { retry_count: u32 },
    /// Publish to the dead-letter exchange with this count, then acknowledge.
    Quarantine { retry_count: u32 },
    /// Negative-acknowledge without requeue; the broker drops the message.
    Reject,
}

/// Plan the disposition of a delivery whose handler failed.
///
/// `retry_count` is the count carried by the failed delivery. Permanent
/// failures skip the retry budget entirely.
pub fn plan_failure(topology: &Topology, retry_count: u32, error: &HandlerError) -> Disposition {
    if !topology.retry_enabled || error.is_permanent() {
        return if topology.dlq_enabled {
            Disposition::Quarantine { retry_count }
        } else {
            Disposition::Reject
        };
    }

    let next = retry_count.saturating_add(1);
    match decide(next, topology.max_retries) {
        RetryDecision::Retry => Disposition::RequeueRetry { retry_count: next },
        RetryDecision::Quarantine => Disposition::Quarantine { retry_count: next },
    }
}

// WhatsApp Connection Manager — Retry Scheduler
//
// Features:
//   • Exponential backoff per category: min(base * 2^retry_count, cap)
//   • RETRY_DIFFERENT_APPROACH backs off from a larger base to a larger cap
//   • Global ceiling: once retry_count reaches max_retry_attempts every
//     decision becomes GIVE_UP
//   • Deterministic profile rotation: profiles[retry_count mod N]
// No jitter: delays and profiles are a pure function of (decision, count).

use super::config::ConnectionConfig;
use crate::atoms::types::RemediationDecision;
use std::time::Duration;

/// What the supervisor should do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    GiveUp,
    Retry {
        delay: Duration,
        decision: RemediationDecision,
        /// Index into the profile list for the next attempt.
        profile_index: usize,
        /// retry_count after this retry is scheduled.
        retry_count: u32,
    },
}

impl RetryPlan {
    pub fn is_give_up(&self) -> bool {
        matches!(self, RetryPlan::GiveUp)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retry_attempts: u32,
    simple: (u64, u64),
    different: (u64, u64),
    profile_count: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        RetryPolicy {
            max_retry_attempts: config.max_retry_attempts,
            simple: (config.simple_backoff_base_ms, config.simple_backoff_cap_ms),
            different: (
                config.different_approach_backoff_base_ms,
                config.different_approach_backoff_cap_ms,
            ),
            profile_count: config.profiles.len().max(1),
        }
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// Backoff for the retry that follows `retry_count` earlier retries.
    pub fn backoff(&self, decision: RemediationDecision, retry_count: u32) -> Duration {
        let (base_ms, cap_ms) = match decision {
            RemediationDecision::RetryDifferentApproach => self.different,
            _ => self.simple,
        };
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    pub fn profile_for(&self, retry_count: u32) -> usize {
        retry_count as usize % self.profile_count
    }

    /// Turn a classifier decision into a plan.
    /// `retry_count` is the count before this close; `current_profile` is the
    /// profile the closing attempt used (kept on RETRY_SIMPLE).
    pub fn plan(&self, decision: RemediationDecision, retry_count: u32, current_profile: usize) -> RetryPlan {
        if decision == RemediationDecision::GiveUp || retry_count >= self.max_retry_attempts {
            return RetryPlan::GiveUp;
        }
        let next_count = retry_count + 1;
        let profile_index = match decision {
            RemediationDecision::RetryDifferentApproach => self.profile_for(next_count),
            _ => current_profile % self.profile_count,
        };
        RetryPlan::Retry {
            delay: self.backoff(decision, retry_count),
            decision,
            profile_index,
            retry_count: next_count,
        }
    }
}

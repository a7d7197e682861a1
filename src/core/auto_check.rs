//! Automatic re-check scheduling
//!
//! In watch mode the synchronizer re-checks the card on a re-arming
//! single-shot timer. A full check (identity, recursive listing, diff)
//! is expensive over the card's wireless link, so when the previous pass
//! finished its thumbnails and the last full check is recent enough, only
//! the cheap "has anything changed" probe runs:
//!
//! - write-timestamp delta, on firmware that reports one
//! - the card's updated flag (op=102) otherwise

use crate::core::config::AutoCheckConfig;
use crate::core::error::Result;
use crate::device::identity::CardIdentity;
use crate::device::traits::CardApi;
use log::debug;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoCheckPolicy {
    pub interval: Duration,
    /// A full check runs at least this often
    pub full_check_ceiling: Duration,
    /// Delay after a failed cycle
    pub failure_backoff: Duration,
}

impl Default for AutoCheckPolicy {
    fn default() -> Self {
        Self::from(&AutoCheckConfig::default())
    }
}

impl From<&AutoCheckConfig> for AutoCheckPolicy {
    fn from(config: &AutoCheckConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            full_check_ceiling: Duration::from_secs(config.full_check_ceiling_secs),
            failure_backoff: Duration::from_secs(config.failure_backoff_secs),
        }
    }
}

impl AutoCheckPolicy {
    /// Delay before the next tick
    pub fn next_delay(&self, last_cycle_failed: bool) -> Duration {
        if last_cycle_failed {
            self.failure_backoff
        } else {
            self.interval
        }
    }
}

/// What the next tick should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPlan {
    Full,
    /// Ask the card whether anything changed; skip the pass if not
    Cheap,
}

/// Memory of the previous passes
#[derive(Debug, Clone, Default)]
pub struct AutoCheckState {
    last_full_check: Option<Instant>,
    thumbnails_complete: bool,
    /// Write timestamp at the last full check (when the card has one)
    write_timestamp: Option<i64>,
    supports_write_timestamp: bool,
}

impl AutoCheckState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, policy: &AutoCheckPolicy, now: Instant) -> CheckPlan {
        match self.last_full_check {
            Some(at) if self.thumbnails_complete && now.duration_since(at) <= policy.full_check_ceiling => {
                CheckPlan::Cheap
            }
            _ => CheckPlan::Full,
        }
    }

    /// A full check completed at `now` against `identity`
    pub fn record_full_check(&mut self, now: Instant, identity: &CardIdentity) {
        self.last_full_check = Some(now);
        self.supports_write_timestamp = identity.capabilities().can_get_write_timestamp;
        self.write_timestamp = identity.write_timestamp;
    }

    pub fn set_thumbnails_complete(&mut self, complete: bool) {
        self.thumbnails_complete = complete;
    }

    /// Forget everything, e.g. after a failure
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the card reports changes since the last full check
    pub async fn card_changed<C: CardApi>(
        &mut self,
        card: &C,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.supports_write_timestamp {
            let current = card.write_timestamp(cancel).await?;
            let changed = self.write_timestamp != Some(current);
            debug!(
                "Write timestamp {:?} -> {} ({})",
                self.write_timestamp,
                current,
                if changed { "changed" } else { "unchanged" }
            );
            return Ok(changed);
        }
        let updated = card.is_updated(cancel).await?;
        debug!("Card updated flag: {}", updated);
        Ok(updated)
    }
}

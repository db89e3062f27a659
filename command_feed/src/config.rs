use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease granted on receive.
    pub default_lease_duration_secs: u64,
    /// Upper bound for a single Pending checkpoint extension.
    pub max_lease_extension_secs: u64,
    /// A Complete checkpoint with more lease left than this defers its delete.
    pub deferred_delete_min_remaining_secs: u64,
    pub deferred_delete_max_delay_secs: u64,
    pub deferred_delete_min_delay_secs: u64,
    pub max_batch_size: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease_duration_secs: 5 * 60,
            max_lease_extension_secs: 30 * 24 * 60 * 60,
            deferred_delete_min_remaining_secs: 10 * 60,
            deferred_delete_max_delay_secs: 6 * 60 * 60,
            deferred_delete_min_delay_secs: 5,
            max_batch_size: 100,
        }
    }
}

impl LeaseConfig {
    pub fn default_lease_duration(&self) -> Duration {
        Duration::from_secs(self.default_lease_duration_secs)
    }

    pub fn deferred_delete_min_remaining(&self) -> Duration {
        Duration::from_secs(self.deferred_delete_min_remaining_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_lease_duration_secs == 0 {
            return Err(anyhow::anyhow!(
                "default_lease_duration_secs must be greater than zero"
            ));
        }
        if self.max_batch_size == 0 {
            return Err(anyhow::anyhow!("max_batch_size must be greater than zero"));
        }
        if self.deferred_delete_min_delay_secs > self.deferred_delete_max_delay_secs {
            return Err(anyhow::anyhow!(
                "deferred_delete_min_delay_secs must not exceed deferred_delete_max_delay_secs"
            ));
        }
        Ok(())
    }
}

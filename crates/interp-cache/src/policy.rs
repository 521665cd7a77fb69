use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_sec: u64,
    pub l1_capacity: usize,
    /// Zero disables the background sweeper.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_sec: u64,
    #[serde(default = "default_true")]
    pub warm_on_boot: bool,
    /// Zero disables periodic flushing; hits are then written on `drain`.
    #[serde(default = "default_hit_flush")]
    pub hit_flush_interval_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_sec: 7 * 24 * 60 * 60,
            l1_capacity: 1_000,
            sweep_interval_sec: default_sweep_interval(),
            warm_on_boot: true,
            hit_flush_interval_ms: default_hit_flush(),
        }
    }
}

impl CachePolicy {
    /// Entry lifetime; a `ttl_sec` past what `TimeDelta` can hold saturates.
    pub fn ttl(&self) -> TimeDelta {
        i64::try_from(self.ttl_sec)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn validate(&self) -> Result<(), String> {
        let representable = i64::try_from(self.ttl_sec)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .is_some();
        if !representable {
            return Err(format!("cache.ttl_sec {} is out of range", self.ttl_sec));
        }
        Ok(())
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_hit_flush() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_ttl_saturates_and_fails_validation() {
        let policy = CachePolicy {
            ttl_sec: u64::MAX,
            ..CachePolicy::default()
        };
        assert_eq!(policy.ttl(), TimeDelta::MAX);
        assert!(policy.validate().is_err());

        let policy = CachePolicy {
            ttl_sec: 10_000_000_000_000,
            ..CachePolicy::default()
        };
        assert_eq!(policy.ttl(), TimeDelta::MAX);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn default_policy_is_valid() {
        let policy = CachePolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.ttl(), TimeDelta::days(7));
    }
}

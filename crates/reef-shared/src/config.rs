//! TOML configuration for a shared log.
//!
//! Every section and field is optional; missing values take the defaults
//! below.

use std::path::Path;
use std::time::Duration;

use reef_placement::LagBackoff;
use serde::Deserialize;

use crate::ack::DEFAULT_ACK_CAPACITY;
use crate::error::SharedLogError;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SharedLogConfig {
    /// Replication targets and placement epoch.
    pub replication: ReplicationSection,
    /// Head exchange and fetch tuning.
    pub sync: SyncSection,
    /// Defaults for waiting on acknowledgements.
    pub persist: PersistSection,
    /// CPU-lag driven capacity adaptation.
    pub adaptive: AdaptiveSection,
}

/// `[replication]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Copies each entry should have across the network.
    pub min_replicas: usize,
    /// Declared capacity factor for replicators, in `[0, 1]`.
    pub factor: f64,
    /// Assignment epoch. Peers must agree on it to agree on ranges.
    pub epoch: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            factor: 1.0,
            epoch: 0,
        }
    }
}

/// `[sync]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Quiet period before a burst of head announcements is processed.
    pub debounce_ms: u64,
    /// Longest a batch waits under a steady stream of announcements.
    pub max_debounce_ms: u64,
    /// Timeout of one fetch attempt.
    pub fetch_timeout_ms: u64,
    /// Fetch attempts after the first.
    pub fetch_retries: u32,
    /// Delay after the first failed fetch; doubles per attempt.
    pub fetch_backoff_ms: u64,
    /// Upper bound on the fetch delay.
    pub max_backoff_ms: u64,
    /// Most entries returned in one response.
    pub max_response_entries: usize,
    /// Most ancestor generations returned beyond the requested entries.
    pub max_ancestor_depth: u32,
    /// Fetch rounds per announcement before a gap is left open.
    pub max_fetch_rounds: usize,
    /// Hashes remembered for routing fetches.
    pub route_hint_capacity: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            max_debounce_ms: 500,
            fetch_timeout_ms: 2_000,
            fetch_retries: 3,
            fetch_backoff_ms: 100,
            max_backoff_ms: 2_000,
            max_response_entries: 512,
            max_ancestor_depth: 64,
            max_fetch_rounds: 32,
            route_hint_capacity: 4_096,
        }
    }
}

impl SyncSection {
    /// Debounce quiet period.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }

    /// Debounce upper bound.
    pub fn max_debounce(&self) -> Duration {
        Duration::from_millis(self.max_debounce_ms)
    }
}

/// `[persist]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistSection {
    /// How long an append waits for acknowledgements when the caller gives
    /// no timeout.
    pub ack_timeout_ms: u64,
    /// Entries whose acknowledgements are remembered; the oldest are
    /// forgotten first.
    pub ack_capacity: usize,
}

impl Default for PersistSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            ack_capacity: DEFAULT_ACK_CAPACITY,
        }
    }
}

impl PersistSection {
    /// Default acknowledgement timeout.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// `[adaptive]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdaptiveSection {
    /// Adapt the advertised factor to measured timer lag.
    pub enabled: bool,
    /// Sampling interval.
    pub interval_ms: u64,
    /// Averaging window.
    pub window_ms: u64,
    /// Lag above which capacity shrinks.
    pub lag_threshold_ms: u64,
    /// Multiplier applied when shrinking.
    pub shrink: f64,
    /// Largest increase per step when recovering.
    pub grow_step: f64,
    /// Lowest factor adaptation may reach.
    pub floor: f64,
    /// Smallest factor change worth re-advertising.
    pub min_change: f64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        let curve = LagBackoff::default();
        Self {
            enabled: false,
            interval_ms: 1_000,
            window_ms: 10_000,
            lag_threshold_ms: curve.threshold.as_millis() as u64,
            shrink: curve.shrink,
            grow_step: curve.grow_step,
            floor: curve.floor,
            min_change: 0.01,
        }
    }
}

impl AdaptiveSection {
    /// Sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Averaging window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The lag curve these settings describe.
    pub fn backoff(&self) -> LagBackoff {
        LagBackoff {
            threshold: Duration::from_millis(self.lag_threshold_ms),
            shrink: self.shrink,
            grow_step: self.grow_step,
            floor: self.floor,
        }
    }
}

impl SharedLogConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SharedLogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SharedLogError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, SharedLogError> {
        toml::from_str(s).map_err(|e| SharedLogError::Config(e.to_string()))
    }
}

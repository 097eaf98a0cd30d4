/// Engine policy constants
///
/// Centralized defaults for the scheduling and reconciliation policies.
use serde::{Deserialize, Serialize};

/// Delay after a due instant before it is eligible to be marked missed
pub const DEFAULT_GRACE_MINUTES: i64 = 10;

/// Interval between missed-detection sweeps while the engine is running
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Symmetric tolerance around a resolved dose instant within which two
/// taken-events count as the same dose
pub const DEFAULT_DEDUP_WINDOW_MINUTES: i64 = 120;

/// How far back the missed sweep looks for unresolved due instants
pub const DEFAULT_MISSED_LOOKBACK_HOURS: i64 = 24;

/// Bound on every remote call issued by the engine
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Missed-count growth that triggers an adaptive cadence proposal
pub const DEFAULT_ADAPTIVE_MISSED_THRESHOLD: u32 = 3;

/// How far a chronically missed time-of-day is shifted, in minutes
pub const DEFAULT_ADAPTIVE_SHIFT_MINUTES: i64 = 60;

/// Occurrence history retained on the free tier, in days
pub const FREE_TIER_HISTORY_DAYS: i64 = 30;

/// Upper bound on the calendar-cadence forward scan, in days
pub const CALENDAR_SCAN_DAYS: i64 = 731;

/// Drift tolerated when matching an occurrence to a due instant, in seconds.
/// Covers clock skew between client- and server-resolved times; much tighter
/// than the dedup window, which is a user-facing policy.
pub const OCCURRENCE_MATCH_TOLERANCE_SECS: i64 = 60;

/// Subscription tier flag consumed by the engine. Gates history length
/// and export only; scheduling behavior is identical across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn history_days(&self) -> Option<i64> {
        match self {
            Tier::Free => Some(FREE_TIER_HISTORY_DAYS),
            Tier::Premium => None,
        }
    }

    pub fn can_export(&self) -> bool {
        matches!(self, Tier::Premium)
    }
}

/// Adaptive-cadence policy knobs. Pluggable: hosts may override the
/// defaults without touching the proposal algorithm.
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    /// Missed-count growth since the last adjustment that triggers a proposal
    pub missed_threshold: u32,
    /// Minutes the most-missed time-of-day is shifted later (wraps within the day)
    pub shift_minutes: i64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            missed_threshold: DEFAULT_ADAPTIVE_MISSED_THRESHOLD,
            shift_minutes: DEFAULT_ADAPTIVE_SHIFT_MINUTES,
        }
    }
}

/// Runtime policy bundle handed to the engine at construction.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    pub grace_minutes: i64,
    pub sweep_interval_secs: u64,
    pub dedup_window_minutes: i64,
    pub missed_lookback_hours: i64,
    pub adaptive: AdaptivePolicy,
    pub tier: Tier,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            grace_minutes: DEFAULT_GRACE_MINUTES,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            dedup_window_minutes: DEFAULT_DEDUP_WINDOW_MINUTES,
            missed_lookback_hours: DEFAULT_MISSED_LOOKBACK_HOURS,
            adaptive: AdaptivePolicy::default(),
            tier: Tier::Premium,
        }
    }
}

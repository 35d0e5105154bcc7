//! Configuration for the trading engine
//!
//! Flat config structs with defaults tuned for the scalp strategy.
//! Everything here can be overridden from the CLI or a settings file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution mode determines whether orders are simulated or sent to the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Simulated execution (no actual orders)
    Simulation,
    /// Live trading against the venue REST API
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Simulation
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "Simulation"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Order-flow analyzer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Rolling OFI history length used for mean/variance
    pub history_len: usize,

    /// Minimum samples before z-scores are emitted
    pub warmup: usize,

    /// Primary z-score threshold for a directional signal
    pub sigma_threshold: f64,

    /// VWAP window in closed bars
    pub vwap_window: usize,

    /// ATR window in closed bars
    pub atr_window: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            history_len: 100,
            warmup: 20,
            sigma_threshold: 1.5,
            vwap_window: 20,
            atr_window: 14,
        }
    }
}

/// Risk and position-sizing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of balance risked per trade at full confidence
    pub max_position_fraction: f64,

    /// Maximum simultaneously open positions
    pub max_open_positions: usize,

    /// Daily drawdown ratio that pauses trading for the rest of the day
    pub max_daily_drawdown: f64,

    /// Stop distance as a percent of entry when no better estimate exists
    pub default_stop_pct: f64,

    /// Target distance as a percent of entry when no better estimate exists
    pub default_target_pct: f64,

    /// Fixed notional the drawdown accumulator divides by.
    /// Inherited behavior: losses count as |pnl| / notional, not |pnl| / balance.
    pub drawdown_notional: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.02, // 2% risk per trade
            max_open_positions: 5,
            max_daily_drawdown: 0.10, // 10%
            default_stop_pct: 1.0,
            default_target_pct: 2.0,
            drawdown_notional: 1000.0,
        }
    }
}

/// Chase (cancel-and-reprice) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaseConfig {
    /// Passive attempts before falling back to a market order
    pub max_retries: u32,

    /// Per-attempt fill deadline
    #[serde(with = "duration_ms")]
    pub attempt_timeout: Duration,

    /// Order status poll interval
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Wait before re-reading an empty book
    #[serde(with = "duration_ms")]
    pub book_retry_delay: Duration,
}

impl Default for ChaseConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            attempt_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(200),
            book_retry_delay: Duration::from_millis(250),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Per-symbol cooldown between accepted entries
    #[serde(with = "duration_ms")]
    pub entry_cooldown: Duration,

    /// Minimum time a position is held before flow-driven exits apply
    #[serde(with = "duration_ms")]
    pub min_hold: Duration,

    /// Positions older than this are closed by the time-exit scan
    #[serde(with = "duration_ms")]
    pub max_hold: Duration,

    /// Stop/target/time-exit scan interval
    #[serde(with = "duration_ms")]
    pub scan_interval: Duration,

    /// Regime-model retrain interval
    #[serde(with = "duration_ms")]
    pub retrain_interval: Duration,

    /// Z-score magnitude that forces an exit against an open position
    pub reversal_sigma: f64,

    /// Minimum signal strength an entry must carry
    pub min_strength: f64,

    /// Accepted entry signals per day
    pub max_signals_per_day: u32,

    /// Recent signals kept for the presentation layer
    pub signal_feed_len: usize,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            entry_cooldown: Duration::from_secs(30),
            min_hold: Duration::from_secs(10),
            max_hold: Duration::from_secs(180),
            scan_interval: Duration::from_secs(10),
            retrain_interval: Duration::from_secs(4 * 3600),
            reversal_sigma: 0.6,
            min_strength: 0.6,
            max_signals_per_day: 100,
            signal_feed_len: 50,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: ExecutionMode,
    pub flow: FlowConfig,
    pub risk: RiskConfig,
    pub chase: ChaseConfig,
    pub trader: TraderConfig,
}

/// Serialize Durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

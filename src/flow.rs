//! Order-flow analyzer
//!
//! Turns consecutive top-of-book snapshots into an order-flow-imbalance
//! value (the Cont et al. construction), normalizes it against a bounded
//! rolling history, and combines the z-score with the VWAP fair-value
//! reference into a directional signal.
//!
//! The update path must never halt market-data processing: missing or
//! empty book sides yield 0.0, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::book::BookSnapshot;
use crate::config::FlowConfig;
use crate::execution::Side;
use crate::feed::Bar;

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Buy,
    Sell,
    None,
}

impl SignalDirection {
    pub fn to_side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Buy),
            Self::Sell => Some(Side::Sell),
            Self::None => None,
        }
    }
}

/// Feature snapshot carried on every signal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalFeatures {
    pub ofi: f64,
    pub z_score: f64,
    pub vwap: f64,
    /// Price distance from VWAP in percent
    pub vwap_dist_pct: f64,
    pub atr: f64,
}

/// A classified trading signal. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: SignalDirection,
    /// Confidence in [0, 1]
    pub strength: f64,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub features: SignalFeatures,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

impl Signal {
    fn none(symbol: &str, features: SignalFeatures) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: SignalDirection::None,
            strength: 0.0,
            entry: 0.0,
            stop: 0.0,
            target: 0.0,
            features,
            reason: String::new(),
            ts: Utc::now(),
        }
    }
}

/// Per-symbol state: the previous snapshot to diff against and the raw
/// OFI history used for normalization.
struct FlowState {
    bid_price: f64,
    bid_size: f64,
    ask_price: f64,
    ask_size: f64,
    history: VecDeque<f64>,
}

/// Rolling VWAP over closed bars
struct VwapTracker {
    window: usize,
    bars: VecDeque<(f64, f64)>, // (close * volume, volume)
}

impl VwapTracker {
    fn new(window: usize) -> Self {
        Self {
            window,
            bars: VecDeque::new(),
        }
    }

    fn push(&mut self, close: f64, volume: f64) {
        self.bars.push_back((close * volume, volume));
        if self.bars.len() > self.window {
            self.bars.pop_front();
        }
    }

    fn value(&self) -> Option<f64> {
        let total_vol: f64 = self.bars.iter().map(|(_, v)| v).sum();
        if total_vol <= 0.0 {
            return None;
        }
        let total_pv: f64 = self.bars.iter().map(|(pv, _)| pv).sum();
        Some(total_pv / total_vol)
    }
}

/// Rolling average true range over closed bars
struct AtrTracker {
    window: usize,
    prev_close: Option<f64>,
    ranges: VecDeque<f64>,
}

impl AtrTracker {
    fn new(window: usize) -> Self {
        Self {
            window,
            prev_close: None,
            ranges: VecDeque::new(),
        }
    }

    fn push(&mut self, bar: &Bar) {
        let tr = match self.prev_close {
            Some(pc) => (bar.high - bar.low)
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
            None => bar.high - bar.low,
        };
        self.prev_close = Some(bar.close);
        self.ranges.push_back(tr);
        if self.ranges.len() > self.window {
            self.ranges.pop_front();
        }
    }

    fn value(&self) -> Option<f64> {
        if self.ranges.len() < self.window {
            return None;
        }
        Some(self.ranges.iter().sum::<f64>() / self.ranges.len() as f64)
    }
}

/// Stateful analyzer, one `FlowState` per symbol
pub struct FlowAnalyzer {
    cfg: FlowConfig,
    default_stop_pct: f64,
    default_target_pct: f64,
    states: HashMap<String, FlowState>,
    vwaps: HashMap<String, VwapTracker>,
    atrs: HashMap<String, AtrTracker>,
}

impl FlowAnalyzer {
    pub fn new(cfg: FlowConfig, default_stop_pct: f64, default_target_pct: f64) -> Self {
        Self {
            cfg,
            default_stop_pct,
            default_target_pct,
            states: HashMap::new(),
            vwaps: HashMap::new(),
            atrs: HashMap::new(),
        }
    }

    /// Compute the order-flow imbalance implied by the move from the
    /// previous snapshot. The first observation for a symbol only seeds
    /// state and returns 0.0.
    pub fn update(&mut self, snap: &BookSnapshot) -> f64 {
        if !snap.is_valid() {
            return 0.0;
        }

        let state = match self.states.entry(snap.symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(FlowState {
                    bid_price: snap.bid_price,
                    bid_size: snap.bid_size,
                    ask_price: snap.ask_price,
                    ask_size: snap.ask_size,
                    history: VecDeque::new(),
                });
                return 0.0;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        // Bid side: price up = new aggressive buy interest, price down =
        // buyers withdrew.
        let e_n = if snap.bid_price > state.bid_price {
            snap.bid_size
        } else if snap.bid_price == state.bid_price {
            snap.bid_size - state.bid_size
        } else {
            -state.bid_size
        };

        // Ask side mirrors with the sign convention reversed: price down
        // = aggressive selling.
        let e_m = if snap.ask_price < state.ask_price {
            snap.ask_size
        } else if snap.ask_price == state.ask_price {
            snap.ask_size - state.ask_size
        } else {
            -state.ask_size
        };

        let ofi = e_n - e_m;

        state.bid_price = snap.bid_price;
        state.bid_size = snap.bid_size;
        state.ask_price = snap.ask_price;
        state.ask_size = snap.ask_size;
        state.history.push_back(ofi);
        if state.history.len() > self.cfg.history_len {
            state.history.pop_front();
        }

        ofi
    }

    /// Normalize an OFI value against the symbol's rolling history.
    /// Returns 0.0 until enough samples exist or when the market is flat.
    pub fn z_score(&self, symbol: &str, ofi: f64) -> f64 {
        let Some(state) = self.states.get(symbol) else {
            return 0.0;
        };
        let n = state.history.len();
        if n < self.cfg.warmup {
            return 0.0;
        }

        let mean = state.history.iter().sum::<f64>() / n as f64;
        let var = state
            .history
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        let std = var.sqrt();
        if std == 0.0 {
            return 0.0;
        }
        (ofi - mean) / std
    }

    /// Classify an OFI observation into a directional signal.
    ///
    /// Price below fair value with buy pressure is the strongest case;
    /// momentum in the direction of an already-stretched price is capped
    /// lower.
    pub fn classify(&self, symbol: &str, ofi: f64, price: f64, vwap: f64) -> Signal {
        let z = self.z_score(symbol, ofi);
        let atr = self.atr(symbol).unwrap_or(0.0);
        let features = SignalFeatures {
            ofi,
            z_score: z,
            vwap,
            vwap_dist_pct: if vwap > 0.0 {
                (price - vwap) / vwap * 100.0
            } else {
                0.0
            },
            atr,
        };

        let threshold = self.cfg.sigma_threshold;
        let (direction, strength, reason) = if z > threshold {
            if price < vwap {
                (
                    SignalDirection::Buy,
                    (z.abs() / 3.0).min(1.0),
                    format!("buy pressure below fair value (z={z:.2})"),
                )
            } else {
                (
                    SignalDirection::Buy,
                    (z.abs() / 4.0).min(0.7),
                    format!("buy momentum above fair value (z={z:.2})"),
                )
            }
        } else if z < -threshold {
            if price > vwap {
                (
                    SignalDirection::Sell,
                    (z.abs() / 3.0).min(1.0),
                    format!("sell pressure above fair value (z={z:.2})"),
                )
            } else {
                (
                    SignalDirection::Sell,
                    (z.abs() / 4.0).min(0.7),
                    format!("sell momentum below fair value (z={z:.2})"),
                )
            }
        } else {
            return Signal::none(symbol, features);
        };

        // Tight scalp levels: 0.8 ATR stop, 1.5 ATR target, percent
        // fallback when the ATR window has not filled yet.
        let (stop_dist, target_dist) = if atr > 0.0 {
            (atr * 0.8, atr * 1.5)
        } else {
            (
                price * self.default_stop_pct / 100.0,
                price * self.default_target_pct / 100.0,
            )
        };
        let (stop, target) = match direction {
            SignalDirection::Buy => (price - stop_dist, price + target_dist),
            SignalDirection::Sell => (price + stop_dist, price - target_dist),
            SignalDirection::None => unreachable!(),
        };

        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            strength,
            entry: price,
            stop,
            target,
            features,
            reason,
            ts: Utc::now(),
        }
    }

    /// Feed a closed bar into the VWAP and ATR trackers
    pub fn on_bar(&mut self, bar: &Bar) {
        self.vwaps
            .entry(bar.symbol.clone())
            .or_insert_with(|| VwapTracker::new(self.cfg.vwap_window))
            .push(bar.close, bar.volume);
        self.atrs
            .entry(bar.symbol.clone())
            .or_insert_with(|| AtrTracker::new(self.cfg.atr_window))
            .push(bar);
    }

    /// Rolling VWAP for the symbol, if any volume has been seen
    pub fn vwap(&self, symbol: &str) -> Option<f64> {
        self.vwaps.get(symbol).and_then(|v| v.value())
    }

    /// Rolling ATR for the symbol once the window has filled
    pub fn atr(&self, symbol: &str) -> Option<f64> {
        self.atrs.get(symbol).and_then(|a| a.value())
    }

    /// Drop per-symbol flow state. Must be called on reconnect so stale
    /// state cannot produce a spurious spike.
    pub fn reset(&mut self, symbol: &str) {
        self.states.remove(symbol);
    }
}

//! Position ledger
//!
//! Owns all open-position state and the day's statistics: position
//! sizing, open/close gates, drawdown accounting, and durable persistence
//! so a restart recovers exactly the prior open positions and today's
//! numbers. Mutated only from the orchestrator's single logical thread of
//! control; a preemptive runtime would need a mutex around the mutators.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::execution::Side;

pub use store::LedgerStore;

/// An open position. At most one per symbol at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_time: DateTime<Utc>,
    pub pnl: f64,
}

/// One calendar day of trading statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    /// Calendar date, `%Y-%m-%d`
    pub date: String,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    /// Sticky for the rest of the day once the drawdown gate trips
    pub paused: bool,
}

impl DailyStats {
    pub fn fresh(date: &str) -> Self {
        Self {
            date: date.to_string(),
            total_trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            paused: false,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.total_trades as f64
        }
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Open positions plus daily statistics, with write-through persistence
pub struct PositionLedger {
    cfg: RiskConfig,
    positions: HashMap<String, Position>,
    daily: DailyStats,
    store: Option<LedgerStore>,
}

impl PositionLedger {
    /// Create the ledger, recovering any persisted state. Today's stats
    /// row wins over a fresh one; prior-day rows never leak into today.
    pub fn new(cfg: RiskConfig, store: Option<LedgerStore>) -> Self {
        let date = today();
        let (daily, positions) = match &store {
            Some(s) => match s.load(&date) {
                Ok((stats, positions)) => {
                    if !positions.is_empty() {
                        info!(count = positions.len(), "recovered open positions");
                    }
                    (stats.unwrap_or_else(|| DailyStats::fresh(&date)), positions)
                }
                Err(e) => {
                    error!(error = %e, "ledger load failed, starting fresh");
                    (DailyStats::fresh(&date), HashMap::new())
                }
            },
            None => (DailyStats::fresh(&date), HashMap::new()),
        };

        Self {
            cfg,
            positions,
            daily,
            store,
        }
    }

    /// Persist stats and positions. Failure is logged; the in-memory
    /// ledger stays authoritative for the running process.
    pub fn persist(&mut self) {
        if let Some(store) = &mut self.store {
            if let Err(e) = store.save(&self.daily, &self.positions) {
                error!(error = %e, "ledger persist failed, a restart would lose recent state");
            }
        }
    }

    /// Start a fresh stats row when the calendar date changes, re-derived
    /// from the store rather than reset blindly.
    fn roll_date(&mut self) {
        let date = today();
        if self.daily.date == date {
            return;
        }
        info!(from = %self.daily.date, to = %date, "daily stats rollover");
        self.persist();
        self.daily = match &self.store {
            Some(s) => s
                .load(&date)
                .ok()
                .and_then(|(stats, _)| stats)
                .unwrap_or_else(|| DailyStats::fresh(&date)),
            None => DailyStats::fresh(&date),
        };
        self.persist();
    }

    /// Whether a new position may be opened for `symbol`.
    ///
    /// The drawdown check pauses trading for the rest of the day as a
    /// side effect; the pause does not lift if drawdown later shrinks.
    pub fn can_open(&mut self, symbol: &str) -> (bool, &'static str) {
        self.roll_date();

        if self.daily.paused {
            return (false, "paused by drawdown limit");
        }
        if self.positions.len() >= self.cfg.max_open_positions {
            return (false, "max open positions reached");
        }
        if self.positions.contains_key(symbol) {
            return (false, "position already open for symbol");
        }
        if self.daily.current_drawdown >= self.cfg.max_daily_drawdown {
            self.daily.paused = true;
            self.persist();
            return (false, "daily drawdown limit reached");
        }
        (true, "ok")
    }

    /// Risk-scaled position size, hard-capped at 10% of balance notional.
    /// A zero stop distance falls back to the default stop percentage.
    pub fn size(&self, balance: f64, entry: f64, stop: f64, confidence: f64) -> f64 {
        if balance <= 0.0 || entry <= 0.0 {
            return 0.0;
        }
        let risk_amount = balance * self.cfg.max_position_fraction * confidence.clamp(0.0, 1.0);
        let mut stop_dist = (entry - stop).abs();
        if stop_dist == 0.0 {
            stop_dist = entry * self.cfg.default_stop_pct / 100.0;
        }
        let qty = risk_amount / stop_dist;
        let max_qty = balance * 0.1 / entry;
        qty.min(max_qty)
    }

    /// Insert a new position keyed by symbol. Callers must gate through
    /// `can_open` first; a duplicate is a logged no-op, not an error.
    pub fn open(
        &mut self,
        symbol: &str,
        direction: Side,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) {
        if self.positions.contains_key(symbol) {
            warn!(%symbol, "open ignored: position already exists");
            return;
        }

        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                direction,
                entry_price,
                quantity,
                stop_loss,
                take_profit,
                entry_time: Utc::now(),
                pnl: 0.0,
            },
        );
        self.persist();
        info!(%symbol, %direction, entry_price, quantity, "position opened");
    }

    /// Close a position at `exit_price` and update the day's statistics.
    /// A symbol with no open position is a no-op.
    pub fn close(&mut self, symbol: &str, exit_price: f64) -> Option<f64> {
        let Some(pos) = self.positions.remove(symbol) else {
            warn!(%symbol, "close ignored: no open position");
            return None;
        };

        let pnl = match pos.direction {
            Side::Buy => (exit_price - pos.entry_price) * pos.quantity,
            Side::Sell => (pos.entry_price - exit_price) * pos.quantity,
        };

        self.roll_date();
        self.daily.total_trades += 1;
        self.daily.total_pnl += pnl;
        if pnl > 0.0 {
            self.daily.wins += 1;
        } else {
            self.daily.losses += 1;
            // Inherited accounting: losses accumulate against a fixed
            // notional, not the account balance.
            self.daily.current_drawdown += pnl.abs() / self.cfg.drawdown_notional;
            if self.daily.current_drawdown > self.daily.max_drawdown {
                self.daily.max_drawdown = self.daily.current_drawdown;
            }
        }

        self.persist();
        info!(%symbol, exit_price, pnl, "position closed");
        Some(pnl)
    }

    /// Snapshot of today's statistics
    pub fn daily_stats(&self) -> DailyStats {
        self.daily.clone()
    }

    /// Snapshot of every open position
    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).cloned()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> PositionLedger {
        PositionLedger::new(RiskConfig::default(), None)
    }

    fn ledger_with_store() -> PositionLedger {
        PositionLedger::new(RiskConfig::default(), Some(LedgerStore::in_memory().unwrap()))
    }

    #[test]
    fn size_respects_notional_cap() {
        let led = ledger();
        // Tiny stop distance would imply a huge size; the cap binds
        let qty = led.size(10_000.0, 100.0, 99.99, 1.0);
        assert!(qty <= 10_000.0 * 0.1 / 100.0 + 1e-12);

        // Wide stop: risk formula binds. 10000 * 0.02 * 0.5 / 5 = 20,
        // but the cap is 10, so still the cap
        let qty = led.size(10_000.0, 100.0, 95.0, 0.5);
        assert!((qty - 10.0).abs() < 1e-9);

        // Very wide stop where the risk formula is below the cap
        let qty = led.size(10_000.0, 100.0, 50.0, 1.0);
        assert!((qty - 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_stop_distance_falls_back_to_default_pct() {
        let led = ledger();
        let qty = led.size(10_000.0, 100.0, 100.0, 1.0);
        // 10000 * 0.02 / (100 * 1%) = 200, capped at 10
        assert!((qty - 10.0).abs() < 1e-9);
        assert!(qty.is_finite());
    }

    #[test]
    fn size_is_zero_for_bad_inputs() {
        let led = ledger();
        assert_eq!(led.size(0.0, 100.0, 99.0, 1.0), 0.0);
        assert_eq!(led.size(-5.0, 100.0, 99.0, 1.0), 0.0);
        assert_eq!(led.size(1000.0, 0.0, 99.0, 1.0), 0.0);
    }

    #[test]
    fn can_open_blocks_duplicates_and_max_positions() {
        let mut led = ledger();
        assert!(led.can_open("BTCUSDT").0);

        led.open("BTCUSDT", Side::Buy, 100.0, 1.0, 99.0, 102.0);
        let (ok, reason) = led.can_open("BTCUSDT");
        assert!(!ok);
        assert!(reason.contains("already open"));

        for i in 0..4 {
            led.open(&format!("SYM{i}"), Side::Buy, 100.0, 1.0, 99.0, 102.0);
        }
        let (ok, reason) = led.can_open("NEWSYM");
        assert!(!ok);
        assert!(reason.contains("max open positions"));
    }

    #[test]
    fn drawdown_breach_pauses_and_stays_paused() {
        let mut led = ledger();

        // One big loss: |pnl| / 1000 = 0.15 over the 0.10 cap
        led.open("BTCUSDT", Side::Buy, 100.0, 10.0, 99.0, 102.0);
        led.close("BTCUSDT", 85.0);
        assert!(led.daily_stats().current_drawdown >= 0.10);

        let (ok, reason) = led.can_open("ETHUSDT");
        assert!(!ok);
        assert!(reason.contains("drawdown"));
        assert!(led.daily_stats().paused);

        // A winning close does not lift the pause
        led.open("SOLUSDT", Side::Buy, 10.0, 1.0, 9.0, 12.0); // direct insert, gate bypassed
        led.close("SOLUSDT", 11.0);
        let (ok, reason) = led.can_open("ETHUSDT");
        assert!(!ok);
        assert_eq!(reason, "paused by drawdown limit");
    }

    #[test]
    fn close_without_position_is_a_noop() {
        let mut led = ledger();
        let before = led.daily_stats();
        assert!(led.close("BTCUSDT", 123.0).is_none());
        let after = led.daily_stats();
        assert_eq!(before.total_trades, after.total_trades);
        assert_eq!(before.total_pnl, after.total_pnl);
    }

    #[test]
    fn wins_plus_losses_equals_total() {
        let mut led = ledger();
        for (i, exit) in [(0, 105.0), (1, 95.0), (2, 101.0), (3, 100.0)] {
            let sym = format!("SYM{i}");
            led.open(&sym, Side::Buy, 100.0, 1.0, 90.0, 110.0);
            led.close(&sym, exit);
        }
        let stats = led.daily_stats();
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.wins + stats.losses, stats.total_trades);
        // Flat exit counts as a loss, not a win
        assert_eq!(stats.wins, 2);
    }

    #[test]
    fn short_pnl_is_directional() {
        let mut led = ledger();
        led.open("BTCUSDT", Side::Sell, 100.0, 2.0, 101.0, 95.0);
        let pnl = led.close("BTCUSDT", 97.0).unwrap();
        assert!((pnl - 6.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_open_is_ignored() {
        let mut led = ledger();
        led.open("BTCUSDT", Side::Buy, 100.0, 1.0, 99.0, 102.0);
        led.open("BTCUSDT", Side::Sell, 200.0, 2.0, 201.0, 195.0);

        let pos = led.position("BTCUSDT").unwrap();
        assert_eq!(pos.direction, Side::Buy);
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(led.open_count(), 1);
    }

    #[test]
    fn persist_and_reload_through_store() {
        let mut store = LedgerStore::in_memory().unwrap();
        {
            let mut led = PositionLedger::new(RiskConfig::default(), None);
            led.open("BTCUSDT", Side::Buy, 100.0, 1.5, 99.0, 102.0);
            led.open("ETHUSDT", Side::Sell, 50.0, 3.0, 51.0, 47.0);
            led.close("ETHUSDT", 49.0);
            store.save(&led.daily_stats(), &led.positions).unwrap();
        }

        let recovered = PositionLedger::new(RiskConfig::default(), Some(store));
        assert_eq!(recovered.open_count(), 1);
        let pos = recovered.position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, 1.5);
        assert_eq!(recovered.daily_stats().total_trades, 1);
        assert_eq!(recovered.daily_stats().wins, 1);
    }

    #[test]
    fn win_rate_derivation() {
        let mut stats = DailyStats::fresh("2026-08-06");
        assert_eq!(stats.win_rate(), 0.0);
        stats.total_trades = 4;
        stats.wins = 3;
        stats.losses = 1;
        assert!((stats.win_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn stats_survive_via_write_through() {
        let mut led = ledger_with_store();
        led.open("BTCUSDT", Side::Buy, 100.0, 1.0, 99.0, 102.0);
        led.close("BTCUSDT", 103.0);
        // Each mutation persisted; nothing further to flush
        assert_eq!(led.daily_stats().wins, 1);
    }
}

//! Trading orchestrator
//!
//! Single event loop that ties the subsystems together: book updates run
//! through the flow analyzer and entry gating, periodic timers scan for
//! stop/target/time exits and schedule regime retrains, and all ledger
//! mutation happens on this one logical thread of control. One symbol's
//! bad data never halts the loop for the others.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::book::{BookSnapshot, OrderBookStream};
use crate::config::TraderConfig;
use crate::execution::{ChaseOutcome, ExecutionEngine, Side};
use crate::feed::{Bar, FeedEvent};
use crate::flow::{FlowAnalyzer, Signal, SignalDirection};
use crate::ledger::{DailyStats, Position, PositionLedger};
use crate::regime::{RegimeLabel, RiskAdvisor, SharedRegime};

/// Bars retained per symbol for regime retraining
const BAR_HISTORY_LEN: usize = 500;

/// State exposed to the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub stats: DailyStats,
    pub win_rate: f64,
    pub positions: Vec<Position>,
    pub recent_signals: Vec<Signal>,
    pub signals_today: u32,
}

/// The coordination layer over flow analysis, execution, and the ledger
pub struct Trader {
    cfg: TraderConfig,
    book: OrderBookStream,
    flow: FlowAnalyzer,
    exec: ExecutionEngine,
    ledger: PositionLedger,
    regime: SharedRegime,
    advisor: Arc<dyn RiskAdvisor>,
    cooldowns: HashMap<String, Instant>,
    bar_history: HashMap<String, VecDeque<Bar>>,
    recent_signals: VecDeque<Signal>,
    signals_today: u32,
    signals_date: String,
    running: bool,
}

impl Trader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: TraderConfig,
        book: OrderBookStream,
        flow: FlowAnalyzer,
        exec: ExecutionEngine,
        ledger: PositionLedger,
        regime: SharedRegime,
        advisor: Arc<dyn RiskAdvisor>,
    ) -> Self {
        Self {
            cfg,
            book,
            flow,
            exec,
            ledger,
            regime,
            advisor,
            cooldowns: HashMap::new(),
            bar_history: HashMap::new(),
            recent_signals: VecDeque::new(),
            signals_today: 0,
            signals_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            running: false,
        }
    }

    /// Main loop: market-data events, the exit scan, and the retrain
    /// timer, until the feed closes or shutdown is requested.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut scan = interval_at(Instant::now() + self.cfg.scan_interval, self.cfg.scan_interval);
        let mut retrain = interval_at(
            Instant::now() + self.cfg.retrain_interval,
            self.cfg.retrain_interval,
        );
        self.running = true;
        info!("trader started");

        while self.running {
            tokio::select! {
                maybe = events.recv() => {
                    match maybe {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("feed channel closed");
                            break;
                        }
                    }
                }
                _ = scan.tick() => self.scan_positions().await,
                _ = retrain.tick() => self.schedule_retrain(),
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    pub async fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Book(snap) => self.on_book(snap).await,
            FeedEvent::Bar(bar) => self.on_bar(bar).await,
            FeedEvent::Reset(symbol) => {
                info!(%symbol, "feed reconnected, dropping flow state");
                self.flow.reset(&symbol);
            }
        }
    }

    /// Per-update analysis: flow computation, reversal exit, entry gating
    async fn on_book(&mut self, snap: BookSnapshot) {
        self.book.apply(snap.clone());

        let symbol = snap.symbol.clone();
        let ofi = self.flow.update(&snap);
        let z = self.flow.z_score(&symbol, ofi);

        // A strong opposing flow closes the position immediately,
        // bypassing the normal signal gating.
        if self.try_reversal_exit(&symbol, z, snap.mid()).await {
            return;
        }

        if self.ledger.has_position(&symbol) {
            return;
        }
        if let Some(last_entry) = self.cooldowns.get(&symbol) {
            if last_entry.elapsed() < self.cfg.entry_cooldown {
                return;
            }
        }

        self.roll_signal_date();
        if self.signals_today >= self.cfg.max_signals_per_day {
            return;
        }

        // No fair-value reference until bars have been seen
        let Some(vwap) = self.flow.vwap(&symbol) else {
            return;
        };

        let signal = self.flow.classify(&symbol, ofi, snap.mid(), vwap);
        if signal.direction == SignalDirection::None || signal.strength < self.cfg.min_strength {
            return;
        }

        let regime = self.regime.current().await;
        if regime.label == RegimeLabel::Volatile {
            debug!(%symbol, "entry blocked: volatile regime");
            return;
        }

        let (ok, reason) = self.ledger.can_open(&symbol);
        if !ok {
            warn!(%symbol, %reason, "entry blocked by risk gate");
            return;
        }

        self.try_entry(signal, regime.strength).await;
    }

    /// Exit an open position when flow turns against it beyond the
    /// reversal threshold, once the minimum hold window has passed.
    async fn try_reversal_exit(&mut self, symbol: &str, z: f64, price: f64) -> bool {
        let Some(pos) = self.ledger.position(symbol) else {
            return false;
        };

        let opposing = match pos.direction {
            Side::Buy => z <= -self.cfg.reversal_sigma,
            Side::Sell => z >= self.cfg.reversal_sigma,
        };
        if !opposing {
            return false;
        }

        let held = chrono::Utc::now() - pos.entry_time;
        if held.num_milliseconds() < self.cfg.min_hold.as_millis() as i64 {
            return false;
        }

        info!(%symbol, z, "flow reversal against position, exiting");
        self.close_position(&pos, price, "flow reversal").await
    }

    /// Size and execute an accepted entry signal
    async fn try_entry(&mut self, signal: Signal, regime_strength: f64) {
        let symbol = signal.symbol.clone();
        let Some(side) = signal.direction.to_side() else {
            return;
        };

        let Some(balance) = self.exec.balance().await else {
            warn!(%symbol, "entry skipped: balance unavailable");
            return;
        };

        // Advisory stop-width selection; falls back to the balanced
        // profile when no model is wired in.
        let observation = [
            signal.strength,
            (signal.features.z_score / 4.0).clamp(-1.0, 1.0),
            signal.features.vwap_dist_pct / 5.0,
            regime_strength,
            self.ledger.daily_stats().current_drawdown,
        ];
        let profile = self.advisor.predict(observation);
        let mult = profile.stop_multiplier();

        let (stop, target) = if signal.features.atr > 0.0 {
            let atr = signal.features.atr;
            match side {
                // 2:1 reward-to-risk around the profile-scaled stop
                Side::Buy => (signal.entry - atr * mult, signal.entry + atr * mult * 2.0),
                Side::Sell => (signal.entry + atr * mult, signal.entry - atr * mult * 2.0),
            }
        } else {
            (signal.stop, signal.target)
        };

        let quantity = self
            .ledger
            .size(balance.available, signal.entry, stop, signal.strength);
        if quantity <= 0.0 {
            debug!(%symbol, "entry skipped: zero size");
            return;
        }

        info!(
            %symbol, %side, strength = signal.strength, entry = signal.entry,
            stop, target, quantity, profile = ?profile, reason = %signal.reason,
            "executing entry"
        );

        match self.exec.chase(&symbol, side, quantity, &self.book).await {
            ChaseOutcome::Maker(order) | ChaseOutcome::Taker(order) => {
                let fill_price = if order.price > 0.0 { order.price } else { signal.entry };
                self.ledger
                    .open(&symbol, side, fill_price, quantity, stop, target);
                self.cooldowns.insert(symbol.clone(), Instant::now());
                self.signals_today += 1;
                self.push_signal(signal);
            }
            ChaseOutcome::Failed => {
                warn!(%symbol, "entry abandoned: chase and fallback both failed");
            }
        }
    }

    /// Kick off a regime retrain without blocking the event loop. The
    /// shared guard makes an overlapping tick a no-op.
    fn schedule_retrain(&self) {
        let regime = self.regime.clone();
        let history: Vec<Bar> = self
            .bar_history
            .values()
            .flat_map(|bars| bars.iter().cloned())
            .collect();
        if history.is_empty() {
            return;
        }
        tokio::spawn(async move {
            regime.retrain(history).await;
        });
    }

    /// Bar close: indicator trackers, regime refresh, retrain history
    async fn on_bar(&mut self, bar: Bar) {
        self.flow.on_bar(&bar);
        self.regime.refresh(&bar).await;

        let history = self.bar_history.entry(bar.symbol.clone()).or_default();
        history.push_back(bar);
        if history.len() > BAR_HISTORY_LEN {
            history.pop_front();
        }
    }

    /// Periodic stop/target/time-exit scan over all open positions
    pub async fn scan_positions(&mut self) {
        for pos in self.ledger.positions() {
            let Some(mark) = self.book.mid(&pos.symbol) else {
                continue;
            };

            let stop_hit = match pos.direction {
                Side::Buy => mark <= pos.stop_loss,
                Side::Sell => mark >= pos.stop_loss,
            };
            let target_hit = match pos.direction {
                Side::Buy => mark >= pos.take_profit,
                Side::Sell => mark <= pos.take_profit,
            };
            let held = chrono::Utc::now() - pos.entry_time;
            let expired = held.num_milliseconds() >= self.cfg.max_hold.as_millis() as i64;

            let reason = if stop_hit {
                "stop loss"
            } else if target_hit {
                "take profit"
            } else if expired {
                "max hold time"
            } else {
                continue;
            };

            self.close_position(&pos, mark, reason).await;
        }
    }

    /// Close one position with a market order and settle the ledger.
    /// A failed close order leaves the position for the next scan.
    async fn close_position(&mut self, pos: &Position, price: f64, reason: &str) -> bool {
        let exit_side = pos.direction.opposite();
        match self.exec.place_market(&pos.symbol, exit_side, pos.quantity).await {
            Some(_) => {
                let pnl = self.ledger.close(&pos.symbol, price);
                info!(symbol = %pos.symbol, price, ?pnl, %reason, "position exit");
                true
            }
            None => {
                warn!(symbol = %pos.symbol, %reason, "close order failed, will retry");
                false
            }
        }
    }

    /// Liquidate everything and halt. Individual close failures are
    /// tolerated; the remaining positions are still attempted.
    pub async fn emergency_stop(&mut self) {
        warn!("emergency stop: liquidating all positions");

        for pos in self.ledger.positions() {
            let exit_side = pos.direction.opposite();
            if self
                .exec
                .place_market(&pos.symbol, exit_side, pos.quantity)
                .await
                .is_none()
            {
                warn!(symbol = %pos.symbol, "emergency close failed, continuing");
                continue;
            }
            let mark = self.book.mid(&pos.symbol).unwrap_or(pos.entry_price);
            self.ledger.close(&pos.symbol, mark);
            self.exec.cancel_all(&pos.symbol).await;
        }

        self.running = false;
        self.ledger.persist();
        info!("emergency stop complete, trader halted");
    }

    /// Graceful drain: cancel resting orders, persist, stop
    async fn shutdown(&mut self) {
        info!("trader shutting down");
        self.running = false;
        for symbol in self.book.symbols() {
            self.exec.cancel_all(&symbol).await;
        }
        self.ledger.persist();

        let stats = self.ledger.daily_stats();
        info!(
            trades = stats.total_trades,
            wins = stats.wins,
            losses = stats.losses,
            pnl = stats.total_pnl,
            "daily summary"
        );
    }

    /// Snapshot for the presentation layer
    pub fn status(&self) -> StatusSnapshot {
        let stats = self.ledger.daily_stats();
        StatusSnapshot {
            win_rate: stats.win_rate(),
            stats,
            positions: self.ledger.positions(),
            recent_signals: self.recent_signals.iter().cloned().collect(),
            signals_today: self.signals_today,
        }
    }

    fn push_signal(&mut self, signal: Signal) {
        self.recent_signals.push_front(signal);
        if self.recent_signals.len() > self.cfg.signal_feed_len {
            self.recent_signals.pop_back();
        }
    }

    fn roll_signal_date(&mut self) {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        if date != self.signals_date {
            self.signals_date = date;
            self.signals_today = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChaseConfig, FlowConfig, RiskConfig};
    use crate::execution::SimBroker;
    use crate::ledger::LedgerStore;
    use crate::regime::{BalancedAdvisor, HoldDetector};
    use std::time::Duration;

    fn test_config() -> TraderConfig {
        TraderConfig {
            entry_cooldown: Duration::from_secs(30),
            min_hold: Duration::from_millis(0),
            max_hold: Duration::from_secs(180),
            scan_interval: Duration::from_secs(10),
            retrain_interval: Duration::from_secs(3600),
            reversal_sigma: 0.6,
            min_strength: 0.6,
            max_signals_per_day: 100,
            signal_feed_len: 50,
        }
    }

    fn test_trader(cfg: TraderConfig) -> Trader {
        let book = OrderBookStream::new();
        let flow = FlowAnalyzer::new(FlowConfig::default(), 1.0, 2.0);
        let chase = ChaseConfig {
            max_retries: 2,
            attempt_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            book_retry_delay: Duration::from_millis(5),
        };
        let exec = ExecutionEngine::new(Arc::new(SimBroker::new(10_000.0)), chase);
        let ledger = PositionLedger::new(
            RiskConfig::default(),
            Some(LedgerStore::in_memory().unwrap()),
        );
        let regime = SharedRegime::new(Arc::new(HoldDetector));
        Trader::new(cfg, book, flow, exec, ledger, regime, Arc::new(BalancedAdvisor))
    }

    fn snap(symbol: &str, bid: f64, bid_sz: f64, ask: f64, ask_sz: f64) -> BookSnapshot {
        BookSnapshot::new(symbol, bid, bid_sz, ask, ask_sz)
    }

    /// Seed quiet two-sided flow so the z-score history is warm but dull
    async fn warm_up(trader: &mut Trader, symbol: &str) {
        trader
            .handle_event(FeedEvent::Bar(Bar::new(symbol, 100.0, 100.6, 99.4, 100.0, 50.0)))
            .await;
        trader
            .handle_event(FeedEvent::Book(snap(symbol, 100.0, 2.0, 100.5, 2.0)))
            .await;
        for i in 0..30 {
            let d = if i % 2 == 0 { 0.01 } else { -0.01 };
            trader
                .handle_event(FeedEvent::Book(snap(symbol, 100.0 + d, 2.0, 100.5 + d, 2.0)))
                .await;
        }
    }

    #[tokio::test]
    async fn strong_imbalance_opens_a_position() {
        let mut trader = test_trader(test_config());
        warm_up(&mut trader, "BTCUSDT").await;
        assert_eq!(trader.ledger.open_count(), 0);

        // Big bid jump with heavy size: strongly positive order flow
        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 100.5, 80.0, 100.6, 2.0)))
            .await;

        assert_eq!(trader.ledger.open_count(), 1);
        let pos = trader.ledger.position("BTCUSDT").unwrap();
        assert_eq!(pos.direction, Side::Buy);
        assert_eq!(trader.signals_today, 1);
        assert_eq!(trader.status().recent_signals.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_back_to_back_entries() {
        let mut trader = test_trader(test_config());
        warm_up(&mut trader, "BTCUSDT").await;

        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 100.5, 80.0, 100.6, 2.0)))
            .await;
        assert_eq!(trader.ledger.open_count(), 1);

        // Flatten manually, then push another strong update inside the
        // cooldown window: no new entry.
        trader.ledger.close("BTCUSDT", 100.0);
        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 99.9, 90.0, 100.0, 2.0)))
            .await;

        assert_eq!(trader.ledger.open_count(), 0);
        assert_eq!(trader.signals_today, 1);
    }

    #[tokio::test]
    async fn reversal_flow_closes_open_position() {
        let mut trader = test_trader(test_config());
        warm_up(&mut trader, "BTCUSDT").await;

        trader
            .ledger
            .open("BTCUSDT", Side::Buy, 100.0, 1.0, 90.0, 110.0);

        // Heavy selling: bid collapses, ask price drops with size
        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 99.0, 1.0, 99.2, 70.0)))
            .await;

        assert_eq!(trader.ledger.open_count(), 0);
        assert_eq!(trader.ledger.daily_stats().total_trades, 1);
    }

    #[tokio::test]
    async fn min_hold_blocks_immediate_reversal_exit() {
        let mut trader = test_trader(TraderConfig {
            min_hold: Duration::from_secs(60),
            ..test_config()
        });
        warm_up(&mut trader, "BTCUSDT").await;

        trader
            .ledger
            .open("BTCUSDT", Side::Buy, 100.0, 1.0, 90.0, 110.0);
        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 99.0, 1.0, 99.2, 70.0)))
            .await;

        // Held for less than the minimum hold window: still open
        assert_eq!(trader.ledger.open_count(), 1);
    }

    #[tokio::test]
    async fn scan_applies_stop_and_time_exits() {
        let mut trader = test_trader(TraderConfig {
            max_hold: Duration::from_millis(0),
            ..test_config()
        });

        trader.book.apply(snap("BTCUSDT", 100.0, 1.0, 100.4, 1.0));
        trader
            .ledger
            .open("BTCUSDT", Side::Buy, 100.0, 1.0, 90.0, 110.0);

        // Neither stop nor target is hit, but max hold is zero
        trader.scan_positions().await;
        assert_eq!(trader.ledger.open_count(), 0);

        // Stop exit
        trader.book.apply(snap("ETHUSDT", 94.0, 1.0, 94.2, 1.0));
        trader
            .ledger
            .open("ETHUSDT", Side::Buy, 100.0, 1.0, 95.0, 110.0);
        trader.scan_positions().await;
        assert_eq!(trader.ledger.open_count(), 0);
        assert_eq!(trader.ledger.daily_stats().total_trades, 2);
    }

    #[tokio::test]
    async fn emergency_stop_flattens_everything_and_halts() {
        let mut trader = test_trader(test_config());
        trader.running = true;

        trader.book.apply(snap("BTCUSDT", 100.0, 1.0, 100.4, 1.0));
        trader
            .ledger
            .open("BTCUSDT", Side::Buy, 100.0, 1.0, 90.0, 110.0);
        trader
            .ledger
            .open("ETHUSDT", Side::Sell, 50.0, 2.0, 52.0, 45.0);

        trader.emergency_stop().await;

        assert_eq!(trader.ledger.open_count(), 0);
        assert!(!trader.running);
        assert_eq!(trader.ledger.daily_stats().total_trades, 2);
    }

    #[tokio::test]
    async fn volatile_regime_blocks_entries() {
        use crate::regime::{RegimeDetector, RegimeReading};
        use async_trait::async_trait;

        struct VolatileDetector;

        #[async_trait]
        impl RegimeDetector for VolatileDetector {
            fn detect(&self, _bar: &Bar) -> RegimeReading {
                RegimeReading {
                    label: RegimeLabel::Volatile,
                    strength: 1.0,
                }
            }
        }

        let mut trader = test_trader(test_config());
        trader.regime = SharedRegime::new(Arc::new(VolatileDetector));
        warm_up(&mut trader, "BTCUSDT").await;

        trader
            .handle_event(FeedEvent::Book(snap("BTCUSDT", 100.5, 80.0, 100.6, 2.0)))
            .await;

        assert_eq!(trader.ledger.open_count(), 0);
        assert_eq!(trader.signals_today, 0);
    }

    #[tokio::test]
    async fn status_reports_ledger_state() {
        let mut trader = test_trader(test_config());
        trader
            .ledger
            .open("BTCUSDT", Side::Buy, 100.0, 1.0, 99.0, 102.0);

        let status = trader.status();
        assert_eq!(status.positions.len(), 1);
        assert_eq!(status.stats.total_trades, 0);
        assert_eq!(status.win_rate, 0.0);
    }
}

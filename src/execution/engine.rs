//! Execution engine
//!
//! Places and actively manages orders through a `BrokerClient`. The chase
//! loop is the core: rest at the maker-favorable price, poll, cancel and
//! reprice on miss, and after the retry budget take liquidity so an
//! accepted signal is never silently dropped.

use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::book::OrderBookStream;
use crate::config::ChaseConfig;

use super::broker::{Balance, BrokerClient};
use super::order::{Order, OrderStatus, Side};

/// How a chase concluded
#[derive(Debug, Clone)]
pub enum ChaseOutcome {
    /// A passive limit order filled
    Maker(Order),
    /// The retry budget ran out and the market fallback was used
    Taker(Order),
    /// Even the market fallback failed (venue unreachable)
    Failed,
}

impl ChaseOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            Self::Maker(o) | Self::Taker(o) => Some(o),
            Self::Failed => None,
        }
    }
}

/// Order lifecycle manager over a single broker
pub struct ExecutionEngine {
    broker: Arc<dyn BrokerClient>,
    chase: ChaseConfig,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn BrokerClient>, chase: ChaseConfig) -> Self {
        Self { broker, chase }
    }

    /// Place a post-only limit order. Broker failures are logged and
    /// surfaced as `None`, never raised.
    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> Option<Order> {
        match self
            .broker
            .place_limit(symbol, side, quantity, price, post_only)
            .await
        {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(%symbol, %side, quantity, price, error = %e, "limit order failed");
                None
            }
        }
    }

    /// Place a market order (last resort)
    pub async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> Option<Order> {
        match self.broker.place_market(symbol, side, quantity).await {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(%symbol, %side, quantity, error = %e, "market order failed");
                None
            }
        }
    }

    /// Cancel a single order, tolerating failure
    pub async fn cancel(&self, symbol: &str, order_id: &str) {
        if let Err(e) = self.broker.cancel(symbol, order_id).await {
            warn!(%symbol, id = %order_id, error = %e, "cancel failed");
        }
    }

    /// Cancel every resting order for the symbol, tolerating failure
    pub async fn cancel_all(&self, symbol: &str) {
        if let Err(e) = self.broker.cancel_all(symbol).await {
            warn!(%symbol, error = %e, "cancel all failed");
        }
    }

    /// Current venue-side status of an order
    pub async fn order_status(&self, symbol: &str, order_id: &str) -> OrderStatus {
        match self.broker.order_status(symbol, order_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%symbol, id = %order_id, error = %e, "status query failed");
                OrderStatus::Unknown
            }
        }
    }

    /// Account balance; `None` on broker failure
    pub async fn balance(&self) -> Option<Balance> {
        match self.broker.balance().await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(error = %e, "balance query failed");
                None
            }
        }
    }

    /// Free balance available for new positions
    pub async fn available_balance(&self) -> Option<f64> {
        self.balance().await.map(|b| b.available)
    }

    /// Chase a fill: repeatedly rest a post-only limit at the current
    /// maker-favorable price, falling back to a market order once the
    /// retry budget is exhausted.
    ///
    /// Each attempt is one pass of the state machine: quote, place, poll
    /// until the per-attempt deadline or a terminal status, then either
    /// return the fill or cancel defensively and reprice. An empty book
    /// waits briefly without consuming an attempt.
    pub async fn chase(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        book: &OrderBookStream,
    ) -> ChaseOutcome {
        let mut attempts = 0u32;

        while attempts < self.chase.max_retries {
            let Some(price) = book.best_price(symbol, side) else {
                debug!(%symbol, "no book for chase quote, waiting");
                sleep(self.chase.book_retry_delay).await;
                continue;
            };

            let Some(order) = self.place_limit(symbol, side, quantity, price, true).await else {
                attempts += 1;
                continue;
            };

            debug!(
                %symbol, %side, price, attempt = attempts + 1,
                max = self.chase.max_retries, id = %order.id, "chase attempt resting"
            );

            match self.poll_until_terminal(symbol, &order).await {
                OrderStatus::Filled => {
                    let mut filled = order;
                    filled.status = OrderStatus::Filled;
                    info!(%symbol, %side, price, id = %filled.id, "chase filled passively");
                    return ChaseOutcome::Maker(filled);
                }
                status => {
                    debug!(%symbol, id = %order.id, %status, "chase attempt missed");
                    // Best-effort: the venue may have already filled or
                    // expired it, a failed cancel must not abort the loop.
                    if let Err(e) = self.broker.cancel(symbol, &order.id).await {
                        debug!(%symbol, id = %order.id, error = %e, "defensive cancel failed");
                    }
                    attempts += 1;
                }
            }
        }

        warn!(
            %symbol, %side, quantity, retries = self.chase.max_retries,
            "chase exhausted, falling back to market order"
        );
        match self.place_market(symbol, side, quantity).await {
            Some(order) => ChaseOutcome::Taker(order),
            None => ChaseOutcome::Failed,
        }
    }

    /// Poll order status until it is terminal or the attempt deadline passes
    async fn poll_until_terminal(&self, symbol: &str, order: &Order) -> OrderStatus {
        let deadline = Instant::now() + self.chase.attempt_timeout;

        loop {
            sleep(self.chase.poll_interval).await;

            let status = match self.broker.order_status(symbol, &order.id).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%symbol, id = %order.id, error = %e, "status poll failed");
                    OrderStatus::Unknown
                }
            };

            if status.is_terminal() {
                return status;
            }
            if Instant::now() >= deadline {
                return status;
            }
        }
    }
}

//! Simulated broker
//!
//! Synthesizes orders with deterministic canned values: limit orders come
//! back NEW, market orders and status polls report FILLED, balances are a
//! fixed default. Higher layers run the exact code path they run live.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use super::broker::{Balance, BrokerClient, BrokerResult};
use super::order::{Order, OrderStatus, Side};

static ORDER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Paper-trading broker with an in-memory active-order map
pub struct SimBroker {
    default_balance: f64,
    active_orders: Mutex<HashMap<String, Order>>,
}

impl SimBroker {
    pub fn new(default_balance: f64) -> Self {
        info!(balance = default_balance, "simulation broker active, no orders leave the process");
        Self {
            default_balance,
            active_orders: Mutex::new(HashMap::new()),
        }
    }

    fn next_order_id() -> String {
        let n = ORDER_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("SIM-{n}")
    }

    /// Resting orders currently tracked (test/inspection hook)
    pub fn open_order_count(&self) -> usize {
        self.active_orders.lock().expect("sim order lock").len()
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> BrokerResult<Order> {
        let order = Order::new(Self::next_order_id(), symbol, side, quantity, price);
        debug!(
            id = %order.id, %symbol, %side, quantity, price, post_only,
            "sim limit order placed"
        );
        self.active_orders
            .lock()
            .expect("sim order lock")
            .insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> BrokerResult<Order> {
        let mut order = Order::new(Self::next_order_id(), symbol, side, quantity, 0.0);
        order.status = OrderStatus::Filled;
        debug!(id = %order.id, %symbol, %side, quantity, "sim market order filled");
        Ok(order)
    }

    async fn cancel(&self, _symbol: &str, order_id: &str) -> BrokerResult<()> {
        self.active_orders
            .lock()
            .expect("sim order lock")
            .remove(order_id);
        debug!(id = %order_id, "sim order canceled");
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> BrokerResult<()> {
        let mut orders = self.active_orders.lock().expect("sim order lock");
        orders.retain(|_, o| o.symbol != symbol);
        debug!(%symbol, "sim orders canceled");
        Ok(())
    }

    async fn order_status(&self, _symbol: &str, order_id: &str) -> BrokerResult<OrderStatus> {
        // Resting sim orders fill on the first poll
        let mut orders = self.active_orders.lock().expect("sim order lock");
        orders.remove(order_id);
        Ok(OrderStatus::Filled)
    }

    async fn balance(&self) -> BrokerResult<Balance> {
        Ok(Balance {
            total: self.default_balance,
            available: self.default_balance,
        })
    }

    fn name(&self) -> &str {
        "sim"
    }
}

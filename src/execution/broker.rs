//! Broker abstraction
//!
//! One trait, two implementations: the live REST client and the simulator.
//! Selecting the implementation once at construction replaces per-method
//! simulation branches with a single seam.

use async_trait::async_trait;
use thiserror::Error;

use super::order::{Order, OrderStatus, Side};

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Broker/venue failure taxonomy
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failure (connection, timeout, TLS)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Venue replied with an application error
    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },

    /// Missing or rejected credentials
    #[error("authentication error: {0}")]
    Auth(String),

    /// Response did not parse into the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Account balance snapshot
#[derive(Debug, Clone, Copy)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
}

/// Core venue operations.
///
/// Implementations must keep identical field names and semantics across
/// modes so higher layers exercise one code path.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Place a limit order. `post_only` orders must rest or be rejected,
    /// never cross the spread.
    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> BrokerResult<Order>;

    /// Place an unconditional taker order
    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> BrokerResult<Order>;

    /// Cancel a single order
    async fn cancel(&self, symbol: &str, order_id: &str) -> BrokerResult<()>;

    /// Cancel every resting order for the symbol
    async fn cancel_all(&self, symbol: &str) -> BrokerResult<()>;

    /// Current status of an order
    async fn order_status(&self, symbol: &str, order_id: &str) -> BrokerResult<OrderStatus>;

    /// Account balance
    async fn balance(&self) -> BrokerResult<Balance>;

    /// Broker name for logging
    fn name(&self) -> &str;
}

//! Shared top-of-book store
//!
//! Keeps the latest best bid/ask per symbol. Feed tasks write it directly
//! so the chase loop reads a live price even while the orchestrator is
//! mid-await on something else. Snapshots are ephemeral; nothing here
//! retains history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::execution::Side;

/// Latest top-of-book for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub ts: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn new(symbol: &str, bid_price: f64, bid_size: f64, ask_price: f64, ask_size: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            bid_price,
            bid_size,
            ask_price,
            ask_size,
            ts: Utc::now(),
        }
    }

    /// Both sides present with positive prices
    pub fn is_valid(&self) -> bool {
        self.bid_price > 0.0 && self.ask_price > 0.0 && self.bid_size >= 0.0 && self.ask_size >= 0.0
    }

    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }
}

/// Cheaply cloneable handle to the per-symbol book map
#[derive(Clone, Default)]
pub struct OrderBookStream {
    books: Arc<RwLock<HashMap<String, BookSnapshot>>>,
}

impl OrderBookStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot for the symbol. Invalid snapshots are dropped.
    pub fn apply(&self, snap: BookSnapshot) {
        if !snap.is_valid() {
            return;
        }
        let mut books = self.books.write().expect("book lock poisoned");
        books.insert(snap.symbol.clone(), snap);
    }

    /// Latest snapshot for a symbol
    pub fn get(&self, symbol: &str) -> Option<BookSnapshot> {
        let books = self.books.read().expect("book lock poisoned");
        books.get(symbol).cloned()
    }

    /// Maker-favorable price for the side: best bid for buys, best ask for sells
    pub fn best_price(&self, symbol: &str, side: Side) -> Option<f64> {
        let snap = self.get(symbol)?;
        match side {
            Side::Buy => Some(snap.bid_price),
            Side::Sell => Some(snap.ask_price),
        }
    }

    /// Mid price, used for position marks and stop/target scans
    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).map(|s| s.mid())
    }

    /// Symbols with a stored book
    pub fn symbols(&self) -> Vec<String> {
        let books = self.books.read().expect("book lock poisoned");
        books.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_and_lookup() {
        let book = OrderBookStream::new();
        book.apply(BookSnapshot::new("BTCUSDT", 100.0, 2.0, 100.5, 3.0));

        assert_eq!(book.best_price("BTCUSDT", Side::Buy), Some(100.0));
        assert_eq!(book.best_price("BTCUSDT", Side::Sell), Some(100.5));
        assert_eq!(book.mid("BTCUSDT"), Some(100.25));
        assert_eq!(book.best_price("ETHUSDT", Side::Buy), None);
    }

    #[test]
    fn invalid_snapshot_is_dropped() {
        let book = OrderBookStream::new();
        book.apply(BookSnapshot::new("BTCUSDT", 0.0, 0.0, 0.0, 0.0));
        assert!(book.get("BTCUSDT").is_none());
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let book = OrderBookStream::new();
        book.apply(BookSnapshot::new("BTCUSDT", 100.0, 2.0, 100.5, 3.0));
        book.apply(BookSnapshot::new("BTCUSDT", 101.0, 1.0, 101.5, 4.0));
        assert_eq!(book.best_price("BTCUSDT", Side::Buy), Some(101.0));
    }
}

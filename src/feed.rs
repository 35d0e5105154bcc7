//! Market-data adapters
//!
//! Produces `FeedEvent`s for the orchestrator and writes the shared book
//! store directly so price lookups stay fresh while the orchestrator is
//! busy. Two sources: a random-walk mock for simulation runs and a
//! Binance-style combined WebSocket stream (bookTicker + kline).

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::book::{BookSnapshot, OrderBookStream};

/// A closed OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ts: DateTime<Utc>,
}

impl Bar {
    pub fn new(symbol: &str, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            open,
            high,
            low,
            close,
            volume,
            ts: Utc::now(),
        }
    }
}

/// Events delivered to the orchestrator
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Top-of-book changed (already applied to the book store)
    Book(BookSnapshot),
    /// A bar closed
    Bar(Bar),
    /// The feed reconnected; per-symbol flow state must be dropped
    Reset(String),
}

/// Random-walk mock feed for one symbol. Emits ~10 book updates/s and a
/// synthetic bar close every `bar_interval`.
pub async fn run_mock(
    tx: mpsc::Sender<FeedEvent>,
    book: OrderBookStream,
    symbol: String,
    bar_interval: Duration,
) {
    let mut mid: f64 = 100.0;
    let mut bar_open = mid;
    let mut bar_high = mid;
    let mut bar_low = mid;
    let mut bar_volume = 0.0;
    let mut last_bar = tokio::time::Instant::now();

    info!(%symbol, "mock feed started");

    loop {
        // ThreadRng is not Send, keep it out of await scope
        let snap = {
            let mut rng = rand::thread_rng();
            mid = (mid + rng.gen_range(-0.05..=0.05)).max(1.0);
            let spread = mid * 0.0005;
            bar_volume += rng.gen_range(0.1..2.0);
            BookSnapshot::new(
                &symbol,
                mid - spread,
                rng.gen_range(0.5..5.0),
                mid + spread,
                rng.gen_range(0.5..5.0),
            )
        };
        bar_high = bar_high.max(mid);
        bar_low = bar_low.min(mid);

        book.apply(snap.clone());
        if tx.send(FeedEvent::Book(snap)).await.is_err() {
            return;
        }

        if last_bar.elapsed() >= bar_interval {
            let bar = Bar::new(&symbol, bar_open, bar_high, bar_low, mid, bar_volume);
            if tx.send(FeedEvent::Bar(bar)).await.is_err() {
                return;
            }
            bar_open = mid;
            bar_high = mid;
            bar_low = mid;
            bar_volume = 0.0;
            last_bar = tokio::time::Instant::now();
        }

        sleep(Duration::from_millis(100)).await;
    }
}

/// Binance-style combined stream payload wrapper
#[derive(Debug, Deserialize)]
struct StreamMessage {
    stream: String,
    data: serde_json::Value,
}

/// Live WebSocket feed for one symbol: bookTicker for the top of book,
/// kline for bar closes. Reconnects forever with exponential backoff and
/// emits `Reset` after every reconnect.
pub async fn run_ws(
    tx: mpsc::Sender<FeedEvent>,
    book: OrderBookStream,
    symbol: String,
    ws_base: String,
    kline_interval: &str,
) {
    let sym = symbol.to_lowercase();
    let url = format!(
        "{}/stream?streams={sym}@bookTicker/{sym}@kline_{kline_interval}",
        ws_base.trim_end_matches('/')
    );

    let mut attempt: u32 = 0;
    let mut connected_before = false;

    loop {
        info!(%symbol, %url, "connecting market-data stream");
        match connect_async(url.as_str()).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "market-data stream connected");
                attempt = 0;

                // Stale diff state would register the reconnect gap as flow
                if connected_before && tx.send(FeedEvent::Reset(symbol.clone())).await.is_err() {
                    return;
                }
                connected_before = true;

                while let Some(frame) = ws.next().await {
                    let msg = match frame {
                        Ok(m) if m.is_text() => m,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(%symbol, error = %e, "stream read error");
                            break;
                        }
                    };
                    let txt = match msg.into_text() {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    let Ok(wrapped) = serde_json::from_str::<StreamMessage>(&txt) else {
                        continue;
                    };

                    if wrapped.stream.ends_with("@bookTicker") {
                        if let Some(snap) = parse_book_ticker(&symbol, &wrapped.data) {
                            book.apply(snap.clone());
                            if tx.send(FeedEvent::Book(snap)).await.is_err() {
                                return;
                            }
                        }
                    } else if wrapped.stream.contains("@kline_") {
                        if let Some(bar) = parse_closed_kline(&symbol, &wrapped.data) {
                            if tx.send(FeedEvent::Bar(bar)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                warn!(%symbol, "market-data stream disconnected");
            }
            Err(e) => {
                error!(%symbol, error = %e, "stream connect failed");
            }
        }

        // Exponential backoff + jitter, 0.5s..32s
        attempt = attempt.saturating_add(1);
        let factor = 1u64 << attempt.min(6);
        let jitter = rand::thread_rng().gen_range(0..=250);
        let backoff = Duration::from_millis(500 * factor + jitter);
        debug!(%symbol, ?backoff, "reconnecting after backoff");
        sleep(backoff).await;
    }
}

fn parse_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    v?.as_str()?.parse().ok()
}

/// `{"b":"25.35","B":"31.2","a":"25.36","A":"40.6",...}`
fn parse_book_ticker(symbol: &str, data: &serde_json::Value) -> Option<BookSnapshot> {
    let bid = parse_f64(data.get("b"))?;
    let bid_size = parse_f64(data.get("B"))?;
    let ask = parse_f64(data.get("a"))?;
    let ask_size = parse_f64(data.get("A"))?;
    let snap = BookSnapshot::new(symbol, bid, bid_size, ask, ask_size);
    snap.is_valid().then_some(snap)
}

/// Kline payload; only closed bars (`"x": true`) become events
fn parse_closed_kline(symbol: &str, data: &serde_json::Value) -> Option<Bar> {
    let k = data.get("k")?;
    if !k.get("x")?.as_bool()? {
        return None;
    }
    Some(Bar::new(
        symbol,
        parse_f64(k.get("o"))?,
        parse_f64(k.get("h"))?,
        parse_f64(k.get("l"))?,
        parse_f64(k.get("c"))?,
        parse_f64(k.get("v"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn book_ticker_parses() {
        let data = json!({"u": 1, "s": "BTCUSDT", "b": "100.5", "B": "2.0", "a": "100.6", "A": "3.5"});
        let snap = parse_book_ticker("BTCUSDT", &data).unwrap();
        assert_eq!(snap.bid_price, 100.5);
        assert_eq!(snap.ask_size, 3.5);
    }

    #[test]
    fn malformed_book_ticker_is_dropped() {
        assert!(parse_book_ticker("BTCUSDT", &json!({"b": "oops"})).is_none());
        assert!(parse_book_ticker("BTCUSDT", &json!({})).is_none());
    }

    #[test]
    fn only_closed_klines_become_bars() {
        let open = json!({"k": {"x": false, "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10"}});
        assert!(parse_closed_kline("BTCUSDT", &open).is_none());

        let closed = json!({"k": {"x": true, "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10"}});
        let bar = parse_closed_kline("BTCUSDT", &closed).unwrap();
        assert_eq!(bar.close, 1.5);
        assert_eq!(bar.volume, 10.0);
    }

    #[tokio::test]
    async fn mock_feed_emits_books_and_writes_store() {
        let (tx, mut rx) = mpsc::channel(64);
        let book = OrderBookStream::new();
        let handle = tokio::spawn(run_mock(
            tx,
            book.clone(),
            "TESTUSDT".to_string(),
            Duration::from_secs(60),
        ));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, FeedEvent::Book(_)));
        assert!(book.get("TESTUSDT").is_some());

        handle.abort();
    }
}

//! SQLite persistence for the position ledger
//!
//! Two relations: one row per calendar date of daily stats, one row per
//! currently-open position keyed by symbol. Both are written in a single
//! transaction on every mutation so a crash never observes half a state.

use anyhow::{Context, Result};
use chrono::DateTime;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::execution::Side;

use super::{DailyStats, Position};

/// Durable store behind the ledger
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory for {path}"))?;
            }
        }

        let conn = Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn };
        store.create_tables()?;
        info!(%path, "ledger database ready");
        Ok(store)
    }

    /// In-memory store for tests
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                total_trades INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                total_pnl REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                current_drawdown REAL NOT NULL,
                is_paused INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS open_positions (
                symbol TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                entry_time TEXT NOT NULL,
                pnl REAL NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Write today's stats row and the full open-position set atomically
    pub fn save(&mut self, stats: &DailyStats, positions: &HashMap<String, Position>) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO daily_stats
            (date, total_trades, wins, losses, total_pnl, max_drawdown, current_drawdown, is_paused)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                stats.date,
                stats.total_trades,
                stats.wins,
                stats.losses,
                stats.total_pnl,
                stats.max_drawdown,
                stats.current_drawdown,
                stats.paused as i64,
            ],
        )?;

        // Full sync: the table mirrors the in-memory map exactly
        tx.execute("DELETE FROM open_positions", [])?;
        for pos in positions.values() {
            tx.execute(
                r#"
                INSERT INTO open_positions
                (symbol, direction, entry_price, quantity, stop_loss, take_profit, entry_time, pnl)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    pos.symbol,
                    pos.direction.to_string(),
                    pos.entry_price,
                    pos.quantity,
                    pos.stop_loss,
                    pos.take_profit,
                    pos.entry_time.to_rfc3339(),
                    pos.pnl,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the stats row for `date` (if present) and every open position
    pub fn load(&self, date: &str) -> Result<(Option<DailyStats>, HashMap<String, Position>)> {
        let stats = self
            .conn
            .query_row(
                r#"
                SELECT date, total_trades, wins, losses, total_pnl, max_drawdown,
                       current_drawdown, is_paused
                FROM daily_stats WHERE date = ?1
                "#,
                params![date],
                |row| {
                    Ok(DailyStats {
                        date: row.get(0)?,
                        total_trades: row.get(1)?,
                        wins: row.get(2)?,
                        losses: row.get(3)?,
                        total_pnl: row.get(4)?,
                        max_drawdown: row.get(5)?,
                        current_drawdown: row.get(6)?,
                        paused: row.get::<_, i64>(7)? != 0,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT symbol, direction, entry_price, quantity, stop_loss, take_profit,
                   entry_time, pnl
            FROM open_positions
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let direction: String = row.get(1)?;
            let entry_time: String = row.get(6)?;
            Ok(Position {
                symbol: row.get(0)?,
                direction: if direction == "SELL" { Side::Sell } else { Side::Buy },
                entry_price: row.get(2)?,
                quantity: row.get(3)?,
                stop_loss: row.get(4)?,
                take_profit: row.get(5)?,
                entry_time: DateTime::parse_from_rfc3339(&entry_time)
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
                pnl: row.get(7)?,
            })
        })?;

        let mut positions = HashMap::new();
        for row in rows {
            let pos = row?;
            positions.insert(pos.symbol.clone(), pos);
        }

        Ok((stats, positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(symbol: &str, direction: Side) -> Position {
        Position {
            symbol: symbol.to_string(),
            direction,
            entry_price: 100.0,
            quantity: 0.5,
            stop_loss: 99.0,
            take_profit: 102.0,
            entry_time: Utc::now(),
            pnl: 0.0,
        }
    }

    #[test]
    fn round_trip_reproduces_state() {
        let mut store = LedgerStore::in_memory().unwrap();

        let stats = DailyStats {
            date: "2026-08-06".to_string(),
            total_trades: 4,
            wins: 3,
            losses: 1,
            total_pnl: 12.5,
            max_drawdown: 0.02,
            current_drawdown: 0.01,
            paused: false,
        };
        let mut positions = HashMap::new();
        positions.insert("BTCUSDT".to_string(), position("BTCUSDT", Side::Buy));
        positions.insert("ETHUSDT".to_string(), position("ETHUSDT", Side::Sell));

        store.save(&stats, &positions).unwrap();

        let (loaded_stats, loaded_positions) = store.load("2026-08-06").unwrap();
        let loaded_stats = loaded_stats.unwrap();
        assert_eq!(loaded_stats.total_trades, 4);
        assert_eq!(loaded_stats.wins, 3);
        assert_eq!(loaded_stats.total_pnl, 12.5);
        assert_eq!(loaded_positions.len(), 2);
        assert_eq!(loaded_positions["ETHUSDT"].direction, Side::Sell);
        assert_eq!(loaded_positions["BTCUSDT"].entry_price, 100.0);
    }

    #[test]
    fn missing_date_loads_no_stats() {
        let store = LedgerStore::in_memory().unwrap();
        let (stats, positions) = store.load("2026-08-06").unwrap();
        assert!(stats.is_none());
        assert!(positions.is_empty());
    }

    #[test]
    fn prior_day_row_does_not_leak_into_today() {
        let mut store = LedgerStore::in_memory().unwrap();
        let yesterday = DailyStats {
            date: "2026-08-05".to_string(),
            total_trades: 9,
            wins: 1,
            losses: 8,
            total_pnl: -80.0,
            max_drawdown: 0.2,
            current_drawdown: 0.2,
            paused: true,
        };
        store.save(&yesterday, &HashMap::new()).unwrap();

        let (stats, _) = store.load("2026-08-06").unwrap();
        assert!(stats.is_none());
    }

    #[test]
    fn closed_positions_disappear_on_next_save() {
        let mut store = LedgerStore::in_memory().unwrap();
        let stats = DailyStats::fresh("2026-08-06");

        let mut positions = HashMap::new();
        positions.insert("BTCUSDT".to_string(), position("BTCUSDT", Side::Buy));
        store.save(&stats, &positions).unwrap();

        positions.clear();
        store.save(&stats, &positions).unwrap();

        let (_, loaded) = store.load("2026-08-06").unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn paused_flag_survives_restart() {
        let mut store = LedgerStore::in_memory().unwrap();
        let mut stats = DailyStats::fresh("2026-08-06");
        stats.paused = true;
        store.save(&stats, &HashMap::new()).unwrap();

        let (loaded, _) = store.load("2026-08-06").unwrap();
        assert!(loaded.unwrap().paused);
    }
}

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use flowtrader::book::OrderBookStream;
use flowtrader::config::{EngineConfig, ExecutionMode};
use flowtrader::execution::{BrokerClient, ExecutionEngine, RestBroker, SimBroker};
use flowtrader::feed;
use flowtrader::flow::FlowAnalyzer;
use flowtrader::ledger::{LedgerStore, PositionLedger};
use flowtrader::regime::{BalancedAdvisor, HoldDetector, SharedRegime};
use flowtrader::trader::Trader;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Run against the live venue instead of the simulator
    #[arg(long)]
    live: bool,

    /// Symbols to trade (comma-separated)
    #[arg(short, long, default_value = "BTCUSDT,ETHUSDT")]
    symbols: String,

    /// Ledger database path
    #[arg(long, default_value = "flowtrader.db")]
    db: String,

    /// Venue WebSocket base URL
    #[arg(long, env = "VENUE_WS_URL", default_value = "wss://fstream.binance.com")]
    ws_url: String,

    /// Venue REST base URL
    #[arg(long, env = "VENUE_REST_URL", default_value = "https://fapi.binance.com")]
    rest_url: String,

    /// Venue API key (live mode only)
    #[arg(long, env = "VENUE_API_KEY", default_value = "")]
    api_key: String,

    /// Kline interval for bar closes
    #[arg(long, default_value = "5m")]
    kline_interval: String,

    /// Simulated account balance
    #[arg(long, default_value = "10000.0")]
    sim_balance: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowtrader=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::default();
    config.mode = if args.live {
        ExecutionMode::Live
    } else {
        ExecutionMode::Simulation
    };

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    info!(mode = %config.mode, symbols = ?symbols, db = %args.db, "starting flowtrader");

    // Broker selected once; everything downstream is mode-agnostic
    let broker: Arc<dyn BrokerClient> = match config.mode {
        ExecutionMode::Simulation => Arc::new(SimBroker::new(args.sim_balance)),
        ExecutionMode::Live => Arc::new(RestBroker::new(&args.rest_url, &args.api_key)?),
    };

    let book = OrderBookStream::new();
    let flow = FlowAnalyzer::new(
        config.flow.clone(),
        config.risk.default_stop_pct,
        config.risk.default_target_pct,
    );
    let exec = ExecutionEngine::new(broker, config.chase.clone());
    let store = LedgerStore::open(&args.db)?;
    let ledger = PositionLedger::new(config.risk.clone(), Some(store));
    let regime = SharedRegime::new(Arc::new(HoldDetector));

    let mut trader = Trader::new(
        config.trader.clone(),
        book.clone(),
        flow,
        exec,
        ledger,
        regime,
        Arc::new(BalancedAdvisor),
    );

    // Market-data producers, one task per symbol
    let (event_tx, event_rx) = mpsc::channel(4096);
    for symbol in symbols {
        let tx = event_tx.clone();
        let book = book.clone();
        match config.mode {
            ExecutionMode::Simulation => {
                tokio::spawn(feed::run_mock(tx, book, symbol, Duration::from_secs(5)));
            }
            ExecutionMode::Live => {
                let ws_url = args.ws_url.clone();
                let interval = args.kline_interval.clone();
                tokio::spawn(async move {
                    feed::run_ws(tx, book, symbol, ws_url, &interval).await;
                });
            }
        }
    }
    drop(event_tx);

    // Ctrl-C drains gracefully: cancel resting orders, persist the ledger
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
            return;
        }
        info!("interrupt received");
        let _ = shutdown_tx.send(true);
    });

    trader.run(event_rx, shutdown_rx).await;

    info!("flowtrader stopped");
    Ok(())
}

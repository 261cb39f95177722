//! Demo trading workflow on the in-memory store.
//!
//! `discover_symbols` spawns one child block: wave 0 holds a
//! `compute_indicator` step per symbol and timeframe, wave 1 a `place_order`
//! step per symbol. Orders go to a simulated exchange that rate-limits the
//! first order of selected symbols, so the retry path is exercised too.

use crate::config::SkeinConfig;
use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use skein_cluster::{WorkerPool, WorkerStats};
use skein_core::{JoinPolicy, NewStep, StepId, SubjectRef};
use skein_runtime::{Engine, StepContext, Telemetry, Unit, UnitError, UnitRegistry, with_lock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const FAST_PERIOD: usize = 5;
const SLOW_PERIOD: usize = 20;
const CANDLES: usize = 48;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Long
    Buy,
    /// Short
    Sell,
}

/// Order accepted by the simulated exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Idempotency key, derived from the step id
    pub client_order_id: String,
    /// Instrument
    pub symbol: String,
    /// Direction
    pub side: Side,
    /// Contract quantity
    pub quantity: f64,
    /// Mean crossover signal across timeframes
    pub signal: f64,
    /// Set by `finalize`
    pub confirmed: bool,
}

#[derive(Debug, Default)]
struct Book {
    indicators: HashMap<String, f64>,
    orders: IndexMap<String, Order>,
    rate_limited: HashSet<String>,
}

/// In-process stand-in for a futures exchange
#[derive(Debug, Default)]
pub struct Exchange {
    book: Mutex<Book>,
    throttle_first_order: HashSet<String>,
}

impl Exchange {
    /// Exchange that answers the first order for each of `symbols` with 429
    #[must_use]
    pub fn with_rate_limited<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            book: Mutex::default(),
            throttle_first_order: symbols.into_iter().map(Into::into).collect(),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored indicator value
    #[must_use]
    pub fn indicator(&self, symbol: &str, timeframe: &str) -> Option<f64> {
        self.book().indicators.get(&indicator_key(symbol, timeframe)).copied()
    }

    fn store_indicator(&self, symbol: &str, timeframe: &str, value: f64) {
        self.book().indicators.insert(indicator_key(symbol, timeframe), value);
    }

    /// Submit an order; resubmitting a known `client_order_id` returns the
    /// original
    ///
    /// # Errors
    ///
    /// Returns a 429 external error for the first order on a throttled
    /// symbol
    pub fn submit(&self, order: Order) -> Result<Order, UnitError> {
        let mut book = self.book();
        if let Some(existing) = book.orders.get(&order.client_order_id) {
            return Ok(existing.clone());
        }
        if self.throttle_first_order.contains(&order.symbol) && book.rate_limited.insert(order.symbol.clone()) {
            return Err(UnitError::external(Some(429), "rate limit exceeded, retry later"));
        }
        book.orders.insert(order.client_order_id.clone(), order.clone());
        Ok(order)
    }

    /// Look an order up by client id
    #[must_use]
    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.book().orders.get(client_order_id).cloned()
    }

    fn confirm(&self, client_order_id: &str) -> bool {
        match self.book().orders.get_mut(client_order_id) {
            Some(order) => {
                order.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Every order, in submission order
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.book().orders.values().cloned().collect()
    }
}

fn indicator_key(symbol: &str, timeframe: &str) -> String {
    format!("{}:{}", symbol, timeframe)
}

/// Synthetic close prices, stable per symbol and timeframe
#[must_use]
pub fn synthetic_closes(symbol: &str, timeframe: &str) -> Vec<f64> {
    let seed = symbol
        .bytes()
        .chain(timeframe.bytes())
        .fold(0u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)));
    let base = 50.0 + (seed % 950) as f64;
    let phase = (seed % 628) as f64 / 100.0;
    (0..CANDLES)
        .map(|i| base * (1.0 + 0.02 * (i as f64 * 0.35 + phase).sin()))
        .collect()
}

/// Fast minus slow simple moving average, relative to the slow one
#[must_use]
pub fn crossover_signal(closes: &[f64]) -> Option<f64> {
    if closes.len() < SLOW_PERIOD {
        return None;
    }
    let sma = |period: usize| closes[closes.len() - period..].iter().sum::<f64>() / period as f64;
    let slow = sma(SLOW_PERIOD);
    if slow == 0.0 {
        return None;
    }
    Some((sma(FAST_PERIOD) - slow) / slow)
}

// Units

#[derive(Debug, Deserialize)]
struct DiscoverArgs {
    symbols: Vec<String>,
    timeframes: Vec<String>,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct IndicatorArgs {
    symbol: String,
    timeframe: String,
}

#[derive(Debug, Deserialize)]
struct OrderArgs {
    symbol: String,
    timeframes: Vec<String>,
    quantity: f64,
}

/// Fans a symbol scan out into indicator and order steps
pub struct DiscoverSymbols {
    exchange: Arc<Exchange>,
}

#[async_trait]
impl Unit for DiscoverSymbols {
    fn unit_type(&self) -> &str {
        "discover_symbols"
    }

    async fn check_precondition(&self, ctx: &StepContext) -> Result<bool, UnitError> {
        let args: DiscoverArgs = ctx.args()?;
        Ok(!args.symbols.is_empty() && !args.timeframes.is_empty() && args.quantity > 0.0)
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<Value, UnitError> {
        let args: DiscoverArgs = ctx.args()?;
        for symbol in &args.symbols {
            for timeframe in &args.timeframes {
                let request = NewStep::new(
                    "compute_indicator",
                    json!({ "symbol": symbol, "timeframe": timeframe }),
                )
                .with_subject(SubjectRef::new("symbol", symbol.as_str()));
                ctx.add_child(request, 0);
            }
            let request = NewStep::new(
                "place_order",
                json!({ "symbol": symbol, "timeframes": args.timeframes, "quantity": args.quantity }),
            )
            .with_subject(SubjectRef::new("symbol", symbol.as_str()));
            ctx.add_child(request, 1);
        }
        Ok(json!({ "symbols": args.symbols.len(), "timeframes": args.timeframes.len() }))
    }

    async fn finalize(&self, ctx: &StepContext, _result: &Value) -> Result<(), UnitError> {
        let orders = self.exchange.orders();
        info!(step_id = %ctx.step_id, orders = orders.len(), "symbol scan finished");
        Ok(())
    }

    fn join_policy(&self) -> Option<JoinPolicy> {
        Some(JoinPolicy::IgnoreFailures)
    }
}

/// Computes one crossover indicator under a per-series lock
pub struct ComputeIndicator {
    exchange: Arc<Exchange>,
}

#[async_trait]
impl Unit for ComputeIndicator {
    fn unit_type(&self) -> &str {
        "compute_indicator"
    }

    async fn should_skip(&self, ctx: &StepContext) -> Result<bool, UnitError> {
        let args: IndicatorArgs = ctx.args()?;
        Ok(self.exchange.indicator(&args.symbol, &args.timeframe).is_some())
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<Value, UnitError> {
        let args: IndicatorArgs = ctx.args()?;
        let name = format!("indicator:{}:{}", args.symbol, args.timeframe);
        with_lock(ctx.locks(), &name, LOCK_TIMEOUT, async {
            let closes = synthetic_closes(&args.symbol, &args.timeframe);
            let signal = crossover_signal(&closes).ok_or_else(|| {
                UnitError::msg(format!("not enough candles for {}", name))
            })?;
            self.exchange.store_indicator(&args.symbol, &args.timeframe, signal);
            Ok(json!({ "symbol": args.symbol, "timeframe": args.timeframe, "signal": signal }))
        })
        .await
    }
}

/// Places one order per symbol from its indicators
pub struct PlaceOrder {
    exchange: Arc<Exchange>,
}

impl PlaceOrder {
    fn client_order_id(step_id: StepId) -> String {
        format!("skein-{}", step_id)
    }
}

#[async_trait]
impl Unit for PlaceOrder {
    fn unit_type(&self) -> &str {
        "place_order"
    }

    async fn check_precondition(&self, ctx: &StepContext) -> Result<bool, UnitError> {
        let args: OrderArgs = ctx.args()?;
        Ok(args
            .timeframes
            .iter()
            .all(|timeframe| self.exchange.indicator(&args.symbol, timeframe).is_some()))
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<Value, UnitError> {
        let args: OrderArgs = ctx.args()?;
        let signals: Vec<f64> = args
            .timeframes
            .iter()
            .filter_map(|timeframe| self.exchange.indicator(&args.symbol, timeframe))
            .collect();
        let signal = signals.iter().sum::<f64>() / signals.len().max(1) as f64;
        let side = if signal >= 0.0 { Side::Buy } else { Side::Sell };

        let order = self.exchange.submit(Order {
            client_order_id: Self::client_order_id(ctx.step_id),
            symbol: args.symbol,
            side,
            quantity: args.quantity,
            signal,
            confirmed: false,
        })?;
        Ok(serde_json::to_value(&order)?)
    }

    async fn verify(&self, ctx: &StepContext, _result: &Value) -> Result<bool, UnitError> {
        Ok(self.exchange.order(&Self::client_order_id(ctx.step_id)).is_some())
    }

    async fn finalize(&self, ctx: &StepContext, _result: &Value) -> Result<(), UnitError> {
        if self.exchange.confirm(&Self::client_order_id(ctx.step_id)) {
            Ok(())
        } else {
            Err(UnitError::msg("order vanished before confirmation"))
        }
    }

    async fn on_failure(&self, ctx: &StepContext, err: &UnitError) {
        let symbol = ctx.arguments["symbol"].as_str().unwrap_or("?");
        error!(step_id = %ctx.step_id, symbol, error = %err, "order not placed");
    }
}

/// Registry holding the demo units, all sharing `exchange`
///
/// # Errors
///
/// Returns error if a unit type is registered twice
pub fn registry(exchange: &Arc<Exchange>) -> Result<UnitRegistry> {
    Ok(UnitRegistry::new()
        .with(Arc::new(DiscoverSymbols {
            exchange: Arc::clone(exchange),
        }))?
        .with(Arc::new(ComputeIndicator {
            exchange: Arc::clone(exchange),
        }))?
        .with(Arc::new(PlaceOrder {
            exchange: Arc::clone(exchange),
        }))?)
}

/// Demo inputs
#[derive(Debug, Clone, PartialEq)]
pub struct DemoRequest {
    /// Symbols to scan
    pub symbols: Vec<String>,
    /// Timeframes per symbol
    pub timeframes: Vec<String>,
    /// Quantity per order
    pub quantity: f64,
    /// Give up waiting after this long
    pub deadline: Duration,
}

/// Outcome of a demo run
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// Root step
    pub root: StepId,
    /// Whether every step finished before the deadline
    pub settled: bool,
    /// Engine snapshot after shutdown
    pub telemetry: Telemetry,
    /// Orders on the simulated exchange
    pub orders: Vec<Order>,
    /// Per-worker statistics
    pub workers: Vec<WorkerStats>,
}

/// Run the demo workflow with a worker pool and wait for it to settle
///
/// # Errors
///
/// Returns error if the engine cannot be built or a worker task fails
pub async fn run(config: &SkeinConfig, request: &DemoRequest) -> Result<DemoReport> {
    let exchange = Arc::new(Exchange::with_rate_limited(request.symbols.iter().take(1).cloned()));
    let engine = Arc::new(
        Engine::in_memory(config.engine.clone(), registry(&exchange)?).wrap_err("building engine")?,
    );
    for shard in &config.shards {
        engine.register_shard(shard).await?;
    }

    let root = engine
        .create_step(
            NewStep::new(
                "discover_symbols",
                json!({
                    "symbols": request.symbols,
                    "timeframes": request.timeframes,
                    "quantity": request.quantity,
                }),
            )
            .with_subject(SubjectRef::new("scan", "futures")),
        )
        .await?;
    info!(step_id = %root.id, symbols = request.symbols.len(), "demo workflow submitted");

    let mut pool = WorkerPool::new(Arc::clone(&engine));
    pool.spawn_per_shard(&config.shards, config.workers_per_shard, &config.worker)?;
    let settled = pool
        .wait_idle(Duration::from_millis(10), request.deadline)
        .await?
        .is_some();
    if !settled {
        warn!(deadline = ?request.deadline, "workflow still open at deadline");
    }
    let workers = pool.shutdown().await?;

    Ok(DemoReport {
        root: root.id,
        settled,
        telemetry: engine.telemetry().await?,
        orders: exchange.orders(),
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::StepState;
    use skein_runtime::BackoffPolicy;

    #[test]
    fn test_synthetic_closes_are_stable() {
        let first = synthetic_closes("BTCUSDT", "1h");
        assert_eq!(first.len(), CANDLES);
        assert_eq!(first, synthetic_closes("BTCUSDT", "1h"));
        assert_ne!(first, synthetic_closes("ETHUSDT", "1h"));
    }

    #[test]
    fn test_crossover_signal() {
        assert!(crossover_signal(&[1.0; 5]).is_none());
        let flat = vec![100.0; 30];
        assert_eq!(crossover_signal(&flat), Some(0.0));

        let rising: Vec<f64> = (0..30).map(f64::from).collect();
        assert!(crossover_signal(&rising).unwrap() > 0.0);
    }

    #[test]
    fn test_exchange_rate_limits_once_and_dedupes() {
        let exchange = Exchange::with_rate_limited(["BTCUSDT"]);
        let order = Order {
            client_order_id: "skein-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: 0.5,
            signal: 0.01,
            confirmed: false,
        };

        let err = exchange.submit(order.clone()).unwrap_err();
        assert_eq!(err.status(), Some(429));
        exchange.submit(order.clone()).unwrap();
        exchange.submit(order).unwrap();
        assert_eq!(exchange.orders().len(), 1);

        assert!(exchange.confirm("skein-1"));
        assert!(exchange.confirm("skein-1"));
        assert!(exchange.order("skein-1").unwrap().confirmed);
        assert!(!exchange.confirm("skein-2"));
    }

    #[tokio::test]
    async fn test_demo_places_one_order_per_symbol() {
        let mut config = SkeinConfig::default();
        config.engine = config.engine.with_backoff(BackoffPolicy::fixed(Duration::from_millis(5)));
        let request = DemoRequest {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframes: vec!["1h".to_string(), "4h".to_string()],
            quantity: 0.1,
            deadline: Duration::from_secs(20),
        };

        let report = run(&config, &request).await.unwrap();
        assert!(report.settled);
        assert_eq!(report.orders.len(), 2);
        assert!(report.orders.iter().all(|order| order.confirmed));
        assert_eq!(report.telemetry.count(StepState::Completed), 1 + 4 + 2);
        assert_eq!(report.telemetry.count(StepState::Failed), 0);
        assert_eq!(report.telemetry.metrics.retries, 1);
        assert_eq!(report.workers.len(), 4);
    }
}

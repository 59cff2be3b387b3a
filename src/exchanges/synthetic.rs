//! 合成行情
//! 测试里手动注入K线和故障，模拟盘里可以用固定种子的随机游走生成K线

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

use super::MarketDataSource;
use crate::core::error::TradingError;
use crate::core::exchange::CandleStream;
use crate::core::types::{Candle, Instrument, Interval, LiquidityTier, Result};

type Subscriber = mpsc::UnboundedSender<Result<Candle>>;

/// 合成行情
pub struct SyntheticMarket {
    instruments: Mutex<Vec<Instrument>>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    list_failures: AtomicU32,
    subscribe_failures: AtomicU32,
    subscriptions: AtomicU32,
}

impl SyntheticMarket {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments: Mutex::new(instruments),
            subscribers: Mutex::new(HashMap::new()),
            list_failures: AtomicU32::new(0),
            subscribe_failures: AtomicU32::new(0),
            subscriptions: AtomicU32::new(0),
        }
    }

    /// 默认合约参数的交易对
    pub fn default_instrument(symbol: &str) -> Instrument {
        let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
        Instrument {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            max_qty: 1_000_000.0,
            max_leverage: 20,
            liquidity: LiquidityTier::High,
            quote_volume_24h: 500_000_000.0,
            price_change_pct_24h: 1.0,
            tradable: true,
        }
    }

    pub fn with_symbols(symbols: &[String]) -> Self {
        Self::new(symbols.iter().map(|s| Self::default_instrument(s)).collect())
    }

    pub fn set_instruments(&self, instruments: Vec<Instrument>) {
        if let Ok(mut guard) = self.instruments.lock() {
            *guard = instruments;
        }
    }

    /// 接下来 n 次 list_instruments 失败
    pub fn fail_next_lists(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// 接下来 n 次订阅失败
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// 累计成功订阅次数
    pub fn subscription_count(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// 推送一根K线给该交易对的所有订阅者，返回收到的订阅者数量
    pub fn push_candle(&self, candle: Candle) -> usize {
        let mut guard = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(_) => return 0,
        };
        let subscribers = guard.entry(candle.symbol.clone()).or_default();
        subscribers.retain(|tx| tx.send(Ok(candle.clone())).is_ok());
        subscribers.len()
    }

    /// 断开该交易对的所有订阅（流以连接错误结束）
    pub fn disconnect(&self, symbol: &str) {
        if let Ok(mut guard) = self.subscribers.lock() {
            if let Some(subscribers) = guard.remove(symbol) {
                for tx in subscribers {
                    let _ = tx.send(Err(TradingError::Connection(format!(
                        "{} 合成行情断开",
                        symbol
                    ))));
                }
            }
        }
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers
            .lock()
            .map(|guard| guard.get(symbol).map_or(0, |subs| {
                subs.iter().filter(|tx| !tx.is_closed()).count()
            }))
            .unwrap_or(0)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// 启动随机游走生成器；每 tick 为每个交易对生成一根已收盘K线
    pub fn spawn_random_walk(
        self: &Arc<Self>,
        interval: Interval,
        tick: Duration,
        seed: u64,
        start_price: f64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let market = Arc::clone(self);
        tokio::spawn(async move {
            let mut walk = RandomWalk::new(seed, start_price, interval, Utc::now());
            log::info!("🎲 合成行情启动，种子 {}，周期 {}", seed, interval);

            loop {
                tokio::select! {
                    _ = sleep(tick) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let symbols: Vec<String> = market
                    .instruments
                    .lock()
                    .map(|guard| guard.iter().map(|i| i.symbol.clone()).collect())
                    .unwrap_or_default();
                for symbol in symbols {
                    let candle = walk.next_candle(&symbol);
                    market.push_candle(candle);
                }
                walk.advance();
            }
            log::info!("🎲 合成行情停止");
        })
    }
}

/// 固定种子的随机游走
pub struct RandomWalk {
    rng: StdRng,
    prices: HashMap<String, f64>,
    start_price: f64,
    interval: Interval,
    open_time: DateTime<Utc>,
}

impl RandomWalk {
    pub fn new(seed: u64, start_price: f64, interval: Interval, start: DateTime<Utc>) -> Self {
        let open_time = start
            .duration_trunc(interval.duration())
            .unwrap_or(start);
        Self {
            rng: StdRng::seed_from_u64(seed),
            prices: HashMap::new(),
            start_price,
            interval,
            open_time,
        }
    }

    pub fn next_candle(&mut self, symbol: &str) -> Candle {
        let open = *self
            .prices
            .entry(symbol.to_string())
            .or_insert(self.start_price);
        let change: f64 = self.rng.gen_range(-0.01..0.01);
        let close = (open * (1.0 + change)).max(0.01);
        let wick_up: f64 = self.rng.gen_range(0.0..0.003);
        let wick_down: f64 = self.rng.gen_range(0.0..0.003);
        let volume: f64 = self.rng.gen_range(100.0..1000.0);
        self.prices.insert(symbol.to_string(), close);

        Candle {
            symbol: symbol.to_string(),
            interval: self.interval,
            open_time: self.open_time,
            open,
            high: open.max(close) * (1.0 + wick_up),
            low: open.min(close) * (1.0 - wick_down),
            close,
            volume,
            closed: true,
        }
    }

    pub fn advance(&mut self) {
        self.open_time += self.interval.duration();
    }
}

#[async_trait]
impl MarketDataSource for SyntheticMarket {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        if Self::take_failure(&self.list_failures) {
            return Err(TradingError::UniverseFetch("合成行情: 注入的列表失败".to_string()));
        }
        self.instruments
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| TradingError::UniverseFetch("交易对列表锁中毒".to_string()))
    }

    async fn subscribe_candles(&self, symbol: &str, _interval: Interval) -> Result<CandleStream> {
        if Self::take_failure(&self.subscribe_failures) {
            return Err(TradingError::Connection(format!("{} 注入的订阅失败", symbol)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| TradingError::Connection("订阅表锁中毒".to_string()))?
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

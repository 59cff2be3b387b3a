//! 行情订阅监督
//! 每个 (交易对, 周期) 一个任务：连接 -> 推送 -> 断线退避重连
//! 只在“等待下一条消息”和“等待重连”两处挂起

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::core::config::FeedConfig;
use crate::core::error::TradingError;
use crate::core::exchange::ExchangeGateway;
use crate::core::retry_policy::Backoff;
use crate::core::types::{Candle, Interval};
use crate::core::websocket::ConnectionState;
use crate::utils::webhook::{AlertBus, AlertEvent};

/// 发给交易对流水线的事件
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Candle(Candle),
    /// 出现缺口，窗口需要清空重建
    Resync {
        expected: DateTime<Utc>,
        received: DateTime<Utc>,
    },
    Degraded,
    Recovered,
}

/// K线校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleCheck {
    Accept,
    /// 未收盘K线，只用于盘中追踪止损
    Live,
    Duplicate,
    Stale,
    Gap { expected: DateTime<Utc> },
    OutOfOrder,
}

/// 校验已收盘K线的开盘时间单调递增
#[derive(Debug, Clone)]
pub struct CandleValidator {
    interval: Interval,
    last_closed: Option<DateTime<Utc>>,
}

impl CandleValidator {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            last_closed: None,
        }
    }

    pub fn check(&mut self, candle: &Candle) -> CandleCheck {
        let last = match self.last_closed {
            Some(last) => last,
            None => {
                if candle.closed {
                    self.last_closed = Some(candle.open_time);
                    return CandleCheck::Accept;
                }
                return CandleCheck::Live;
            }
        };

        if !candle.closed {
            return if candle.open_time > last {
                CandleCheck::Live
            } else {
                CandleCheck::Stale
            };
        }

        let expected = last + self.interval.duration();
        if candle.open_time == last {
            CandleCheck::Duplicate
        } else if candle.open_time < last {
            CandleCheck::OutOfOrder
        } else if candle.open_time == expected {
            self.last_closed = Some(candle.open_time);
            CandleCheck::Accept
        } else {
            self.last_closed = Some(candle.open_time);
            CandleCheck::Gap { expected }
        }
    }
}

/// 单个订阅的状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

/// 所有订阅状态的看板，供健康报告读取
#[derive(Debug, Default)]
pub struct FeedStatusBoard {
    statuses: RwLock<HashMap<String, FeedStatus>>,
}

impl FeedStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, symbol: &str, status: FeedStatus) {
        self.statuses.write().await.insert(symbol.to_string(), status);
    }

    pub async fn remove(&self, symbol: &str) {
        self.statuses.write().await.remove(symbol);
    }

    pub async fn get(&self, symbol: &str) -> Option<FeedStatus> {
        self.statuses.read().await.get(symbol).copied()
    }

    pub async fn degraded_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .statuses
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.degraded)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub async fn len(&self) -> usize {
        self.statuses.read().await.len()
    }
}

/// 行情订阅监督者
pub struct FeedSupervisor {
    symbol: String,
    interval: Interval,
    gateway: Arc<dyn ExchangeGateway>,
    config: FeedConfig,
    alerts: AlertBus,
    board: Arc<FeedStatusBoard>,
    tx: mpsc::Sender<FeedEvent>,
}

enum StreamEnd {
    Shutdown,
    ReceiverGone,
    Failed(TradingError),
}

impl FeedSupervisor {
    pub fn new(
        symbol: &str,
        interval: Interval,
        gateway: Arc<dyn ExchangeGateway>,
        config: FeedConfig,
        alerts: AlertBus,
        board: Arc<FeedStatusBoard>,
        tx: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            gateway,
            config,
            alerts,
            board,
            tx,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn publish_status(&self, state: ConnectionState, degraded: bool, backoff: &Backoff) {
        self.board
            .set(
                &self.symbol,
                FeedStatus {
                    state,
                    degraded,
                    consecutive_failures: backoff.attempts(),
                },
            )
            .await;
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::from_config(&self.config.backoff);
        let mut validator = CandleValidator::new(self.interval);
        let mut degraded = false;
        let healthy_after = Duration::from_secs(self.config.healthy_reset_secs);

        log::info!("📡 启动 {} {} 行情订阅", self.symbol, self.interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.publish_status(ConnectionState::Connecting, degraded, &backoff)
                .await;
            let end = match self.gateway.subscribe_candles(&self.symbol, self.interval).await {
                Ok(mut stream) => {
                    self.publish_status(ConnectionState::Streaming, degraded, &backoff)
                        .await;
                    log::info!("✅ {} 行情已连接", self.symbol);
                    let connected_at = Instant::now();

                    loop {
                        let item = tokio::select! {
                            _ = shutdown.changed() => break StreamEnd::Shutdown,
                            item = stream.next() => item,
                        };

                        let candle = match item {
                            None => {
                                break StreamEnd::Failed(TradingError::Connection(
                                    "行情流结束".to_string(),
                                ))
                            }
                            Some(Err(e)) => break StreamEnd::Failed(e),
                            Some(Ok(candle)) => candle,
                        };

                        let check = validator.check(&candle);
                        let events = match check {
                            CandleCheck::Accept | CandleCheck::Live => {
                                vec![FeedEvent::Candle(candle)]
                            }
                            CandleCheck::Gap { expected } => {
                                log::warn!(
                                    "⚠️ {} K线缺口: 期望 {} 收到 {}，重建窗口",
                                    self.symbol,
                                    expected,
                                    candle.open_time
                                );
                                vec![
                                    FeedEvent::Resync {
                                        expected,
                                        received: candle.open_time,
                                    },
                                    FeedEvent::Candle(candle),
                                ]
                            }
                            CandleCheck::Duplicate | CandleCheck::Stale => {
                                log::trace!("{} 丢弃重复K线 {}", self.symbol, candle.open_time);
                                continue;
                            }
                            CandleCheck::OutOfOrder => {
                                break StreamEnd::Failed(TradingError::validation(
                                    "open_time",
                                    format!("{} K线乱序: {}", self.symbol, candle.open_time),
                                ));
                            }
                        };

                        if degraded {
                            degraded = false;
                            log::info!("✅ {} 行情恢复", self.symbol);
                            self.publish_status(ConnectionState::Streaming, false, &backoff)
                                .await;
                            self.alerts.emit(AlertEvent::FeedRecovered {
                                symbol: self.symbol.clone(),
                            });
                            if self.tx.send(FeedEvent::Recovered).await.is_err() {
                                return self.finish().await;
                            }
                        }

                        if backoff.attempts() > 0 && connected_at.elapsed() >= healthy_after {
                            log::debug!("{} 连接稳定，重置退避计数", self.symbol);
                            backoff.reset();
                            self.publish_status(ConnectionState::Streaming, false, &backoff)
                                .await;
                        }

                        let mut receiver_gone = false;
                        for event in events {
                            if self.tx.send(event).await.is_err() {
                                receiver_gone = true;
                                break;
                            }
                        }
                        if receiver_gone {
                            break StreamEnd::ReceiverGone;
                        }
                    }
                }
                Err(e) => StreamEnd::Failed(e),
            };

            let error = match end {
                StreamEnd::Shutdown | StreamEnd::ReceiverGone => break,
                StreamEnd::Failed(e) => e,
            };

            let delay = backoff.next_delay();
            log::warn!(
                "⚠️ {} 行情断开 (连续第{}次): {}，{:.1}秒后重连",
                self.symbol,
                backoff.attempts(),
                error,
                delay.as_secs_f64()
            );

            let newly_degraded = !degraded && backoff.attempts() >= self.config.max_retries;
            if newly_degraded {
                degraded = true;
                log::error!(
                    "❌ {} 重连 {} 次失败，标记为 feed-degraded",
                    self.symbol,
                    backoff.attempts()
                );
            }
            self.publish_status(ConnectionState::Disconnected, degraded, &backoff)
                .await;
            if newly_degraded {
                self.alerts.emit(AlertEvent::FeedDegraded {
                    symbol: self.symbol.clone(),
                    attempts: backoff.attempts(),
                });
                if self.tx.send(FeedEvent::Degraded).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.finish().await
    }

    async fn finish(self) {
        self.board.remove(&self.symbol).await;
        log::info!("📴 {} 行情订阅结束", self.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BackoffConfig;
    use crate::exchanges::{PaperExchange, SyntheticMarket};
    use chrono::TimeZone;

    fn candle(minute: u32, closed: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            closed,
        }
    }

    #[test]
    fn test_validator_ordering_rules() {
        let mut v = CandleValidator::new(Interval::OneMinute);
        assert_eq!(v.check(&candle(0, true)), CandleCheck::Accept);
        assert_eq!(v.check(&candle(1, false)), CandleCheck::Live);
        assert_eq!(v.check(&candle(0, true)), CandleCheck::Duplicate);
        assert_eq!(v.check(&candle(1, true)), CandleCheck::Accept);
        assert_eq!(v.check(&candle(0, true)), CandleCheck::OutOfOrder);
        assert!(matches!(v.check(&candle(4, true)), CandleCheck::Gap { .. }));
        assert_eq!(v.check(&candle(3, false)), CandleCheck::Stale);
        assert_eq!(v.check(&candle(5, true)), CandleCheck::Accept);
    }

    fn feed_config(max_retries: u32) -> FeedConfig {
        FeedConfig {
            backoff: BackoffConfig {
                base_delay_ms: 1000,
                factor: 2.0,
                max_delay_ms: 30_000,
                jitter: false,
            },
            max_retries,
            ..FeedConfig::default()
        }
    }

    struct Harness {
        market: Arc<SyntheticMarket>,
        rx: mpsc::Receiver<FeedEvent>,
        alerts: mpsc::UnboundedReceiver<AlertEvent>,
        board: Arc<FeedStatusBoard>,
        shutdown: watch::Sender<bool>,
    }

    fn start(config: FeedConfig, failures: u32) -> Harness {
        let market = Arc::new(SyntheticMarket::with_symbols(&["BTCUSDT".to_string()]));
        market.fail_next_subscriptions(failures);
        let gateway = Arc::new(PaperExchange::new(market.clone()));
        let (bus, alerts) = AlertBus::channel();
        let board = Arc::new(FeedStatusBoard::new());
        let (tx, rx) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        FeedSupervisor::new(
            "BTCUSDT",
            Interval::OneMinute,
            gateway,
            config,
            bus,
            board.clone(),
            tx,
        )
        .spawn(shutdown_rx);

        Harness {
            market,
            rx,
            alerts,
            board,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delays_follow_backoff() {
        let h = start(feed_config(10), 4);

        // 失败发生在 t=0,1,3,7，第5次在 t=15 成功
        sleep(Duration::from_millis(14_500)).await;
        assert_eq!(h.market.subscription_count(), 0);
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(h.market.subscription_count(), 1);

        let status = h.board.get("BTCUSDT").await.unwrap();
        assert_eq!(status.state, ConnectionState::Streaming);
        assert!(!status.degraded);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_healthy_period() {
        let mut config = feed_config(10);
        config.healthy_reset_secs = 60;
        let mut h = start(config, 3);

        // 失败发生在 t=0,1,3，t=7 连上
        while h.market.subscriber_count("BTCUSDT") == 0 {
            sleep(Duration::from_millis(100)).await;
        }
        h.market.push_candle(candle(0, true));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Candle(_))));
        assert_eq!(h.board.get("BTCUSDT").await.unwrap().consecutive_failures, 3);

        sleep(Duration::from_secs(61)).await;
        h.market.push_candle(candle(1, true));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Candle(_))));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.board.get("BTCUSDT").await.unwrap().consecutive_failures, 0);

        // 计数已清零，下一次等待回到 1 秒而不是 8 秒
        h.market.disconnect("BTCUSDT");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.market.subscription_count(), 1);
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(h.market.subscription_count(), 2);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_then_recovered() {
        let mut h = start(feed_config(2), 3);

        assert_eq!(h.rx.recv().await, Some(FeedEvent::Degraded));
        assert!(matches!(
            h.alerts.recv().await,
            Some(AlertEvent::FeedDegraded { attempts: 2, .. })
        ));
        assert_eq!(h.board.degraded_symbols().await, vec!["BTCUSDT".to_string()]);

        while h.market.subscriber_count("BTCUSDT") == 0 {
            sleep(Duration::from_millis(100)).await;
        }
        h.market.push_candle(candle(0, true));

        assert_eq!(h.rx.recv().await, Some(FeedEvent::Recovered));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Candle(_))));
        assert!(matches!(
            h.alerts.recv().await,
            Some(AlertEvent::FeedRecovered { .. })
        ));
        assert!(h.board.degraded_symbols().await.is_empty());
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_emits_resync_and_out_of_order_reconnects() {
        let mut h = start(feed_config(10), 0);
        while h.market.subscriber_count("BTCUSDT") == 0 {
            sleep(Duration::from_millis(10)).await;
        }

        h.market.push_candle(candle(0, true));
        h.market.push_candle(candle(3, true));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Candle(_))));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Resync { .. })));
        assert!(matches!(h.rx.recv().await, Some(FeedEvent::Candle(_))));

        h.market.push_candle(candle(1, true));
        // 乱序导致断开重连
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.market.subscription_count(), 2);
        let _ = h.shutdown.send(true);
    }
}

//! 单个交易对的流水线
//! 持有K线窗口，收盘K线驱动策略，信号交给风控，批准后启动执行器

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::error::TradingError;
use crate::core::feed::FeedEvent;
use crate::core::risk_manager::RiskManager;
use crate::core::types::{Candle, ExitReason, PositionSide, Signal, SignalAction};
use crate::core::universe::UniverseManager;
use crate::execution::{
    ExecutionContext, ExecutorCommand, ExecutorHandle, PositionExecutor, PositionState,
};
use crate::strategies::SignalStrategy;

/// 回收已结束执行器的检查周期
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// 编排器发给流水线的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// 手动平掉当前持仓
    Flatten,
    /// 交易对已移出交易池：不再开新仓，持仓结束后退出
    Retire,
    Shutdown,
}

/// 流水线状态，供健康报告读取
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub symbol: String,
    pub window_len: usize,
    pub degraded: bool,
    pub retired: bool,
    pub position: Option<(PositionSide, PositionState)>,
}

/// 编排器持有的流水线句柄
pub struct WorkerHandle {
    symbol: String,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    status: watch::Receiver<WorkerStatus>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            log::error!("❌ {} 流水线任务异常退出: {}", self.symbol, e);
        }
    }
}

/// 流水线共享的依赖
#[derive(Clone)]
pub struct WorkerContext {
    pub strategy: Arc<dyn SignalStrategy>,
    pub risk: Arc<RiskManager>,
    pub universe: Arc<UniverseManager>,
    pub execution: ExecutionContext,
    /// 进程级致命错误上报通道
    pub fatal: mpsc::UnboundedSender<TradingError>,
    pub window_capacity: usize,
}

/// 单交易对流水线
pub struct InstrumentWorker {
    symbol: String,
    ctx: WorkerContext,
    window: VecDeque<Candle>,
    degraded: bool,
    retired: bool,
    executor: Option<(PositionSide, ExecutorHandle)>,
    status_tx: watch::Sender<WorkerStatus>,
}

impl InstrumentWorker {
    /// 启动流水线；`feed` 由该交易对的行情监督者写入
    pub fn spawn(symbol: &str, ctx: WorkerContext, feed: mpsc::Receiver<FeedEvent>) -> WorkerHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let initial = WorkerStatus {
            symbol: symbol.to_string(),
            window_len: 0,
            degraded: false,
            retired: false,
            position: None,
        };
        let (status_tx, status) = watch::channel(initial);

        let worker = Self {
            symbol: symbol.to_string(),
            window: VecDeque::with_capacity(ctx.window_capacity),
            ctx,
            degraded: false,
            retired: false,
            executor: None,
            status_tx,
        };
        let join = tokio::spawn(worker.run(feed, rx));

        WorkerHandle {
            symbol: symbol.to_string(),
            commands,
            status,
            join,
        }
    }

    async fn run(
        mut self,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ) {
        let mut reap = interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        log::info!("🚀 {} 流水线启动 (策略: {})", self.symbol, self.ctx.strategy.name());

        loop {
            tokio::select! {
                event = feed.recv(), if feed_open => match event {
                    Some(event) => self.on_feed_event(event).await,
                    None => {
                        log::debug!("{} 行情通道关闭", self.symbol);
                        feed_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(WorkerCommand::Flatten) => self.flatten(ExitReason::Manual),
                    Some(WorkerCommand::Retire) => {
                        log::info!("📤 {} 已移出交易池，不再开新仓", self.symbol);
                        self.retired = true;
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                },
                _ = reap.tick() => self.reap().await,
            }

            if self.retired && self.executor.is_none() {
                break;
            }
            self.publish_status();
        }

        self.drain().await;
        self.publish_status();
        log::info!("🛑 {} 流水线退出", self.symbol);
    }

    async fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Candle(candle) => self.on_candle(candle).await,
            FeedEvent::Resync { expected, received } => {
                log::warn!(
                    "⚠️ {} K线缺口 (期望 {}, 收到 {})，清空窗口重新积累",
                    self.symbol,
                    expected,
                    received
                );
                self.window.clear();
            }
            FeedEvent::Degraded => {
                self.degraded = true;
                self.forward(ExecutorCommand::FeedDegraded(true));
            }
            FeedEvent::Recovered => {
                self.degraded = false;
                self.forward(ExecutorCommand::FeedDegraded(false));
            }
        }
    }

    async fn on_candle(&mut self, candle: Candle) {
        self.forward(ExecutorCommand::Candle(candle.clone()));
        if !candle.closed {
            return;
        }

        if self.window.len() == self.ctx.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(candle);

        if self.degraded {
            log::debug!("{} 行情降级中，跳过信号评估", self.symbol);
            return;
        }

        let window = self.window.make_contiguous();
        let signal = self.ctx.strategy.evaluate(&self.symbol, window);
        self.on_signal(signal).await;
    }

    async fn on_signal(&mut self, signal: Signal) {
        // 先回收已结束的执行器，避免对已平仓位发送平仓
        self.reap().await;

        if let Some((side, handle)) = &self.executor {
            if signal.action.closes(*side) {
                log::info!(
                    "📉 {} 信号 {} 触发平仓 ({}): {}",
                    self.symbol,
                    signal.action,
                    handle.state(),
                    signal.reason
                );
                self.forward(ExecutorCommand::Exit(ExitReason::Signal));
                self.ctx.risk.observe(&signal).await;
                return;
            }
        }

        if signal.direction().is_none() {
            if signal.action != SignalAction::Hold {
                log::debug!("{} 无持仓，忽略平仓信号", self.symbol);
            }
            self.ctx.risk.observe(&signal).await;
            return;
        }

        if self.retired {
            log::info!("🚫 {} 已移出交易池，忽略开仓信号", self.symbol);
            self.ctx.risk.observe(&signal).await;
            return;
        }

        let universe = self.ctx.universe.snapshot().await;
        let instrument = match universe.get(&self.symbol) {
            Some(instrument) => instrument.clone(),
            None => {
                log::info!("🚫 {} 不在当前交易池，忽略开仓信号", self.symbol);
                self.ctx.risk.observe(&signal).await;
                return;
            }
        };

        match self.ctx.risk.evaluate(&signal, &instrument).await {
            Ok(intent) => {
                log::info!(
                    "✅ {} 风控通过: {} 数量 {} 杠杆 {}x 止损 {} (强度 {:.2}, {})",
                    self.symbol,
                    intent.side,
                    intent.quantity,
                    intent.leverage,
                    intent.stop_loss,
                    signal.strength,
                    signal.reason
                );
                let side = intent.side;
                let handle = PositionExecutor::spawn(self.ctx.execution.clone(), intent, instrument);
                self.executor = Some((side, handle));
            }
            Err(rejection) => {
                log::info!("🚫 {} {} 信号被拒绝: {}", self.symbol, signal.action, rejection);
            }
        }
    }

    fn forward(&self, command: ExecutorCommand) {
        if let Some((_, handle)) = &self.executor {
            if !handle.send(command) {
                log::debug!("{} 执行器已结束，命令丢弃", self.symbol);
            }
        }
    }

    fn flatten(&self, reason: ExitReason) {
        match &self.executor {
            Some(_) => {
                log::info!("🖐️ {} 收到平仓指令", self.symbol);
                self.forward(ExecutorCommand::Exit(reason));
            }
            None => log::info!("{} 无持仓，无需平仓", self.symbol),
        }
    }

    /// 回收已结束的执行器；致命结果上报编排器
    async fn reap(&mut self) {
        let finished = matches!(&self.executor, Some((_, handle)) if handle.is_finished());
        if !finished {
            return;
        }
        if let Some((_, handle)) = self.executor.take() {
            self.collect(handle).await;
        }
    }

    async fn collect(&self, handle: ExecutorHandle) {
        match handle.join().await {
            Ok(outcome) => {
                log::info!(
                    "📒 {} 仓位结束: {} (已实现盈亏 {:.4})",
                    self.symbol,
                    outcome.position.state,
                    outcome.position.realized_pnl
                );
                if let Some(fatal) = outcome.fatal {
                    let _ = self.ctx.fatal.send(fatal);
                }
            }
            Err(e) => {
                let _ = self.ctx.fatal.send(e);
            }
        }
    }

    /// 退出前把执行器驱动到终态
    async fn drain(&mut self) {
        if let Some((_, handle)) = self.executor.take() {
            log::info!("⏳ {} 等待仓位收尾 ({})", self.symbol, handle.state());
            handle.send(ExecutorCommand::Shutdown);
            self.collect(handle).await;
        }
    }

    fn publish_status(&self) {
        let status = WorkerStatus {
            symbol: self.symbol.clone(),
            window_len: self.window.len(),
            degraded: self.degraded,
            retired: self.retired,
            position: self
                .executor
                .as_ref()
                .map(|(side, handle)| (*side, handle.state())),
        };
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ExecutionConfig, RiskConfig, SignalConfig, UniverseConfig};
    use crate::core::exchange::ExchangeGateway;
    use crate::exchanges::{PaperExchange, SyntheticMarket};
    use crate::strategies::build_strategy;
    use crate::strategies::test_support::candles_from_closes;
    use crate::utils::order_id::OrderIdGenerator;
    use crate::utils::trade_logger::TradeLogger;
    use crate::utils::webhook::AlertBus;

    struct Fixture {
        handle: WorkerHandle,
        feed: mpsc::Sender<FeedEvent>,
        risk: Arc<RiskManager>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(signal: SignalConfig) -> Fixture {
        let market = Arc::new(SyntheticMarket::with_symbols(&["BTCUSDT".to_string()]));
        let paper = Arc::new(PaperExchange::new(market));
        let gateway: Arc<dyn ExchangeGateway> = paper;
        let (alerts, _rx) = AlertBus::channel();
        let risk = Arc::new(RiskManager::new(RiskConfig::default(), alerts.clone()));
        let universe = Arc::new(UniverseManager::new(
            UniverseConfig {
                min_quote_volume: 0.0,
                ..UniverseConfig::default()
            },
            gateway.clone(),
            alerts.clone(),
        ));
        universe.refresh().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let execution = ExecutionContext {
            gateway,
            risk: risk.clone(),
            trade_log: Arc::new(TradeLogger::new(dir.path()).unwrap()),
            alerts,
            order_ids: Arc::new(OrderIdGenerator::new("rule_table")),
            config: ExecutionConfig::default(),
            strategy_tag: "rule_table".to_string(),
        };
        let strategy: Arc<dyn SignalStrategy> = Arc::from(build_strategy(&signal));
        let (fatal, _fatal_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            window_capacity: strategy.required_candles() + 5,
            strategy,
            risk: risk.clone(),
            universe,
            execution,
            fatal,
        };
        let (feed, feed_rx) = mpsc::channel(64);
        let handle = InstrumentWorker::spawn("BTCUSDT", ctx, feed_rx);
        Fixture {
            handle,
            feed,
            risk,
            _dir: dir,
        }
    }

    async fn settle() {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_resync_clears_it() {
        let fx = fixture(SignalConfig::default()).await;
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i % 3) as f64 * 0.1).collect();
        for candle in candles_from_closes("BTCUSDT", &closes) {
            fx.feed.send(FeedEvent::Candle(candle)).await.unwrap();
        }
        settle().await;
        let capacity = build_strategy(&SignalConfig::default()).required_candles() + 5;
        assert_eq!(fx.handle.status().window_len, capacity);

        fx.feed
            .send(FeedEvent::Resync {
                expected: chrono::Utc::now(),
                received: chrono::Utc::now(),
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(fx.handle.status().window_len, 0);

        fx.handle.send(WorkerCommand::Shutdown);
        fx.handle.join().await;
    }

    #[tokio::test]
    async fn test_degraded_feed_skips_evaluation() {
        let fx = fixture(SignalConfig::default()).await;
        fx.feed.send(FeedEvent::Degraded).await.unwrap();

        // 持续上涨，正常情况下会触发做多
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        for candle in candles_from_closes("BTCUSDT", &closes) {
            fx.feed.send(FeedEvent::Candle(candle)).await.unwrap();
        }
        settle().await;

        let status = fx.handle.status();
        assert!(status.degraded);
        assert!(status.position.is_none());
        assert!(!fx.risk.has_claim("BTCUSDT").await);

        fx.handle.send(WorkerCommand::Shutdown);
        fx.handle.join().await;
    }

    #[tokio::test]
    async fn test_retire_without_position_stops_worker() {
        let fx = fixture(SignalConfig::default()).await;
        fx.handle.send(WorkerCommand::Retire);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !fx.handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(fx.handle.status().retired);
    }
}

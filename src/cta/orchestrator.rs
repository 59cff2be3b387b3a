//! 流水线编排器
//! 按交易对池启停各交易对的行情订阅与流水线，负责进程级生命周期：启动、排空、关闭

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};

use crate::core::config::AppConfig;
use crate::core::error::TradingError;
use crate::core::exchange::ExchangeGateway;
use crate::core::feed::{FeedStatusBoard, FeedSupervisor};
use crate::core::risk_manager::{RiskManager, RiskSnapshot};
use crate::core::universe::{Universe, UniverseManager};
use crate::cta::instrument_worker::{
    InstrumentWorker, WorkerCommand, WorkerContext, WorkerHandle, WorkerStatus,
};
use crate::execution::ExecutionContext;
use crate::strategies::{build_strategy, SignalStrategy};
use crate::utils::order_id::OrderIdGenerator;
use crate::utils::trade_logger::TradeLogger;
use crate::utils::webhook::{AlertBus, AlertEvent};

/// 行情事件通道容量
const FEED_CHANNEL_CAPACITY: usize = 256;

/// 健康报告
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub risk: RiskSnapshot,
    pub universe_size: usize,
    pub universe_generation: u64,
    pub universe_failures: u32,
    pub degraded_feeds: Vec<String>,
    pub workers: Vec<WorkerStatus>,
}

impl HealthReport {
    /// 有持仓的交易对
    pub fn live_positions(&self) -> Vec<&WorkerStatus> {
        self.workers.iter().filter(|w| w.position.is_some()).collect()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let breaker = match &self.risk.tripped {
            Some(trip) => format!("🔴 {} ({})", trip.kind, trip.detail),
            None => "🟢 正常".to_string(),
        };
        let positions: Vec<String> = self
            .live_positions()
            .iter()
            .filter_map(|w| {
                w.position
                    .map(|(side, state)| format!("{} {} {}", w.symbol, side, state))
            })
            .collect();

        write!(
            f,
            "💓 健康报告\n\
            ├─ 交易对池: {} 个 (第{}版, 连续失败 {})\n\
            ├─ 流水线: {} 个, 降级行情: {:?}\n\
            ├─ 持仓: {:?}\n\
            ├─ 权益: ${:.2} (已实现 ${:.2}, 占用保证金 ${:.2})\n\
            ├─ 连续亏损: {}, 窗口盈亏: ${:.2}, 组合振幅: {:.2}%\n\
            └─ 熔断: {}",
            self.universe_size,
            self.universe_generation,
            self.universe_failures,
            self.workers.len(),
            self.degraded_feeds,
            positions,
            self.risk.equity,
            self.risk.realized_pnl,
            self.risk.reserved_margin,
            self.risk.consecutive_losses,
            self.risk.window_pnl,
            self.risk.portfolio_volatility_pct,
            breaker
        )
    }
}

enum Control {
    Flatten {
        symbol: String,
        reply: oneshot::Sender<bool>,
    },
    FlattenAll,
    ResetCircuitBreaker,
    Health(oneshot::Sender<HealthReport>),
    Shutdown,
}

/// 运维句柄，可在任意任务中克隆使用
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl OrchestratorHandle {
    /// 手动平掉某个交易对的持仓；交易对不在运行返回 false
    pub async fn flatten(&self, symbol: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .control
            .send(Control::Flatten {
                symbol: symbol.to_string(),
                reply,
            })
            .is_ok();
        sent && rx.await.unwrap_or(false)
    }

    pub fn flatten_all(&self) {
        let _ = self.control.send(Control::FlattenAll);
    }

    pub fn reset_circuit_breaker(&self) {
        let _ = self.control.send(Control::ResetCircuitBreaker);
    }

    /// 编排器已退出时返回 None
    pub async fn health(&self) -> Option<HealthReport> {
        let (reply, rx) = oneshot::channel();
        self.control.send(Control::Health(reply)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

struct RunningInstrument {
    worker: WorkerHandle,
    feed: JoinHandle<()>,
    feed_stop: watch::Sender<bool>,
}

impl RunningInstrument {
    /// 停止行情订阅并等待流水线退出
    async fn stop(self) {
        let _ = self.feed_stop.send(true);
        self.worker.join().await;
        if let Err(e) = self.feed.await {
            log::warn!("行情任务异常退出: {}", e);
        }
    }
}

/// 编排器
pub struct Orchestrator {
    config: AppConfig,
    gateway: Arc<dyn ExchangeGateway>,
    strategy: Arc<dyn SignalStrategy>,
    risk: Arc<RiskManager>,
    universe: Arc<UniverseManager>,
    feeds: Arc<FeedStatusBoard>,
    execution: ExecutionContext,
    alerts: AlertBus,
    instruments: HashMap<String, RunningInstrument>,
    fatal_tx: mpsc::UnboundedSender<TradingError>,
    fatal_rx: mpsc::UnboundedReceiver<TradingError>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn ExchangeGateway>,
        alerts: AlertBus,
    ) -> Result<(Self, OrchestratorHandle), TradingError> {
        config.validate()?;

        let strategy: Arc<dyn SignalStrategy> = Arc::from(build_strategy(&config.signal));
        let risk = Arc::new(RiskManager::new(config.risk.clone(), alerts.clone()));
        let universe = Arc::new(UniverseManager::new(
            config.universe.clone(),
            gateway.clone(),
            alerts.clone(),
        ));
        let trade_log = Arc::new(TradeLogger::new(&config.trade_log.dir)?);
        let execution = ExecutionContext {
            gateway: gateway.clone(),
            risk: risk.clone(),
            trade_log,
            alerts: alerts.clone(),
            order_ids: Arc::new(OrderIdGenerator::new(&config.strategy_tag)),
            config: config.execution.clone(),
            strategy_tag: config.strategy_tag.clone(),
        };
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();

        log::info!(
            "🧩 编排器就绪: 策略 {} (至少 {} 根K线), 网关 {}",
            strategy.name(),
            strategy.required_candles(),
            gateway.name()
        );

        Ok((
            Self {
                config,
                gateway,
                strategy,
                risk,
                universe,
                feeds: Arc::new(FeedStatusBoard::new()),
                execution,
                alerts,
                instruments: HashMap::new(),
                fatal_tx,
                fatal_rx,
                control_rx,
            },
            OrchestratorHandle { control },
        ))
    }

    /// 运行直到收到关闭指令或出现进程级致命错误；返回前总会排空所有仓位
    pub async fn run(mut self) -> Result<(), TradingError> {
        let result = self.event_loop().await;
        if let Err(e) = &result {
            log::error!("❌ 致命错误，开始排空: {}", e);
            self.alerts.emit(AlertEvent::Fatal {
                reason: e.to_string(),
            });
        }
        self.drain().await;
        log::info!("{}", self.risk.get_risk_report().await);
        result
    }

    async fn event_loop(&mut self) -> Result<(), TradingError> {
        self.refresh_universe().await?;

        let refresh_period = Duration::from_secs(self.config.universe.refresh_interval_secs.max(1));
        let health_period = Duration::from_secs(self.config.health_report_secs.max(1));
        let mut refresh = interval_at(Instant::now() + refresh_period, refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval_at(Instant::now() + health_period, health_period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh_universe().await?,
                _ = health.tick() => {
                    self.reap_retired().await;
                    let report = self.health_report().await;
                    log::info!("{}", report);
                }
                Some(fatal) = self.fatal_rx.recv() => return Err(fatal),
                control = self.control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => {
                        log::info!("🛑 收到关闭指令");
                        return Ok(());
                    }
                    Some(control) => self.handle_control(control).await,
                },
            }
        }
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Flatten { symbol, reply } => {
                let sent = self
                    .instruments
                    .get(&symbol)
                    .map(|running| running.worker.send(WorkerCommand::Flatten))
                    .unwrap_or(false);
                if !sent {
                    log::warn!("⚠️ {} 不在运行中，无法平仓", symbol);
                }
                let _ = reply.send(sent);
            }
            Control::FlattenAll => {
                log::warn!("🖐️ 手动平掉全部持仓");
                for running in self.instruments.values() {
                    running.worker.send(WorkerCommand::Flatten);
                }
            }
            Control::ResetCircuitBreaker => self.risk.reset_circuit_breaker().await,
            Control::Health(reply) => {
                let report = self.health_report().await;
                let _ = reply.send(report);
            }
            Control::Shutdown => {}
        }
    }

    /// 刷新交易对池；只有连续失败耗尽才向上返回错误
    async fn refresh_universe(&mut self) -> Result<(), TradingError> {
        match self.universe.refresh().await {
            Ok(universe) => {
                self.sync_instruments(&universe).await;
                Ok(())
            }
            Err(e) if e.is_process_fatal() => Err(e),
            Err(_) => Ok(()),
        }
    }

    async fn sync_instruments(&mut self, universe: &Universe) {
        self.reap_retired().await;

        for running in self.instruments.values() {
            let status = running.worker.status();
            if !universe.contains(running.worker.symbol()) && !status.retired {
                running.worker.send(WorkerCommand::Retire);
            }
        }

        let added: Vec<String> = universe
            .symbols()
            .filter(|s| !self.instruments.contains_key(*s))
            .cloned()
            .collect();
        for symbol in added {
            self.start_instrument(&symbol);
        }
    }

    fn start_instrument(&mut self, symbol: &str) {
        let interval = self.config.feed.timeframe_for(symbol);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let (feed_stop, stop_rx) = watch::channel(false);

        let feed = FeedSupervisor::new(
            symbol,
            interval,
            self.gateway.clone(),
            self.config.feed.clone(),
            self.alerts.clone(),
            self.feeds.clone(),
            feed_tx,
        )
        .spawn(stop_rx);

        let ctx = WorkerContext {
            strategy: self.strategy.clone(),
            risk: self.risk.clone(),
            universe: self.universe.clone(),
            execution: self.execution.clone(),
            fatal: self.fatal_tx.clone(),
            window_capacity: self.strategy.required_candles() + self.config.feed.window_padding,
        };
        let worker = InstrumentWorker::spawn(symbol, ctx, feed_rx);

        self.instruments.insert(
            symbol.to_string(),
            RunningInstrument {
                worker,
                feed,
                feed_stop,
            },
        );
    }

    /// 回收已退出的（被移出交易池的）流水线
    async fn reap_retired(&mut self) {
        let finished: Vec<String> = self
            .instruments
            .iter()
            .filter(|(_, running)| running.worker.is_finished())
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in finished {
            if let Some(running) = self.instruments.remove(&symbol) {
                running.stop().await;
                self.risk.forget_symbol(&symbol).await;
                log::info!("🧹 {} 流水线已回收", symbol);
            }
        }
    }

    async fn health_report(&self) -> HealthReport {
        let universe = self.universe.snapshot().await;
        let mut workers: Vec<WorkerStatus> = self
            .instruments
            .values()
            .map(|running| running.worker.status())
            .collect();
        workers.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        HealthReport {
            risk: self.risk.snapshot().await,
            universe_size: universe.len(),
            universe_generation: universe.generation,
            universe_failures: self.universe.consecutive_failures(),
            degraded_feeds: self.feeds.degraded_symbols().await,
            workers,
        }
    }

    /// 通知所有流水线退出，等待仓位收尾，超时则放弃等待
    async fn drain(&mut self) {
        let running: Vec<RunningInstrument> = self.instruments.drain().map(|(_, r)| r).collect();
        if running.is_empty() {
            return;
        }

        log::info!("⏳ 排空 {} 个流水线", running.len());
        for instrument in &running {
            instrument.worker.send(WorkerCommand::Shutdown);
        }

        let deadline = Duration::from_secs(self.config.drain_timeout_secs);
        let stops = futures_util::future::join_all(running.into_iter().map(RunningInstrument::stop));
        match timeout(deadline, stops).await {
            Ok(_) => log::info!("✅ 所有流水线已退出"),
            Err(_) => {
                let live = self.risk.snapshot().await.live_positions;
                log::error!(
                    "🚨 排空超时 ({}s)，仍有持仓: {:?}",
                    self.config.drain_timeout_secs,
                    live
                );
            }
        }
    }
}

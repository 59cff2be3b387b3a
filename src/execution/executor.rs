//! 仓位执行器
//!
//! 每个仓位一个任务，独占自己的 `Position`，按状态机推进：
//! 入场下单 -> 等待成交 -> 挂止损止盈 -> 监控 -> 平仓 -> 上报风控和交易日志。
//! 交易对流水线通过命令通道把K线、平仓指令和关闭信号转发进来。

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Duration, Instant, MissedTickBehavior};

use super::state_machine::{Position, PositionEvent, PositionState};
use super::trailing_stop::TrailingStop;
use crate::core::config::{EntryOrderType, ExecutionConfig};
use crate::core::error::TradingError;
use crate::core::exchange::ExchangeGateway;
use crate::core::retry_policy::{ExponentialBackoffRetry, RetryConfig};
use crate::core::risk_manager::RiskManager;
use crate::core::types::{
    Candle, ExitReason, Instrument, OrderAck, OrderRequest, OrderStatus, PositionIntent,
    PositionSide, PositionSnapshot,
};
use crate::utils::order_id::{OrderIdGenerator, OrderPurpose};
use crate::utils::trade_logger::{TradeLogger, TradeRecord};
use crate::utils::webhook::{AlertBus, AlertEvent};

/// 限价入场单的成交轮询间隔
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// 平仓确认的间隔
const CLOSE_CONFIRM_INTERVAL: Duration = Duration::from_secs(1);
/// 交易所返回“只减仓单被拒”，通常意味着仓位已经没了
const REDUCE_ONLY_REJECTED: i32 = -2022;
/// 条件单会立即触发
const WOULD_IMMEDIATELY_TRIGGER: i32 = -2021;

/// 流水线发给执行器的命令
#[derive(Debug, Clone)]
pub enum ExecutorCommand {
    Candle(Candle),
    Exit(ExitReason),
    FeedDegraded(bool),
    Shutdown,
}

/// 执行结束时的结果；fatal 只在风控状态不一致时出现
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub position: Position,
    pub fatal: Option<TradingError>,
}

/// 执行器共享的依赖
#[derive(Clone)]
pub struct ExecutionContext {
    pub gateway: Arc<dyn ExchangeGateway>,
    pub risk: Arc<RiskManager>,
    pub trade_log: Arc<TradeLogger>,
    pub alerts: AlertBus,
    pub order_ids: Arc<OrderIdGenerator>,
    pub config: ExecutionConfig,
    /// 交易记录里的策略标签
    pub strategy_tag: String,
}

/// 执行器句柄，由交易对流水线持有
pub struct ExecutorHandle {
    symbol: String,
    commands: mpsc::UnboundedSender<ExecutorCommand>,
    state: watch::Receiver<PositionState>,
    join: JoinHandle<ExecutionOutcome>,
}

impl ExecutorHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 发送命令；执行器已结束时返回 false
    pub fn send(&self, command: ExecutorCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn state(&self) -> PositionState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<ExecutionOutcome, TradingError> {
        self.join
            .await
            .map_err(|e| TradingError::RiskStateInconsistency(format!("{} 执行任务异常退出: {}", self.symbol, e)))
    }
}

/// 单个仓位的执行器
pub struct PositionExecutor {
    ctx: ExecutionContext,
    instrument: Instrument,
    position: Position,
    state_tx: watch::Sender<PositionState>,
    trailing: Option<TrailingStop>,
    last_price: Option<f64>,
    degraded: bool,
    shutdown_requested: bool,
    /// 关闭时保留持仓（不平仓），执行器退出但仓位仍由交易所端的止损保护
    detached: bool,
    /// 保护单成交时交易所报告的价格
    observed_exit_price: Option<f64>,
}

impl PositionExecutor {
    pub fn spawn(ctx: ExecutionContext, intent: PositionIntent, instrument: Instrument) -> ExecutorHandle {
        let symbol = intent.symbol.clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PositionState::Pending);

        let executor = Self {
            ctx,
            instrument,
            position: Position::new(intent, Utc::now()),
            state_tx,
            trailing: None,
            last_price: None,
            degraded: false,
            shutdown_requested: false,
            detached: false,
            observed_exit_price: None,
        };

        ExecutorHandle {
            symbol,
            commands,
            state,
            join: tokio::spawn(executor.run(rx)),
        }
    }

    fn symbol(&self) -> String {
        self.position.symbol().to_string()
    }

    fn retry_policy(&self) -> ExponentialBackoffRetry {
        ExponentialBackoffRetry::new(RetryConfig {
            max_retries: self.ctx.config.submit_retries,
            initial_delay_ms: self.ctx.config.retry_base_delay_ms,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter: true,
        })
    }

    fn apply(&mut self, event: PositionEvent) -> Result<PositionState, TradingError> {
        let state = self.position.apply(event, Utc::now())?;
        let _ = self.state_tx.send(state);
        Ok(state)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ExecutorCommand>) -> ExecutionOutcome {
        log::info!(
            "🚀 {} {} 开始执行 数量 {} 入场 {:.4} 止损 {:.4}",
            self.position.symbol(),
            self.position.side(),
            self.position.intent.quantity,
            self.position.intent.entry_price,
            self.position.intent.stop_loss
        );

        let mut fatal = None;
        while !self.position.state.is_terminal() && !self.detached {
            let step = match self.position.state {
                PositionState::Pending => self.submit_entry(&mut commands).await,
                PositionState::Placed => self.await_fill(&mut commands).await,
                PositionState::Open => self.monitor(&mut commands).await,
                PositionState::Closing => self.close().await,
                PositionState::Closed | PositionState::Failed => break,
            };
            if let Err(e) = step {
                log::error!("❌ {} 执行器出错: {}", self.position.symbol(), e);
                fatal = Some(e);
                break;
            }
        }

        if fatal.is_none() {
            fatal = self.finish().await.err();
        }

        ExecutionOutcome {
            position: self.position,
            fatal,
        }
    }

    /// 不阻塞地处理已到达的命令
    fn drain_commands(&mut self, commands: &mut mpsc::UnboundedReceiver<ExecutorCommand>) {
        loop {
            match commands.try_recv() {
                Ok(command) => self.note_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.shutdown_requested = true;
                    break;
                }
            }
        }
    }

    /// 记录不需要立即动作的命令
    fn note_command(&mut self, command: ExecutorCommand) {
        match command {
            ExecutorCommand::Candle(candle) => self.last_price = Some(candle.close),
            ExecutorCommand::FeedDegraded(degraded) => self.degraded = degraded,
            ExecutorCommand::Shutdown | ExecutorCommand::Exit(_) => self.shutdown_requested = true,
        }
    }

    async fn submit(&self, label: &str, request: OrderRequest) -> Result<OrderAck, TradingError> {
        let gateway = &self.ctx.gateway;
        let name = format!("{} {}", self.position.symbol(), label);
        self.retry_policy()
            .execute_with_retry(&name, || gateway.place_order(request.clone()))
            .await
    }

    // ---------- pending ----------

    async fn submit_entry(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ExecutorCommand>,
    ) -> Result<(), TradingError> {
        self.drain_commands(commands);
        if self.shutdown_requested {
            self.apply(PositionEvent::EntryCancelled)?;
            return Ok(());
        }

        let intent = &self.position.intent;
        let side = intent.side.entry_side();
        let client_order_id = self.ctx.order_ids.generate(OrderPurpose::Entry);
        let mut request = match self.ctx.config.entry_order_type {
            EntryOrderType::Market => OrderRequest::market(
                &intent.symbol,
                side,
                intent.quantity,
                intent.leverage,
                client_order_id,
            ),
            EntryOrderType::Limit => OrderRequest::limit(
                &intent.symbol,
                side,
                intent.quantity,
                intent.entry_price,
                intent.leverage,
                intent.post_only,
                client_order_id,
            ),
        };
        request.stop_loss = Some(intent.stop_loss);
        request.take_profit = intent.take_profit;

        match self.submit("入场", request).await {
            Ok(ack) => {
                log::info!(
                    "📝 {} 入场单已提交 {} 状态 {:?}",
                    self.position.symbol(),
                    ack.order_id,
                    ack.status
                );
                self.apply(PositionEvent::EntrySubmitted {
                    order_id: ack.order_id.clone(),
                })?;
                if ack.status == OrderStatus::Filled && ack.filled_quantity > 0.0 {
                    let price = ack.average_price.unwrap_or(self.position.intent.entry_price);
                    self.on_filled(ack.filled_quantity, price).await?;
                }
            }
            Err(e) => {
                log::warn!("❌ {} 入场失败: {}", self.position.symbol(), e);
                let reason = e.to_string();
                if e.is_unrecoverable_for_order() {
                    self.apply(PositionEvent::Unrecoverable { reason })?;
                } else {
                    self.apply(PositionEvent::SubmitFailed { reason })?;
                }
            }
        }
        Ok(())
    }

    // ---------- placed ----------

    async fn await_fill(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ExecutorCommand>,
    ) -> Result<(), TradingError> {
        let deadline = Instant::now() + Duration::from_secs(self.ctx.config.entry_timeout_secs);
        let mut poll = interval_at(Instant::now() + FILL_POLL_INTERVAL, FILL_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    log::warn!("⏰ {} 入场单超时，撤单", self.position.symbol());
                    return self.cancel_entry(PositionEvent::EntryTimedOut).await;
                }
                _ = poll.tick() => {
                    match self.ctx.gateway.get_position(self.position.symbol()).await {
                        Ok(snapshot) if self.holds_position(&snapshot) => {
                            if snapshot.size + 1e-12 >= self.position.intent.quantity {
                                return self.on_filled(snapshot.size, snapshot.entry_price).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) if e.is_unrecoverable_for_order() => {
                            self.apply(PositionEvent::Unrecoverable { reason: e.to_string() })?;
                            return Ok(());
                        }
                        Err(e) => log::debug!("{} 查询持仓失败: {}", self.position.symbol(), e),
                    }
                }
                command = commands.recv() => match command {
                    Some(ExecutorCommand::Candle(candle)) => self.last_price = Some(candle.close),
                    Some(ExecutorCommand::FeedDegraded(degraded)) => self.degraded = degraded,
                    Some(ExecutorCommand::Exit(reason)) => {
                        log::info!("🛑 {} 入场单未成交即收到平仓指令({})，撤单", self.position.symbol(), reason);
                        return self.cancel_entry(PositionEvent::EntryCancelled).await;
                    }
                    Some(ExecutorCommand::Shutdown) | None => {
                        self.shutdown_requested = true;
                        return self.cancel_entry(PositionEvent::EntryCancelled).await;
                    }
                }
            }
        }
    }

    fn holds_position(&self, snapshot: &PositionSnapshot) -> bool {
        snapshot.side == Some(self.position.side()) && snapshot.size > 0.0
    }

    /// 撤掉入场单；撤单期间可能已部分成交，此时按已成交数量进入 open
    async fn cancel_entry(&mut self, event: PositionEvent) -> Result<(), TradingError> {
        if let Some(order_id) = self.position.entry_order_id.clone() {
            if let Err(e) = self
                .ctx
                .gateway
                .cancel_order(self.position.symbol(), &order_id)
                .await
            {
                log::debug!("{} 撤销入场单 {} 失败: {}", self.position.symbol(), order_id, e);
            }
        }

        match self.ctx.gateway.get_position(self.position.symbol()).await {
            Ok(snapshot) if self.holds_position(&snapshot) => {
                log::warn!(
                    "⚠️ {} 撤单时已成交 {}，转入持仓管理",
                    self.position.symbol(),
                    snapshot.size
                );
                self.on_filled(snapshot.size, snapshot.entry_price).await
            }
            _ => {
                self.apply(event)?;
                Ok(())
            }
        }
    }

    // ---------- open ----------

    /// 成交后立即挂止损止盈；止损挂不上就紧急平仓
    async fn on_filled(&mut self, quantity: f64, average_price: f64) -> Result<(), TradingError> {
        self.apply(PositionEvent::EntryFilled {
            quantity,
            average_price,
        })?;
        log::info!(
            "✅ {} {} 开仓成交 {} @ {:.4}",
            self.position.symbol(),
            self.position.side(),
            quantity,
            average_price
        );

        let symbol = self.symbol();
        let exit_side = self.position.side().exit_side();
        let stop = OrderRequest::stop_market(
            &symbol,
            exit_side,
            quantity,
            self.position.stop_loss,
            self.ctx.order_ids.generate(OrderPurpose::StopLoss),
        );

        match self.submit("止损", stop).await {
            Ok(ack) => self.position.stop_order_id = Some(ack.order_id),
            Err(e) => {
                let error = TradingError::UnprotectedPosition {
                    symbol: symbol.clone(),
                    reason: e.to_string(),
                };
                log::error!("🚨 {}，紧急平仓", error);
                self.ctx.alerts.emit(AlertEvent::EmergencyClose {
                    symbol,
                    reason: format!("止损单挂单失败: {}", e),
                });
                self.apply(PositionEvent::ExitTriggered(ExitReason::Emergency))?;
                return Ok(());
            }
        }

        if let Some(take_profit) = self.position.intent.take_profit {
            let request = OrderRequest::take_profit_market(
                &symbol,
                exit_side,
                quantity,
                take_profit,
                self.ctx.order_ids.generate(OrderPurpose::TakeProfit),
            );
            match self.submit("止盈", request).await {
                Ok(ack) => self.position.take_profit_order_id = Some(ack.order_id),
                Err(e) => log::warn!("⚠️ {} 止盈单挂单失败，仅保留止损: {}", symbol, e),
            }
        }

        let trailing = &self.ctx.config.trailing_stop;
        if trailing.enabled {
            self.trailing = Some(TrailingStop::new(
                trailing,
                self.position.side(),
                average_price,
                self.position.stop_loss,
            ));
        }
        Ok(())
    }

    async fn monitor(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ExecutorCommand>,
    ) -> Result<(), TradingError> {
        if self.shutdown_requested {
            return self.on_shutdown();
        }

        let period = Duration::from_secs(self.ctx.config.fallback_poll_secs.max(1));
        let mut poll = interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ExecutorCommand::Candle(candle)) => {
                        self.last_price = Some(candle.close);
                        if candle.closed || self.ctx.config.trailing_stop.use_live_candle {
                            if let Some(reason) = self.on_price(&candle).await? {
                                self.apply(PositionEvent::ExitTriggered(reason))?;
                                return Ok(());
                            }
                            if self.position.state != PositionState::Open {
                                return Ok(());
                            }
                        }
                    }
                    Some(ExecutorCommand::Exit(reason)) => {
                        log::info!("🛑 {} 收到平仓指令: {}", self.position.symbol(), reason);
                        self.apply(PositionEvent::ExitTriggered(reason))?;
                        return Ok(());
                    }
                    Some(ExecutorCommand::FeedDegraded(degraded)) => self.degraded = degraded,
                    Some(ExecutorCommand::Shutdown) | None => {
                        self.shutdown_requested = true;
                        return self.on_shutdown();
                    }
                },
                _ = poll.tick() => {
                    if let Some(reason) = self.poll_position().await? {
                        self.apply(PositionEvent::ExitTriggered(reason))?;
                        return Ok(());
                    }
                    if self.position.state != PositionState::Open {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_shutdown(&mut self) -> Result<(), TradingError> {
        if self.ctx.config.flatten_on_shutdown {
            self.apply(PositionEvent::ExitTriggered(ExitReason::Shutdown))?;
        } else {
            log::warn!(
                "📌 {} 关闭时保留持仓，由交易所端止损 {:.4} 保护",
                self.position.symbol(),
                self.position.stop_loss
            );
            self.detached = true;
        }
        Ok(())
    }

    /// 轮询兜底：交易所端保护单成交后仓位变平
    async fn poll_position(&mut self) -> Result<Option<ExitReason>, TradingError> {
        let snapshot = match self.ctx.gateway.get_position(self.position.symbol()).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_unrecoverable_for_order() => {
                self.apply(PositionEvent::Unrecoverable {
                    reason: e.to_string(),
                })?;
                return Ok(None);
            }
            Err(e) => {
                log::warn!("⚠️ {} 轮询持仓失败: {}", self.position.symbol(), e);
                return Ok(None);
            }
        };

        if snapshot.is_flat() {
            self.observed_exit_price = snapshot.last_exit_price;
            let reason = self.classify_protective_fill(snapshot.last_exit_price);
            log::info!(
                "🔔 {} 仓位已被交易所端平掉 ({}) @ {:?}",
                self.position.symbol(),
                reason,
                snapshot.last_exit_price
            );
            return Ok(Some(reason));
        }

        if self.degraded && snapshot.mark_price > 0.0 {
            let mark = snapshot.mark_price;
            self.last_price = Some(mark);
            return self.trail(mark, mark).await;
        }
        Ok(None)
    }

    fn classify_protective_fill(&self, exit_price: Option<f64>) -> ExitReason {
        let trailing_active = self.trailing.as_ref().map_or(false, |t| t.is_active());
        let stop_reason = if trailing_active {
            ExitReason::TrailingStop
        } else {
            ExitReason::StopLoss
        };

        match (exit_price, self.position.intent.take_profit) {
            (Some(price), Some(tp)) => {
                if (price - tp).abs() < (price - self.position.stop_loss).abs() {
                    ExitReason::TakeProfit
                } else {
                    stop_reason
                }
            }
            _ => stop_reason,
        }
    }

    async fn on_price(&mut self, candle: &Candle) -> Result<Option<ExitReason>, TradingError> {
        let extreme = match self.position.side() {
            PositionSide::Long => candle.high,
            PositionSide::Short => candle.low,
        };
        self.trail(extreme, candle.close).await
    }

    /// 用最有利价格更新追踪止损，用当前价检查是否越过
    async fn trail(&mut self, favorable: f64, current: f64) -> Result<Option<ExitReason>, TradingError> {
        let candidate = match self.trailing.as_mut() {
            Some(trailing) => trailing
                .propose(favorable)
                .map(|c| self.instrument.round_price(c)),
            None => return Ok(None),
        };

        if let Some(candidate) = candidate {
            let tighter = self
                .trailing
                .as_ref()
                .map_or(false, |t| t.is_tighter(candidate));
            if tighter {
                if let Some(reason) = self.replace_stop(candidate).await? {
                    return Ok(Some(reason));
                }
            }
        }

        let crossed = self
            .trailing
            .as_ref()
            .map_or(false, |t| t.is_active() && t.is_crossed(current));
        Ok(crossed.then_some(ExitReason::TrailingStop))
    }

    /// 先挂新止损再撤旧止损，中间不留空档
    async fn replace_stop(&mut self, new_stop: f64) -> Result<Option<ExitReason>, TradingError> {
        let symbol = self.symbol();
        let request = OrderRequest::stop_market(
            &symbol,
            self.position.side().exit_side(),
            self.position.filled_quantity,
            new_stop,
            self.ctx.order_ids.generate(OrderPurpose::StopLoss),
        );

        match self.submit("追踪止损", request).await {
            Ok(ack) => {
                if let Some(old) = self.position.stop_order_id.replace(ack.order_id) {
                    if let Err(e) = self.ctx.gateway.cancel_order(&symbol, &old).await {
                        log::debug!("{} 撤销旧止损 {} 失败: {}", symbol, old, e);
                    }
                }
                if let Some(trailing) = self.trailing.as_mut() {
                    trailing.commit(new_stop);
                }
                log::info!(
                    "📈 {} 追踪止损 {:.4} -> {:.4}",
                    symbol,
                    self.position.stop_loss,
                    new_stop
                );
                self.position.stop_loss = new_stop;
                Ok(None)
            }
            Err(TradingError::ExchangeRejection { code, .. }) if code == WOULD_IMMEDIATELY_TRIGGER => {
                log::info!("📉 {} 价格已越过追踪止损 {:.4}", symbol, new_stop);
                Ok(Some(ExitReason::TrailingStop))
            }
            Err(e) if e.is_unrecoverable_for_order() => {
                self.apply(PositionEvent::Unrecoverable {
                    reason: e.to_string(),
                })?;
                Ok(None)
            }
            Err(e) => {
                log::warn!("⚠️ {} 更新追踪止损失败，保留原止损: {}", symbol, e);
                Ok(None)
            }
        }
    }

    // ---------- closing ----------

    async fn close(&mut self) -> Result<(), TradingError> {
        let symbol = self.symbol();
        let exit_side = self.position.side().exit_side();
        let attempts = self.ctx.config.close_confirm_attempts.max(1);
        let mut exit_price = self.observed_exit_price;

        for attempt in 1..=attempts {
            let snapshot = match self.ctx.gateway.get_position(&symbol).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("⚠️ {} 平仓前查询持仓失败 ({}/{}): {}", symbol, attempt, attempts, e);
                    sleep(CLOSE_CONFIRM_INTERVAL).await;
                    continue;
                }
            };

            if !self.holds_position(&snapshot) {
                return self.confirm_flat(&snapshot, exit_price).await;
            }

            let request = OrderRequest::close_market(
                &symbol,
                exit_side,
                snapshot.size,
                self.ctx.order_ids.generate(OrderPurpose::Close),
            );
            match self.submit("平仓", request).await {
                Ok(ack) => {
                    if let Some(price) = ack.average_price {
                        exit_price = Some(price);
                    }
                    log::info!("📤 {} 平仓单已成交 {:?}", symbol, ack.average_price);
                }
                Err(TradingError::ExchangeRejection { code, .. }) if code == REDUCE_ONLY_REJECTED => {
                    log::info!("{} 平仓单被拒（仓位可能已平），重新确认", symbol);
                }
                Err(e) if e.is_unrecoverable_for_order() => {
                    self.ctx.alerts.emit(AlertEvent::EmergencyClose {
                        symbol: symbol.clone(),
                        reason: format!("平仓失败且不可恢复: {}", e),
                    });
                    self.apply(PositionEvent::Unrecoverable {
                        reason: e.to_string(),
                    })?;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("⚠️ {} 平仓单失败 ({}/{}): {}", symbol, attempt, attempts, e);
                    sleep(CLOSE_CONFIRM_INTERVAL).await;
                }
            }
        }

        // 最后一次平仓单可能已经成交，只确认不再下单
        match self.ctx.gateway.get_position(&symbol).await {
            Ok(snapshot) if !self.holds_position(&snapshot) => {
                return self.confirm_flat(&snapshot, exit_price).await;
            }
            Ok(_) => {}
            Err(e) => log::warn!("⚠️ {} 平仓确认查询失败: {}", symbol, e),
        }

        let reason = format!("{} 次尝试后仍无法确认平仓", attempts);
        self.ctx.alerts.emit(AlertEvent::EmergencyClose {
            symbol: symbol.clone(),
            reason: reason.clone(),
        });
        self.apply(PositionEvent::Unrecoverable { reason })?;
        Ok(())
    }

    async fn confirm_flat(
        &mut self,
        snapshot: &PositionSnapshot,
        exit_price: Option<f64>,
    ) -> Result<(), TradingError> {
        let price = exit_price
            .or(snapshot.last_exit_price)
            .or(self.last_price)
            .unwrap_or(snapshot.mark_price);
        self.cancel_protection().await;
        self.apply(PositionEvent::Flat { exit_price: price })?;
        Ok(())
    }

    async fn cancel_protection(&mut self) {
        let symbol = self.symbol();
        for order_id in [
            self.position.stop_order_id.clone(),
            self.position.take_profit_order_id.clone(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = self.ctx.gateway.cancel_order(&symbol, &order_id).await {
                log::debug!("{} 撤销保护单 {} 失败（可能已成交）: {}", symbol, order_id, e);
            }
        }
    }

    // ---------- terminal ----------

    async fn finish(&mut self) -> Result<(), TradingError> {
        let symbol = self.symbol();
        match self.position.state {
            PositionState::Closed => {
                let closed_at = self.position.closed_at.unwrap_or_else(Utc::now);
                let exit_reason = self.position.exit_reason.unwrap_or(ExitReason::Signal);
                log::info!(
                    "🏁 {} {} 平仓完成 ({}) 盈亏 {:.4}",
                    symbol,
                    self.position.side(),
                    exit_reason,
                    self.position.realized_pnl
                );

                let record = TradeRecord {
                    trade_id: self.position.intent.intent_id.clone(),
                    symbol: symbol.clone(),
                    side: self.position.side(),
                    quantity: self.position.filled_quantity,
                    entry_price: self.position.average_entry_price,
                    exit_price: self.position.exit_price.unwrap_or(0.0),
                    leverage: self.position.intent.leverage,
                    realized_pnl: self.position.realized_pnl,
                    strategy: self.ctx.strategy_tag.clone(),
                    stop_loss: self.position.stop_loss,
                    take_profit: self.position.intent.take_profit,
                    exit_reason,
                    opened_at: self.position.opened_at.unwrap_or(closed_at),
                    closed_at,
                };
                if let Err(e) = self.ctx.trade_log.append(&record) {
                    log::warn!("⚠️ {} 交易日志写入失败: {}", symbol, e);
                }

                self.ctx
                    .risk
                    .on_position_closed(&symbol, self.position.realized_pnl, closed_at)
                    .await
            }
            PositionState::Failed => {
                let reason = self
                    .position
                    .failure
                    .clone()
                    .unwrap_or_else(|| "未知原因".to_string());
                self.ctx.alerts.emit(AlertEvent::PositionFailed {
                    symbol: symbol.clone(),
                    reason,
                });
                self.ctx.risk.on_execution_failed(&symbol).await
            }
            _ => Ok(()),
        }
    }
}

//! 全局风险管理模块
//! 所有实例共享一个 RiskState，评估与状态修改在同一把锁内完成

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::core::circuit_breaker::{CircuitBreakers, TripState};
use crate::core::config::RiskConfig;
use crate::core::error::TradingError;
use crate::core::types::{Instrument, PositionIntent, PositionSide, Signal};
use crate::utils::webhook::{AlertBus, AlertEvent};

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionRule {
    CircuitBreaker,
    NotAnEntry,
    InstrumentUnavailable,
    DuplicatePosition,
    MaxPositions,
    InvalidStop,
    BelowMinQuantity,
    InsufficientMargin,
    LiquidationProximity,
}

impl fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RejectionRule::CircuitBreaker => "circuit_breaker",
            RejectionRule::NotAnEntry => "not_an_entry",
            RejectionRule::InstrumentUnavailable => "instrument_unavailable",
            RejectionRule::DuplicatePosition => "duplicate_position",
            RejectionRule::MaxPositions => "max_positions",
            RejectionRule::InvalidStop => "invalid_stop",
            RejectionRule::BelowMinQuantity => "below_min_quantity",
            RejectionRule::InsufficientMargin => "insufficient_margin",
            RejectionRule::LiquidationProximity => "liquidation_proximity",
        };
        write!(f, "{}", s)
    }
}

/// 风控拒绝，是正常结果而不是错误
#[derive(Debug, Clone, PartialEq)]
pub struct RiskRejection {
    pub rule: RejectionRule,
    pub detail: String,
    required_margin: Option<(f64, f64)>,
}

impl RiskRejection {
    fn new(rule: RejectionRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
            required_margin: None,
        }
    }
}

impl fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.detail)
    }
}

impl From<RiskRejection> for TradingError {
    fn from(rejection: RiskRejection) -> Self {
        match rejection.required_margin {
            Some((required, available)) => TradingError::InsufficientMargin {
                required,
                available,
            },
            None => TradingError::validation(rejection.rule.to_string(), rejection.detail),
        }
    }
}

/// 已批准仓位的独占声明
#[derive(Debug, Clone)]
struct Claim {
    intent_id: String,
    side: PositionSide,
    reserved_margin: f64,
}

/// 全局风控状态
#[derive(Debug)]
struct RiskState {
    realized_pnl: f64,
    claims: HashMap<String, Claim>,
    breakers: CircuitBreakers,
}

impl RiskState {
    fn reserved_margin(&self) -> f64 {
        self.claims.values().map(|c| c.reserved_margin).sum()
    }
}

/// 风控快照，用于健康报告
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub realized_pnl: f64,
    pub reserved_margin: f64,
    pub available_margin: f64,
    pub live_positions: Vec<String>,
    pub consecutive_losses: u32,
    pub window_pnl: f64,
    pub portfolio_volatility_pct: f64,
    pub tripped: Option<TripState>,
}

/// 强平价估算（逐仓、U本位线性合约）
pub fn estimate_liquidation_price(
    side: PositionSide,
    entry: f64,
    leverage: u32,
    maintenance_margin_rate: f64,
) -> f64 {
    let inverse_leverage = 1.0 / leverage.max(1) as f64;
    match side {
        PositionSide::Long => entry * (1.0 - inverse_leverage + maintenance_margin_rate),
        PositionSide::Short => entry * (1.0 + inverse_leverage - maintenance_margin_rate),
    }
}

/// 全局风险管理器
pub struct RiskManager {
    config: RiskConfig,
    state: Mutex<RiskState>,
    alerts: AlertBus,
    intent_seq: AtomicU64,
}

impl RiskManager {
    pub fn new(config: RiskConfig, alerts: AlertBus) -> Self {
        let breakers = CircuitBreakers::new(
            config.circuit_breaker.clone(),
            config.starting_equity,
        );
        Self {
            config,
            state: Mutex::new(RiskState {
                realized_pnl: 0.0,
                claims: HashMap::new(),
                breakers,
            }),
            alerts,
            intent_seq: AtomicU64::new(0),
        }
    }

    /// 记录信号携带的振幅读数（每根收盘K线都会调用）
    pub async fn observe(&self, signal: &Signal) {
        self.observe_at(signal, Utc::now()).await
    }

    pub async fn observe_at(&self, signal: &Signal, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        self.expire_cooldown(&mut state, now);
        if let Some(range_pct) = signal.volatility_pct() {
            if let Some(trip) = state
                .breakers
                .record_volatility(&signal.symbol, range_pct, now)
            {
                self.emit_trip(trip);
            }
        }
    }

    pub async fn evaluate(
        &self,
        signal: &Signal,
        instrument: &Instrument,
    ) -> Result<PositionIntent, RiskRejection> {
        self.evaluate_at(signal, instrument, Utc::now()).await
    }

    /// 评估开仓信号；批准时在同一临界区内预留保证金并声明交易对
    pub async fn evaluate_at(
        &self,
        signal: &Signal,
        instrument: &Instrument,
        now: DateTime<Utc>,
    ) -> Result<PositionIntent, RiskRejection> {
        let mut state = self.state.lock().await;

        // 先解除到期的熔断，再记录本次读数
        self.expire_cooldown(&mut state, now);
        if let Some(range_pct) = signal.volatility_pct() {
            if let Some(trip) = state
                .breakers
                .record_volatility(&signal.symbol, range_pct, now)
            {
                self.emit_trip(trip);
            }
        }

        // 1. 熔断检查
        if let Some(trip) = state.breakers.tripped() {
            return Err(RiskRejection::new(
                RejectionRule::CircuitBreaker,
                format!("{}: {}", trip.kind, trip.detail),
            ));
        }

        let side = signal.direction().ok_or_else(|| {
            RiskRejection::new(
                RejectionRule::NotAnEntry,
                format!("{} 不是开仓信号", signal.action),
            )
        })?;

        if !instrument.tradable || instrument.symbol != signal.symbol {
            return Err(RiskRejection::new(
                RejectionRule::InstrumentUnavailable,
                format!("{} 当前不可交易", signal.symbol),
            ));
        }

        // 2. 重复持仓与并发上限
        if state.claims.contains_key(&signal.symbol) {
            return Err(RiskRejection::new(
                RejectionRule::DuplicatePosition,
                format!("{} 已有持仓", signal.symbol),
            ));
        }
        if state.claims.len() >= self.config.max_parallel_positions {
            return Err(RiskRejection::new(
                RejectionRule::MaxPositions,
                format!(
                    "持仓数已达上限 {}",
                    self.config.max_parallel_positions
                ),
            ));
        }

        // 3. 仓位计算
        let entry = instrument.round_price(signal.entry_price);
        let stop = signal
            .stop_loss
            .map(|p| instrument.round_price(p))
            .ok_or_else(|| RiskRejection::new(RejectionRule::InvalidStop, "信号没有止损价"))?;
        let stop_on_safe_side = match side {
            PositionSide::Long => stop < entry,
            PositionSide::Short => stop > entry,
        };
        if entry <= 0.0 || stop <= 0.0 || !stop_on_safe_side {
            return Err(RiskRejection::new(
                RejectionRule::InvalidStop,
                format!("{} 入场 {} 止损 {} 方向不合理", side, entry, stop),
            ));
        }
        let take_profit = signal.take_profit.map(|p| instrument.round_price(p));

        let equity = self.config.starting_equity + state.realized_pnl;
        let risk_budget = equity * self.config.max_risk_per_trade;
        let raw_quantity = risk_budget / (entry - stop).abs();
        let quantity = instrument.floor_quantity(raw_quantity.min(instrument.max_qty));
        if quantity < instrument.min_qty || quantity <= 0.0 {
            return Err(RiskRejection::new(
                RejectionRule::BelowMinQuantity,
                format!("计算数量 {} 低于最小下单量 {}", quantity, instrument.min_qty),
            ));
        }

        // 4. 保证金与强平距离
        let leverage = self.config.leverage.min(instrument.max_leverage).max(1);
        let required_margin = quantity * entry / leverage as f64;
        let available = equity - state.reserved_margin();
        if required_margin > available {
            let mut rejection = RiskRejection::new(
                RejectionRule::InsufficientMargin,
                format!("需要 {:.4}, 可用 {:.4}", required_margin, available),
            );
            rejection.required_margin = Some((required_margin, available));
            return Err(rejection);
        }

        let liquidation = estimate_liquidation_price(
            side,
            entry,
            leverage,
            self.config.maintenance_margin_rate,
        );
        let buffer = self.config.liquidation_buffer_pct * entry;
        let too_close = match side {
            PositionSide::Long => stop - liquidation < buffer,
            PositionSide::Short => liquidation - stop < buffer,
        };
        if too_close {
            return Err(RiskRejection::new(
                RejectionRule::LiquidationProximity,
                format!("止损 {} 距离强平价 {:.4} 太近", stop, liquidation),
            ));
        }

        // 5. 预留保证金并声明交易对
        let seq = self.intent_seq.fetch_add(1, Ordering::SeqCst);
        let intent_id = format!("{}-{}-{}", signal.symbol, now.timestamp_millis(), seq);
        state.claims.insert(
            signal.symbol.clone(),
            Claim {
                intent_id: intent_id.clone(),
                side,
                reserved_margin: required_margin,
            },
        );

        log::info!(
            "✅ 风控通过 {} {} 数量 {} 杠杆 {}x 保证金 {:.2} 强平价 {:.4}",
            signal.symbol,
            side,
            quantity,
            leverage,
            required_margin,
            liquidation
        );

        Ok(PositionIntent {
            intent_id,
            symbol: signal.symbol.clone(),
            side,
            quantity,
            leverage,
            entry_price: entry,
            stop_loss: stop,
            take_profit,
            reduce_only: false,
            post_only: false,
            reserved_margin: required_margin,
            estimated_liquidation_price: liquidation,
            strategy: signal.strategy.clone(),
            created_at: now,
        })
    }

    /// 仓位平仓完成：记录盈亏、释放保证金、更新熔断计数
    pub async fn on_position_closed(
        &self,
        symbol: &str,
        realized_pnl: f64,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        let mut state = self.state.lock().await;
        let claim = state.claims.remove(symbol).ok_or_else(|| {
            TradingError::RiskStateInconsistency(format!("{} 平仓时找不到持仓声明", symbol))
        })?;

        state.realized_pnl += realized_pnl;
        log::info!(
            "📊 {} {} 平仓 盈亏 {:.4} (intent {})，累计 {:.4}",
            symbol,
            claim.side,
            realized_pnl,
            claim.intent_id,
            state.realized_pnl
        );

        if let Some(trip) = state.breakers.record_trade(realized_pnl, now) {
            self.emit_trip(trip);
        }
        Ok(())
    }

    /// 执行失败：释放保证金
    pub async fn on_execution_failed(&self, symbol: &str) -> Result<(), TradingError> {
        let mut state = self.state.lock().await;
        let claim = state.claims.remove(symbol).ok_or_else(|| {
            TradingError::RiskStateInconsistency(format!("{} 释放保证金时找不到持仓声明", symbol))
        })?;
        log::info!(
            "🔓 {} 执行失败，释放保证金 {:.4}",
            symbol,
            claim.reserved_margin
        );
        Ok(())
    }

    /// 人工重置熔断
    pub async fn reset_circuit_breaker(&self) {
        let mut state = self.state.lock().await;
        state.breakers.reset();
        log::warn!("🔧 熔断已被人工重置");
        self.alerts
            .emit(AlertEvent::CircuitBreakerReset { manual: true });
    }

    /// 交易对移出池子
    pub async fn forget_symbol(&self, symbol: &str) {
        self.state.lock().await.breakers.forget_symbol(symbol);
    }

    pub async fn has_claim(&self, symbol: &str) -> bool {
        self.state.lock().await.claims.contains_key(symbol)
    }

    pub async fn snapshot(&self) -> RiskSnapshot {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> RiskSnapshot {
        let mut state = self.state.lock().await;
        self.expire_cooldown(&mut state, now);
        let equity = self.config.starting_equity + state.realized_pnl;
        let reserved = state.reserved_margin();
        let mut live_positions: Vec<String> = state.claims.keys().cloned().collect();
        live_positions.sort();

        RiskSnapshot {
            equity,
            realized_pnl: state.realized_pnl,
            reserved_margin: reserved,
            available_margin: equity - reserved,
            live_positions,
            consecutive_losses: state.breakers.consecutive_losses(),
            window_pnl: state.breakers.window_pnl(),
            portfolio_volatility_pct: state.breakers.portfolio_volatility(),
            tripped: state.breakers.tripped().cloned(),
        }
    }

    /// 获取风险报告
    pub async fn get_risk_report(&self) -> String {
        let snapshot = self.snapshot().await;
        let breaker = match &snapshot.tripped {
            Some(trip) => format!("🔴 {} ({})", trip.kind, trip.detail),
            None => "🟢 正常".to_string(),
        };

        format!(
            "📊 风险报告\n\
            ├─ 权益: ${:.2}\n\
            ├─ 已实现盈亏: ${:.2}\n\
            ├─ 占用保证金: ${:.2} / 可用 ${:.2}\n\
            ├─ 持仓: {:?}\n\
            ├─ 连续亏损: {}\n\
            └─ 熔断: {}",
            snapshot.equity,
            snapshot.realized_pnl,
            snapshot.reserved_margin,
            snapshot.available_margin,
            snapshot.live_positions,
            snapshot.consecutive_losses,
            breaker
        )
    }

    fn expire_cooldown(&self, state: &mut RiskState, now: DateTime<Utc>) {
        if state.breakers.expire_cooldown(now) {
            log::info!("✅ 熔断冷却期结束，恢复开仓");
            self.alerts
                .emit(AlertEvent::CircuitBreakerReset { manual: false });
        }
    }

    fn emit_trip(&self, trip: TripState) {
        log::error!("🚨 熔断触发 [{}] {}", trip.kind, trip.detail);
        self.alerts.emit(AlertEvent::CircuitBreakerTripped {
            breaker: trip.kind,
            detail: trip.detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::BreakerKind;
    use crate::core::types::{Interval, LiquidityTier, SignalAction};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn instrument(symbol: &str) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            base_asset: symbol.trim_end_matches("USDT").to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            max_qty: 1000.0,
            max_leverage: 20,
            liquidity: LiquidityTier::High,
            quote_volume_24h: 1e9,
            price_change_pct_24h: 2.0,
            tradable: true,
        }
    }

    fn long_signal(symbol: &str, entry: f64, stop: f64) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            interval: Interval::FifteenMinutes,
            action: SignalAction::EnterLong,
            strength: 0.7,
            entry_price: entry,
            stop_loss: Some(stop),
            take_profit: Some(entry + 3.0),
            indicators: BTreeMap::new(),
            reason: "test".to_string(),
            strategy: "rule_table".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn manager() -> (RiskManager, tokio::sync::mpsc::UnboundedReceiver<AlertEvent>) {
        let (bus, rx) = AlertBus::channel();
        let config = RiskConfig {
            starting_equity: 1000.0,
            max_risk_per_trade: 0.01,
            max_parallel_positions: 2,
            leverage: 5,
            ..RiskConfig::default()
        };
        (RiskManager::new(config, bus), rx)
    }

    #[tokio::test]
    async fn test_position_sizing_from_stop_distance() {
        let (risk, _rx) = manager();
        let intent = risk
            .evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
            .await
            .unwrap();

        assert_eq!(intent.quantity, 5.0);
        assert_eq!(intent.leverage, 5);
        assert!((intent.reserved_margin - 100.0).abs() < 1e-9);
        // 止损时亏损不超过 1% 权益
        assert!(intent.risk_amount() <= 10.0 + 1e-9);

        let snapshot = risk.snapshot().await;
        assert_eq!(snapshot.live_positions, vec!["BTCUSDT".to_string()]);
        assert!((snapshot.available_margin - 900.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicate_and_parallel_limits() {
        let (risk, _rx) = manager();
        risk.evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
            .await
            .unwrap();

        let dup = risk
            .evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
            .await
            .unwrap_err();
        assert_eq!(dup.rule, RejectionRule::DuplicatePosition);

        risk.evaluate(&long_signal("ETHUSDT", 100.0, 98.0), &instrument("ETHUSDT"))
            .await
            .unwrap();
        let full = risk
            .evaluate(&long_signal("SOLUSDT", 100.0, 98.0), &instrument("SOLUSDT"))
            .await
            .unwrap_err();
        assert_eq!(full.rule, RejectionRule::MaxPositions);
        assert_eq!(full.to_string(), "[max_positions] 持仓数已达上限 2");
    }

    #[tokio::test]
    async fn test_concurrent_signals_claim_once() {
        let (risk, _rx) = manager();
        let risk = Arc::new(risk);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let risk = risk.clone();
            handles.push(tokio::spawn(async move {
                risk.evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
                    .await
                    .is_ok()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_rejections_for_bad_inputs() {
        let (risk, _rx) = manager();

        let wrong_side = risk
            .evaluate(&long_signal("BTCUSDT", 100.0, 101.0), &instrument("BTCUSDT"))
            .await
            .unwrap_err();
        assert_eq!(wrong_side.rule, RejectionRule::InvalidStop);

        // 止损太远，数量低于最小值
        let mut inst = instrument("BTCUSDT");
        inst.min_qty = 1.0;
        inst.qty_step = 1.0;
        let tiny = risk
            .evaluate(&long_signal("BTCUSDT", 100.0, 80.0), &inst)
            .await
            .unwrap_err();
        assert_eq!(tiny.rule, RejectionRule::BelowMinQuantity);

        // 50倍杠杆下 2% 止损已经越过强平价
        let (bus, _rx2) = AlertBus::channel();
        let risky = RiskManager::new(
            RiskConfig {
                leverage: 50,
                ..RiskConfig::default()
            },
            bus,
        );
        let mut inst = instrument("BTCUSDT");
        inst.max_leverage = 50;
        let liq = risky
            .evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &inst)
            .await
            .unwrap_err();
        assert_eq!(liq.rule, RejectionRule::LiquidationProximity);

        let mut hold = long_signal("BTCUSDT", 100.0, 98.0);
        hold.action = SignalAction::Hold;
        let not_entry = risk.evaluate(&hold, &instrument("BTCUSDT")).await.unwrap_err();
        assert_eq!(not_entry.rule, RejectionRule::NotAnEntry);
    }

    #[tokio::test]
    async fn test_insufficient_margin_maps_to_error() {
        let (bus, _rx) = AlertBus::channel();
        let risk = RiskManager::new(
            RiskConfig {
                starting_equity: 1000.0,
                max_risk_per_trade: 0.05,
                leverage: 1,
                ..RiskConfig::default()
            },
            bus,
        );
        // 数量 = 50 / 2 = 25，名义 2500 > 权益 1000
        let rejection = risk
            .evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
            .await
            .unwrap_err();
        assert_eq!(rejection.rule, RejectionRule::InsufficientMargin);
        assert!(matches!(
            TradingError::from(rejection),
            TradingError::InsufficientMargin { .. }
        ));
    }

    #[tokio::test]
    async fn test_breaker_after_losses_blocks_entries_until_reset() {
        let (risk, mut rx) = manager();
        let now = Utc::now();

        for _ in 0..3 {
            risk.evaluate_at(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"), now)
                .await
                .unwrap();
            risk.on_position_closed("BTCUSDT", -1.0, now).await.unwrap();
        }

        let blocked = risk
            .evaluate_at(&long_signal("ETHUSDT", 100.0, 98.0), &instrument("ETHUSDT"), now)
            .await
            .unwrap_err();
        assert_eq!(blocked.rule, RejectionRule::CircuitBreaker);
        assert!(matches!(
            rx.recv().await,
            Some(AlertEvent::CircuitBreakerTripped {
                breaker: BreakerKind::ConsecutiveLosses,
                ..
            })
        ));

        risk.reset_circuit_breaker().await;
        assert!(risk
            .evaluate_at(&long_signal("ETHUSDT", 100.0, 98.0), &instrument("ETHUSDT"), now)
            .await
            .is_ok());
        assert_eq!(risk.snapshot().await.consecutive_losses, 0);
    }

    fn volatile_signal(symbol: &str, range_pct: f64) -> Signal {
        let mut signal = long_signal(symbol, 100.0, 98.0);
        signal
            .indicators
            .insert(Signal::VOLATILITY_KEY.to_string(), range_pct);
        signal
    }

    #[tokio::test]
    async fn test_volatile_signal_after_cooldown_trips_again() {
        let (risk, mut rx) = manager();
        let t0 = Utc::now();
        let cooldown = RiskConfig::default().circuit_breaker.cooldown_secs;
        let threshold = RiskConfig::default().circuit_breaker.volatility_threshold_pct;
        let reading = threshold * 2.5;

        let first = risk
            .evaluate_at(&volatile_signal("BTCUSDT", reading), &instrument("BTCUSDT"), t0)
            .await
            .unwrap_err();
        assert_eq!(first.rule, RejectionRule::CircuitBreaker);

        // 冷却期过后，同样的高振幅读数应当重新触发熔断
        let later = t0 + chrono::Duration::seconds(cooldown + 100);
        let second = risk
            .evaluate_at(&volatile_signal("BTCUSDT", reading), &instrument("BTCUSDT"), later)
            .await
            .unwrap_err();
        assert_eq!(second.rule, RejectionRule::CircuitBreaker);
        assert!(!risk.has_claim("BTCUSDT").await);

        let tripped = risk.snapshot_at(later).await.tripped.unwrap();
        assert_eq!(tripped.kind, BreakerKind::Volatility);
        assert_eq!(tripped.tripped_at, later);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events.as_slice(),
            [
                AlertEvent::CircuitBreakerTripped { .. },
                AlertEvent::CircuitBreakerReset { manual: false },
                AlertEvent::CircuitBreakerTripped { .. },
            ]
        ));
    }

    #[tokio::test]
    async fn test_snapshot_expires_cooldown() {
        let (risk, _rx) = manager();
        let t0 = Utc::now();
        let cooldown = RiskConfig::default().circuit_breaker.cooldown_secs;

        for _ in 0..3 {
            risk.evaluate_at(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"), t0)
                .await
                .unwrap();
            risk.on_position_closed("BTCUSDT", -1.0, t0).await.unwrap();
        }
        assert!(risk.snapshot_at(t0).await.tripped.is_some());

        // 没有新的开仓信号，健康报告也应显示已解除
        let snapshot = risk
            .snapshot_at(t0 + chrono::Duration::seconds(cooldown))
            .await;
        assert!(snapshot.tripped.is_none());
        assert_eq!(snapshot.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_release_without_claim_is_inconsistent() {
        let (risk, _rx) = manager();
        let err = risk.on_execution_failed("BTCUSDT").await.unwrap_err();
        assert!(err.is_process_fatal());

        risk.evaluate(&long_signal("BTCUSDT", 100.0, 98.0), &instrument("BTCUSDT"))
            .await
            .unwrap();
        risk.on_execution_failed("BTCUSDT").await.unwrap();
        assert!(!risk.has_claim("BTCUSDT").await);
        assert_eq!(risk.snapshot().await.reserved_margin, 0.0);
    }
}

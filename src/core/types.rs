use chrono::{DateTime, Duration, Utc};
/// 统一的类型定义模块
/// 交易对、K线、信号、下单意图等数据结构
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::error::TradingError;

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, TradingError>;

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 持仓方向（不支持双向持仓）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// 开仓方向
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// 平仓方向
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// 盈亏符号：多头 +1，空头 -1
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// 订单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// 时间间隔
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    #[default]
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    OneDay,
}

impl Interval {
    pub fn from_string(s: &str) -> Result<Self> {
        match s {
            "1m" => Ok(Interval::OneMinute),
            "3m" => Ok(Interval::ThreeMinutes),
            "5m" => Ok(Interval::FiveMinutes),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            "2h" => Ok(Interval::TwoHours),
            "4h" => Ok(Interval::FourHours),
            "1d" => Ok(Interval::OneDay),
            _ => Err(TradingError::validation(
                "interval",
                format!("不支持的时间间隔: {}", s),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            Interval::OneMinute => 60,
            Interval::ThreeMinutes => 180,
            Interval::FiveMinutes => 300,
            Interval::FifteenMinutes => 900,
            Interval::ThirtyMinutes => 1800,
            Interval::OneHour => 3600,
            Interval::TwoHours => 7200,
            Interval::FourHours => 14400,
            Interval::OneDay => 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.to_seconds())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Interval {
    type Error = TradingError;

    fn try_from(value: String) -> Result<Self> {
        Interval::from_string(&value)
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}

// ============= 交易对 =============

/// 流动性分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityTier {
    Low,
    Medium,
    High,
}

impl LiquidityTier {
    /// 按24小时成交额(计价货币)分级
    pub fn from_quote_volume(quote_volume: f64) -> Self {
        if quote_volume >= 100_000_000.0 {
            LiquidityTier::High
        } else if quote_volume >= 10_000_000.0 {
            LiquidityTier::Medium
        } else {
            LiquidityTier::Low
        }
    }
}

/// 交易对及其交易约束
///
/// 由 UniverseManager 整体替换，其他组件只读。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub max_leverage: u32,
    pub liquidity: LiquidityTier,
    #[serde(default)]
    pub quote_volume_24h: f64,
    /// 24小时涨跌幅绝对值(%)，作为波动率过滤依据
    #[serde(default)]
    pub price_change_pct_24h: f64,
    #[serde(default = "default_tradable")]
    pub tradable: bool,
}

fn default_tradable() -> bool {
    true
}

impl Instrument {
    /// 价格按tick取整
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let ticks = (price / self.tick_size).round();
        normalize(ticks * self.tick_size, self.tick_size)
    }

    /// 数量按步长向下取整
    pub fn floor_quantity(&self, quantity: f64) -> f64 {
        if self.qty_step <= 0.0 {
            return quantity;
        }
        // 加一点容差，避免 0.3/0.1 = 2.9999999 这类浮点误差
        let steps = (quantity / self.qty_step + 1e-9).floor();
        normalize(steps * self.qty_step, self.qty_step)
    }
}

/// 去掉步长乘法带来的浮点尾数
fn normalize(value: f64, step: f64) -> f64 {
    let decimals = decimals_of(step);
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn decimals_of(step: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

// ============= K线 =============

/// K线数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// 是否已收盘；未收盘K线只用于盘中追踪止损
    pub closed: bool,
}

impl Candle {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.interval.duration()
    }

    /// 振幅(%)
    pub fn range_pct(&self) -> f64 {
        if self.close <= 0.0 {
            return 0.0;
        }
        (self.high - self.low) / self.close * 100.0
    }
}

// ============= 订单 =============

/// 下单请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    /// 客户端订单ID，重试时保持不变以保证幂等
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn market(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        leverage: u32,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            trigger_price: None,
            leverage,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
            post_only: false,
            client_order_id,
        }
    }

    pub fn limit(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        leverage: u32,
        post_only: bool,
        client_order_id: String,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            post_only,
            ..Self::market(symbol, side, quantity, leverage, client_order_id)
        }
    }

    /// 只减仓的市价平仓单
    pub fn close_market(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        client_order_id: String,
    ) -> Self {
        Self {
            reduce_only: true,
            ..Self::market(symbol, side, quantity, 1, client_order_id)
        }
    }

    /// 只减仓的止损条件单
    pub fn stop_market(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        client_order_id: String,
    ) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            ..Self::market(symbol, side, quantity, 1, client_order_id)
        }
    }

    /// 只减仓的止盈条件单
    pub fn take_profit_market(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        client_order_id: String,
    ) -> Self {
        Self {
            order_type: OrderType::TakeProfitMarket,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            ..Self::market(symbol, side, quantity, 1, client_order_id)
        }
    }
}

/// 下单回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
}

/// 交易所持仓快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Option<PositionSide>,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    /// 最近一次减仓成交价
    pub last_exit_price: Option<f64>,
}

impl PositionSnapshot {
    pub fn flat(symbol: &str, mark_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: None,
            size: 0.0,
            entry_price: 0.0,
            mark_price,
            last_exit_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size <= f64::EPSILON
    }
}

// ============= 信号 =============

/// 信号动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    EnterLong,
    EnterShort,
    /// 平仓；None 表示不区分方向
    Exit(Option<PositionSide>),
    Hold,
}

impl SignalAction {
    pub fn entry_side(&self) -> Option<PositionSide> {
        match self {
            SignalAction::EnterLong => Some(PositionSide::Long),
            SignalAction::EnterShort => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// 该信号是否要求关闭给定方向的持仓
    pub fn closes(&self, side: PositionSide) -> bool {
        match self {
            SignalAction::Exit(None) => true,
            SignalAction::Exit(Some(target)) => *target == side,
            // 反向开仓信号对已有持仓等同于平仓
            SignalAction::EnterLong => side == PositionSide::Short,
            SignalAction::EnterShort => side == PositionSide::Long,
            SignalAction::Hold => false,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalAction::EnterLong => write!(f, "enter-long"),
            SignalAction::EnterShort => write!(f, "enter-short"),
            SignalAction::Exit(None) => write!(f, "exit"),
            SignalAction::Exit(Some(side)) => write!(f, "exit-{}", side),
            SignalAction::Hold => write!(f, "hold"),
        }
    }
}

/// 交易信号，生成后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub interval: Interval,
    pub action: SignalAction,
    /// 0.0 ~ 1.0
    pub strength: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub indicators: BTreeMap<String, f64>,
    pub reason: String,
    pub strategy: String,
    /// 最后一根已收盘K线的收盘时间
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub const VOLATILITY_KEY: &'static str = "range_volatility_pct";

    pub fn hold(
        symbol: &str,
        interval: Interval,
        strategy: &str,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            action: SignalAction::Hold,
            strength: 0.0,
            entry_price: 0.0,
            stop_loss: None,
            take_profit: None,
            indicators: BTreeMap::new(),
            reason: reason.into(),
            strategy: strategy.to_string(),
            timestamp,
        }
    }

    pub fn direction(&self) -> Option<PositionSide> {
        self.action.entry_side()
    }

    pub fn volatility_pct(&self) -> Option<f64> {
        self.indicators.get(Self::VOLATILITY_KEY).copied()
    }
}

/// 风控批准后的开仓意图，由执行状态机消费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionIntent {
    pub intent_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub reserved_margin: f64,
    pub estimated_liquidation_price: f64,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
}

impl PositionIntent {
    /// 止损触发时的预计亏损
    pub fn risk_amount(&self) -> f64 {
        self.quantity * (self.entry_price - self.stop_loss).abs()
    }
}

/// 平仓原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Signal,
    Manual,
    Shutdown,
    Emergency,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Signal => "signal",
            ExitReason::Manual => "manual",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Emergency => "emergency",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> Instrument {
        Instrument {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            tick_size: 0.1,
            qty_step: 0.001,
            min_qty: 0.001,
            max_qty: 1000.0,
            max_leverage: 125,
            liquidity: LiquidityTier::High,
            quote_volume_24h: 1e9,
            price_change_pct_24h: 2.0,
            tradable: true,
        }
    }

    #[test]
    fn test_instrument_rounding() {
        let inst = instrument();
        assert_eq!(inst.floor_quantity(0.0129), 0.012);
        assert_eq!(inst.floor_quantity(0.3), 0.3);
        assert_eq!(inst.round_price(64123.46), 64123.5);
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!(Interval::from_string("15m").unwrap(), Interval::FifteenMinutes);
        assert_eq!(Interval::FourHours.to_seconds(), 14400);
        assert!(Interval::from_string("7m").is_err());
    }

    #[test]
    fn test_signal_action_closes() {
        assert!(SignalAction::Exit(None).closes(PositionSide::Long));
        assert!(!SignalAction::Exit(Some(PositionSide::Short)).closes(PositionSide::Long));
        assert!(SignalAction::EnterShort.closes(PositionSide::Long));
        assert!(!SignalAction::Hold.closes(PositionSide::Short));
    }
}

use crate::core::error::TradingError;
use crate::core::types::{Interval, LiquidityTier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: TradingMode,
    /// 写入交易记录的策略标签
    pub strategy_tag: String,
    pub universe: UniverseConfig,
    pub feed: FeedConfig,
    pub signal: SignalConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
    pub trade_log: TradeLogConfig,
    pub paper: PaperConfig,
    /// 健康报告间隔（秒）
    pub health_report_secs: u64,
    /// 关闭时等待仓位清空的最长时间（秒）
    pub drain_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            strategy_tag: "rule_table".to_string(),
            universe: UniverseConfig::default(),
            feed: FeedConfig::default(),
            signal: SignalConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            alerts: AlertConfig::default(),
            logging: LoggingConfig::default(),
            trade_log: TradeLogConfig::default(),
            paper: PaperConfig::default(),
            health_report_secs: 300,
            drain_timeout_secs: 120,
        }
    }
}

/// 交易对池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    pub refresh_interval_secs: u64,
    /// 连续失败达到该次数后升级为致命错误
    pub max_consecutive_failures: u32,
    pub quote_asset: String,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub min_liquidity: LiquidityTier,
    pub min_quote_volume: f64,
    /// 24小时涨跌幅上限(%)，None 表示不过滤
    pub max_volatility_pct: Option<f64>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            max_consecutive_failures: 5,
            quote_asset: "USDT".to_string(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            min_liquidity: LiquidityTier::Medium,
            min_quote_volume: 0.0,
            max_volatility_pct: None,
        }
    }
}

/// 退避参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// 行情订阅配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub timeframe: Interval,
    /// 单个交易对覆盖默认周期
    pub timeframes: BTreeMap<String, Interval>,
    pub backoff: BackoffConfig,
    /// 连续重连失败多少次后标记为 feed-degraded
    pub max_retries: u32,
    /// 稳定推送多久后重置退避计数
    pub healthy_reset_secs: u64,
    /// 滑动窗口额外保留的K线数量
    pub window_padding: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            timeframe: Interval::FifteenMinutes,
            timeframes: BTreeMap::new(),
            backoff: BackoffConfig::default(),
            max_retries: 10,
            healthy_reset_secs: 300,
            window_padding: 20,
        }
    }
}

impl FeedConfig {
    pub fn timeframe_for(&self, symbol: &str) -> Interval {
        self.timeframes
            .get(symbol)
            .copied()
            .unwrap_or(self.timeframe)
    }
}

/// 策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RuleTable,
    Donchian,
}

/// 指标参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub atr_period: usize,
    /// 止损距离 = ATR * 倍数
    pub atr_stop_multiplier: f64,
    /// 止盈距离 = 止损距离 * 盈亏比
    pub reward_ratio: f64,
    pub volatility_lookback: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
            ema_fast: 9,
            ema_slow: 21,
            atr_period: 14,
            atr_stop_multiplier: 2.0,
            reward_ratio: 1.5,
            volatility_lookback: 20,
        }
    }
}

/// 规则条件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    RsiBelow,
    RsiAbove,
    MacdHistogramAbove,
    MacdHistogramBelow,
    MacdCrossUp,
    MacdCrossDown,
    CloseBelowLowerBand,
    CloseAboveUpperBand,
    CloseAboveMiddleBand,
    CloseBelowMiddleBand,
    EmaFastAboveSlow,
    EmaFastBelowSlow,
    EmaCrossUp,
    EmaCrossDown,
}

/// 单个条件，threshold 只对带阈值的条件有意义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub kind: ConditionKind,
    #[serde(default)]
    pub threshold: f64,
}

impl ConditionConfig {
    pub fn new(kind: ConditionKind, threshold: f64) -> Self {
        Self { kind, threshold }
    }

    pub fn flag(kind: ConditionKind) -> Self {
        Self { kind, threshold: 0.0 }
    }
}

/// 规则动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    EnterLong,
    EnterShort,
    Exit,
}

/// 规则：所有条件同时满足时触发动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub action: RuleAction,
    /// 仅对 exit 有效：只平多 / 只平空
    #[serde(default)]
    pub closes: Option<crate::core::types::PositionSide>,
    pub all: Vec<ConditionConfig>,
    #[serde(default = "default_rule_strength")]
    pub strength: f64,
}

fn default_rule_strength() -> f64 {
    0.6
}

/// Donchian通道参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DonchianConfig {
    pub period: usize,
    pub exit_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub volume_threshold: f64,
    pub trend_fast: usize,
    pub trend_slow: usize,
}

impl Default for DonchianConfig {
    fn default() -> Self {
        Self {
            period: 20,
            exit_period: 10,
            atr_period: 14,
            atr_multiplier: 2.0,
            volume_threshold: 1.5,
            trend_fast: 20,
            trend_slow: 50,
        }
    }
}

/// 信号配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub strategy: StrategyKind,
    pub indicators: IndicatorConfig,
    pub rules: Vec<RuleConfig>,
    pub donchian: DonchianConfig,
    /// 低于该强度的开仓信号视为 hold
    pub min_strength: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RuleTable,
            indicators: IndicatorConfig::default(),
            rules: default_rules(),
            donchian: DonchianConfig::default(),
            min_strength: 0.0,
        }
    }
}

/// 默认规则表
pub fn default_rules() -> Vec<RuleConfig> {
    use ConditionKind::*;
    vec![
        RuleConfig {
            name: "ema_trend_long".to_string(),
            action: RuleAction::EnterLong,
            closes: None,
            all: vec![
                ConditionConfig::flag(EmaCrossUp),
                ConditionConfig::new(MacdHistogramAbove, 0.0),
                ConditionConfig::new(RsiBelow, 70.0),
            ],
            strength: 0.7,
        },
        RuleConfig {
            name: "ema_trend_short".to_string(),
            action: RuleAction::EnterShort,
            closes: None,
            all: vec![
                ConditionConfig::flag(EmaCrossDown),
                ConditionConfig::new(MacdHistogramBelow, 0.0),
                ConditionConfig::new(RsiAbove, 30.0),
            ],
            strength: 0.7,
        },
        RuleConfig {
            name: "band_reversion_long".to_string(),
            action: RuleAction::EnterLong,
            closes: None,
            all: vec![
                ConditionConfig::flag(CloseBelowLowerBand),
                ConditionConfig::new(RsiBelow, 30.0),
            ],
            strength: 0.5,
        },
        RuleConfig {
            name: "band_reversion_short".to_string(),
            action: RuleAction::EnterShort,
            closes: None,
            all: vec![
                ConditionConfig::flag(CloseAboveUpperBand),
                ConditionConfig::new(RsiAbove, 70.0),
            ],
            strength: 0.5,
        },
        RuleConfig {
            name: "exit_long_exhaustion".to_string(),
            action: RuleAction::Exit,
            closes: Some(crate::core::types::PositionSide::Long),
            all: vec![
                ConditionConfig::flag(MacdCrossDown),
                ConditionConfig::new(RsiAbove, 65.0),
            ],
            strength: 0.6,
        },
        RuleConfig {
            name: "exit_short_exhaustion".to_string(),
            action: RuleAction::Exit,
            closes: Some(crate::core::types::PositionSide::Short),
            all: vec![
                ConditionConfig::flag(MacdCrossUp),
                ConditionConfig::new(RsiBelow, 35.0),
            ],
            strength: 0.6,
        },
    ]
}

/// 熔断配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub max_consecutive_losses: u32,
    /// 滚动窗口内已实现亏损占初始权益的比例上限
    pub max_drawdown_pct: f64,
    pub drawdown_window_secs: i64,
    /// K线平均振幅(%)阈值
    pub volatility_threshold_pct: f64,
    pub cooldown_secs: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 3,
            max_drawdown_pct: 0.10,
            drawdown_window_secs: 86_400,
            volatility_threshold_pct: 8.0,
            cooldown_secs: 3_600,
        }
    }
}

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub starting_equity: f64,
    /// 单笔最大风险（权益比例）
    pub max_risk_per_trade: f64,
    pub max_parallel_positions: usize,
    pub leverage: u32,
    pub maintenance_margin_rate: f64,
    /// 止损与强平价之间的最小安全距离（入场价比例）
    pub liquidation_buffer_pct: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_equity: 1000.0,
            max_risk_per_trade: 0.01,
            max_parallel_positions: 3,
            leverage: 5,
            maintenance_margin_rate: 0.005,
            liquidation_buffer_pct: 0.005,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// 入场订单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrderType {
    Market,
    Limit,
}

/// 追踪止损配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// 追踪距离（价格比例）
    pub distance_pct: f64,
    /// 浮盈达到初始风险的多少倍后启用
    pub activation_r: f64,
    /// 是否使用未收盘K线做盘中更新
    pub use_live_candle: bool,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_pct: 0.015,
            activation_r: 1.0,
            use_live_candle: false,
        }
    }
}

/// 执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub entry_order_type: EntryOrderType,
    pub post_only: bool,
    /// 限价单等待成交的超时（秒）
    pub entry_timeout_secs: u64,
    pub submit_retries: u32,
    pub retry_base_delay_ms: u64,
    /// 持仓轮询间隔（秒），同时作为行情降级时的兜底通道
    pub fallback_poll_secs: u64,
    /// 平仓确认最多轮询次数
    pub close_confirm_attempts: u32,
    pub trailing_stop: TrailingStopConfig,
    /// 关闭进程时市价平掉持仓
    pub flatten_on_shutdown: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_order_type: EntryOrderType::Market,
            post_only: false,
            entry_timeout_secs: 60,
            submit_retries: 3,
            retry_base_delay_ms: 500,
            fallback_poll_secs: 10,
            close_confirm_attempts: 5,
            trailing_stop: TrailingStopConfig::default(),
            flatten_on_shutdown: true,
        }
    }
}

/// 告警配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// 为空时只写日志
    pub webhook_url: Option<String>,
    pub min_level: String,
    pub rate_limit_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            min_level: "warning".to_string(),
            rate_limit_seconds: 60,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub root_dir: String,
    pub file_name: String,
    pub level: String,
    pub console_output: bool,
    pub pattern: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            root_dir: "logs".to_string(),
            file_name: "pipeline.log".to_string(),
            level: "INFO".to_string(),
            console_output: true,
            pattern: "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{M}] {m}{n}".to_string(),
        }
    }
}

/// 交易记录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeLogConfig {
    pub dir: String,
}

impl Default for TradeLogConfig {
    fn default() -> Self {
        Self {
            dir: "trade_history".to_string(),
        }
    }
}

/// 模拟盘行情来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperSource {
    Synthetic,
    Binance,
}

/// 模拟盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub source: PaperSource,
    /// synthetic 模式下生成的交易对
    pub symbols: Vec<String>,
    /// synthetic 模式下K线推送间隔（毫秒）
    pub tick_ms: u64,
    pub seed: u64,
    pub start_price: f64,
    pub binance_rest_url: String,
    pub binance_ws_url: String,
    /// 公共接口拿不到杠杆档位时使用的最大杠杆
    pub default_max_leverage: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            source: PaperSource::Synthetic,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tick_ms: 1000,
            seed: 42,
            start_price: 100.0,
            binance_rest_url: "https://fapi.binance.com".to_string(),
            binance_ws_url: "wss://fstream.binance.com/ws".to_string(),
            default_max_leverage: 20,
        }
    }
}

impl AppConfig {
    /// 从YAML文件加载配置，环境变量 CTA__SECTION__KEY 可覆盖
    pub fn from_file(path: &str) -> Result<Self, TradingError> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CTA").separator("__"))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置，任何问题都在交易开始前终止进程
    pub fn validate(&self) -> Result<(), TradingError> {
        let fatal = |key: &str, reason: String| {
            Err(TradingError::FatalConfiguration(format!("{}: {}", key, reason)))
        };

        let risk = &self.risk;
        if !(risk.max_risk_per_trade > 0.0 && risk.max_risk_per_trade <= 1.0) {
            return fatal(
                "risk.max_risk_per_trade",
                format!("必须在 (0, 1] 之间，当前 {}", risk.max_risk_per_trade),
            );
        }
        if risk.starting_equity <= 0.0 {
            return fatal("risk.starting_equity", "必须大于0".to_string());
        }
        if risk.leverage < 1 {
            return fatal("risk.leverage", "杠杆至少为1".to_string());
        }
        if risk.max_parallel_positions == 0 {
            return fatal("risk.max_parallel_positions", "至少允许1个持仓".to_string());
        }
        if !(0.0..0.5).contains(&risk.maintenance_margin_rate) {
            return fatal(
                "risk.maintenance_margin_rate",
                format!("不合理的维持保证金率 {}", risk.maintenance_margin_rate),
            );
        }
        if risk.circuit_breaker.max_consecutive_losses == 0 {
            return fatal(
                "risk.circuit_breaker.max_consecutive_losses",
                "必须大于0".to_string(),
            );
        }

        let backoff = &self.feed.backoff;
        if backoff.factor < 1.0 {
            return fatal("feed.backoff.factor", "退避因子不能小于1".to_string());
        }
        if backoff.base_delay_ms == 0 || backoff.max_delay_ms < backoff.base_delay_ms {
            return fatal(
                "feed.backoff",
                "base_delay_ms 必须大于0且不大于 max_delay_ms".to_string(),
            );
        }

        if self.universe.max_consecutive_failures == 0 {
            return fatal(
                "universe.max_consecutive_failures",
                "必须大于0".to_string(),
            );
        }
        let white: HashSet<&String> = self.universe.whitelist.iter().collect();
        if let Some(both) = self.universe.blacklist.iter().find(|s| white.contains(s)) {
            return fatal(
                "universe.blacklist",
                format!("{} 同时出现在白名单和黑名单中", both),
            );
        }

        // 周期为0时指标永远算不出来
        let ind = &self.signal.indicators;
        let mut periods = vec![
            ("signal.indicators.rsi_period", ind.rsi_period),
            ("signal.indicators.macd_fast", ind.macd_fast),
            ("signal.indicators.macd_signal", ind.macd_signal),
            ("signal.indicators.bollinger_period", ind.bollinger_period),
            ("signal.indicators.ema_fast", ind.ema_fast),
            ("signal.indicators.atr_period", ind.atr_period),
            ("signal.indicators.volatility_lookback", ind.volatility_lookback),
        ];
        if self.signal.strategy == StrategyKind::Donchian {
            let dc = &self.signal.donchian;
            periods.extend([
                ("signal.donchian.period", dc.period),
                ("signal.donchian.exit_period", dc.exit_period),
                ("signal.donchian.atr_period", dc.atr_period),
                ("signal.donchian.trend_fast", dc.trend_fast),
                ("signal.donchian.trend_slow", dc.trend_slow),
            ]);
        }
        if let Some((key, _)) = periods.iter().copied().find(|(_, period)| *period == 0) {
            return fatal(key, "周期必须大于0".to_string());
        }

        if self.signal.strategy == StrategyKind::RuleTable {
            self.validate_rules()?;
        }

        if self.execution.fallback_poll_secs == 0 {
            return fatal("execution.fallback_poll_secs", "必须大于0".to_string());
        }
        if self.execution.trailing_stop.enabled && self.execution.trailing_stop.distance_pct <= 0.0
        {
            return fatal(
                "execution.trailing_stop.distance_pct",
                "启用追踪止损时距离必须大于0".to_string(),
            );
        }

        if self.mode == TradingMode::Live {
            return fatal(
                "mode",
                "当前构建未接入实盘下单网关，只支持 paper 模式".to_string(),
            );
        }

        Ok(())
    }

    fn validate_rules(&self) -> Result<(), TradingError> {
        use ConditionKind::*;

        if self.signal.rules.is_empty() {
            return Err(TradingError::FatalConfiguration(
                "signal.rules: 规则表为空".to_string(),
            ));
        }

        let mut families = HashSet::new();
        for rule in &self.signal.rules {
            if rule.all.is_empty() {
                return Err(TradingError::FatalConfiguration(format!(
                    "signal.rules.{}: 规则没有任何条件",
                    rule.name
                )));
            }
            if rule.closes.is_some() && rule.action != RuleAction::Exit {
                return Err(TradingError::FatalConfiguration(format!(
                    "signal.rules.{}: closes 只能用于 exit 规则",
                    rule.name
                )));
            }
            for condition in &rule.all {
                let family = match condition.kind {
                    RsiBelow | RsiAbove => "rsi",
                    MacdHistogramAbove | MacdHistogramBelow | MacdCrossUp | MacdCrossDown => "macd",
                    CloseBelowLowerBand | CloseAboveUpperBand | CloseAboveMiddleBand
                    | CloseBelowMiddleBand => "bollinger",
                    EmaFastAboveSlow | EmaFastBelowSlow | EmaCrossUp | EmaCrossDown => "ema",
                };
                families.insert(family);
            }
        }

        if families.len() < 2 {
            return Err(TradingError::FatalConfiguration(
                "signal.rules: 规则表至少需要组合两类指标".to_string(),
            ));
        }

        let ind = &self.signal.indicators;
        if ind.macd_fast >= ind.macd_slow || ind.ema_fast >= ind.ema_slow {
            return Err(TradingError::FatalConfiguration(
                "signal.indicators: 快线周期必须小于慢线周期".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_live_mode_and_bad_risk() {
        let mut config = AppConfig::default();
        config.mode = TradingMode::Live;
        assert!(matches!(
            config.validate(),
            Err(TradingError::FatalConfiguration(_))
        ));

        let mut config = AppConfig::default();
        config.risk.max_risk_per_trade = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("risk.max_risk_per_trade"));
    }

    #[test]
    fn test_rule_table_needs_two_indicator_families() {
        let mut config = AppConfig::default();
        config.signal.rules = vec![RuleConfig {
            name: "rsi_only".into(),
            action: RuleAction::EnterLong,
            closes: None,
            all: vec![ConditionConfig::new(ConditionKind::RsiBelow, 30.0)],
            strength: 0.5,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_indicator_period_rejected() {
        let mut config = AppConfig::default();
        config.signal.indicators.atr_period = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TradingError::FatalConfiguration(_)));
        assert!(err.to_string().contains("signal.indicators.atr_period"));

        let mut config = AppConfig::default();
        config.signal.indicators.volatility_lookback = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.signal.strategy = StrategyKind::Donchian;
        config.signal.donchian.exit_period = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signal.donchian.exit_period"));
    }

    #[test]
    fn test_overlapping_lists_rejected() {
        let mut config = AppConfig::default();
        config.universe.whitelist = vec!["BTCUSDT".into()];
        config.universe.blacklist = vec!["BTCUSDT".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeframe_override() {
        let mut config = FeedConfig::default();
        config
            .timeframes
            .insert("ETHUSDT".to_string(), Interval::FiveMinutes);
        assert_eq!(config.timeframe_for("ETHUSDT"), Interval::FiveMinutes);
        assert_eq!(config.timeframe_for("BTCUSDT"), Interval::FifteenMinutes);
    }

    #[test]
    fn test_parse_yaml_rules() {
        let yaml = r#"
strategy: rule_table
rules:
  - name: cross
    action: enter_long
    all:
      - kind: ema_cross_up
      - kind: rsi_below
        threshold: 70
  - name: out
    action: exit
    closes: long
    all:
      - kind: rsi_above
        threshold: 80
"#;
        let signal: SignalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(signal.rules.len(), 2);
        assert_eq!(signal.rules[1].closes, Some(crate::core::types::PositionSide::Long));
        assert_eq!(signal.rules[0].all[1].threshold, 70.0);
    }
}

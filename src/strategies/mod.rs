// 信号策略模块
pub mod donchian;
pub mod rule_table;

use crate::core::config::{SignalConfig, StrategyKind};
use crate::core::types::{Candle, Signal};

pub use donchian::DonchianStrategy;
pub use rule_table::RuleTableStrategy;

/// 信号策略：给定一个已收盘K线窗口，产出一个信号
///
/// 实现必须是纯函数，同样的窗口永远得到同样的信号，
/// 因此可以在多个交易对之间共享同一个实例。
pub trait SignalStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 产生非 hold 信号所需的最少已收盘K线数量
    fn required_candles(&self) -> usize;

    fn evaluate(&self, symbol: &str, candles: &[Candle]) -> Signal;
}

/// 根据配置创建策略
pub fn build_strategy(config: &SignalConfig) -> Box<dyn SignalStrategy> {
    match config.strategy {
        StrategyKind::RuleTable => Box::new(RuleTableStrategy::new(
            config.indicators.clone(),
            config.rules.clone(),
            config.min_strength,
        )),
        StrategyKind::Donchian => Box::new(DonchianStrategy::new(
            config.donchian.clone(),
            config.indicators.reward_ratio,
            config.indicators.volatility_lookback,
        )),
    }
}

/// 入场信号的ATR止损止盈
pub(crate) fn atr_levels(
    close: f64,
    atr: f64,
    multiplier: f64,
    reward_ratio: f64,
    long: bool,
) -> (f64, f64) {
    let distance = atr * multiplier;
    if long {
        (close - distance, close + distance * reward_ratio)
    } else {
        (close + distance, close - distance * reward_ratio)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::types::{Candle, Interval};
    use chrono::{Duration, TimeZone, Utc};

    /// 由收盘价序列构造K线，振幅固定为 ±0.5%
    pub fn candles_from_closes(symbol: &str, closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut prev = closes.first().copied().unwrap_or(100.0);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = prev;
                prev = close;
                Candle {
                    symbol: symbol.to_string(),
                    interval: Interval::FifteenMinutes,
                    open_time: start + Duration::minutes(15 * i as i64),
                    open,
                    high: open.max(close) * 1.005,
                    low: open.min(close) * 0.995,
                    close,
                    volume: 1000.0,
                    closed: true,
                }
            })
            .collect()
    }
}

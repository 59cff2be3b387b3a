//! Donchian通道突破策略
//!
//! 收盘价突破前 N 根K线的最高价且前一根未突破，成交量放大，
//! 并且 SMA 快线在慢线之上时做多；做空对称。
//! 价格跌破较短通道的低点平多，升破高点平空。

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{atr_levels, SignalStrategy};
use crate::core::config::DonchianConfig;
use crate::core::types::{Candle, Interval, PositionSide, Signal, SignalAction};
use crate::utils::indicators::functions::{atr, donchian, range_volatility, sma};
use crate::utils::indicators::PriceColumns;

const NAME: &str = "donchian";

pub struct DonchianStrategy {
    config: DonchianConfig,
    reward_ratio: f64,
    volatility_lookback: usize,
}

impl DonchianStrategy {
    pub fn new(config: DonchianConfig, reward_ratio: f64, volatility_lookback: usize) -> Self {
        Self {
            config,
            reward_ratio,
            volatility_lookback,
        }
    }

    fn breakout_strength(volume_ratio: f64, momentum: f64, volatility_pct: f64) -> f64 {
        (0.5 + volume_ratio / 10.0 + momentum.max(0.0) * 10.0 + volatility_pct / 100.0).min(0.9)
    }
}

impl SignalStrategy for DonchianStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn required_candles(&self) -> usize {
        let cfg = &self.config;
        // 通道不含当前K线，前一根的通道还要再往前一根
        [
            cfg.period + 2,
            cfg.exit_period + 2,
            cfg.trend_slow,
            cfg.atr_period + 1,
            self.volatility_lookback,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    fn evaluate(&self, symbol: &str, candles: &[Candle]) -> Signal {
        let (interval, timestamp) = match candles.last() {
            Some(last) => (last.interval, last.close_time()),
            None => {
                return Signal::hold(symbol, Interval::default(), NAME, DateTime::<Utc>::MIN_UTC, "没有K线")
            }
        };

        let required = self.required_candles();
        if candles.len() < required {
            return Signal::hold(
                symbol,
                interval,
                NAME,
                timestamp,
                format!("K线不足: {}/{}", candles.len(), required),
            );
        }

        let cfg = &self.config;
        let cols = PriceColumns::from_candles(candles);
        let n = cols.closes.len();
        let close = cols.closes[n - 1];
        let prev_close = cols.closes[n - 2];

        let prior_highs = &cols.highs[..n - 1];
        let prior_lows = &cols.lows[..n - 1];
        let readings = (
            donchian(prior_highs, prior_lows, cfg.period),
            donchian(prior_highs, prior_lows, cfg.exit_period),
            atr(&cols.highs, &cols.lows, &cols.closes, cfg.atr_period),
            sma(&cols.volumes, cfg.period),
            sma(&cols.closes, cfg.trend_fast),
            sma(&cols.closes, cfg.trend_slow),
            range_volatility(candles, self.volatility_lookback),
        );
        let (channel, exit_channel, atr_value, avg_volume, trend_fast, trend_slow, volatility) =
            match readings {
                (Some(c), Some(e), Some(a), Some(v), Some(f), Some(s), Some(vol)) => {
                    (c, e, a, v, f, s, vol)
                }
                _ => return Signal::hold(symbol, interval, NAME, timestamp, "指标计算失败"),
            };

        let volume_ratio = if avg_volume > 0.0 {
            cols.volumes[n - 1] / avg_volume
        } else {
            0.0
        };
        let momentum = close / cols.closes[n - 1 - cfg.period] - 1.0;
        let trend_up = trend_fast > trend_slow;
        let atr_pct = if close > 0.0 { atr_value / close * 100.0 } else { 0.0 };

        let mut indicators = BTreeMap::new();
        indicators.insert("close".to_string(), close);
        indicators.insert("donchian_upper".to_string(), channel.upper);
        indicators.insert("donchian_lower".to_string(), channel.lower);
        indicators.insert("exit_upper".to_string(), exit_channel.upper);
        indicators.insert("exit_lower".to_string(), exit_channel.lower);
        indicators.insert("atr".to_string(), atr_value);
        indicators.insert("volume_ratio".to_string(), volume_ratio);
        indicators.insert("momentum".to_string(), momentum);
        indicators.insert("sma_fast".to_string(), trend_fast);
        indicators.insert("sma_slow".to_string(), trend_slow);
        indicators.insert(Signal::VOLATILITY_KEY.to_string(), volatility);

        let mut signal = Signal::hold(symbol, interval, NAME, timestamp, "无突破");
        signal.entry_price = close;
        signal.indicators = indicators;

        let volume_confirmed = volume_ratio > cfg.volume_threshold;
        let entry = if close > channel.upper
            && prev_close <= channel.upper
            && volume_confirmed
            && trend_up
        {
            Some((
                PositionSide::Long,
                Self::breakout_strength(volume_ratio, momentum, atr_pct),
                format!(
                    "突破上轨 {:.4}，放量 {:.2}x，上升趋势",
                    channel.upper, volume_ratio
                ),
            ))
        } else if close < channel.lower
            && prev_close >= channel.lower
            && volume_confirmed
            && !trend_up
        {
            Some((
                PositionSide::Short,
                Self::breakout_strength(volume_ratio, -momentum, atr_pct),
                format!(
                    "跌破下轨 {:.4}，放量 {:.2}x，下降趋势",
                    channel.lower, volume_ratio
                ),
            ))
        } else {
            None
        };

        if let Some((side, strength, reason)) = entry {
            let long = side == PositionSide::Long;
            let (stop_loss, take_profit) =
                atr_levels(close, atr_value, cfg.atr_multiplier, self.reward_ratio, long);
            signal.action = if long {
                SignalAction::EnterLong
            } else {
                SignalAction::EnterShort
            };
            signal.strength = strength;
            signal.stop_loss = Some(stop_loss);
            signal.take_profit = Some(take_profit);
            signal.reason = reason;
        } else if close < exit_channel.lower && prev_close >= exit_channel.lower {
            signal.action = SignalAction::Exit(Some(PositionSide::Long));
            signal.strength = 0.7;
            signal.reason = format!("跌破短周期低点 {:.4}", exit_channel.lower);
        } else if close > exit_channel.upper && prev_close <= exit_channel.upper {
            signal.action = SignalAction::Exit(Some(PositionSide::Short));
            signal.strength = 0.7;
            signal.reason = format!("升破短周期高点 {:.4}", exit_channel.upper);
        }

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::candles_from_closes;

    fn strategy() -> DonchianStrategy {
        DonchianStrategy::new(DonchianConfig::default(), 1.5, 20)
    }

    /// 缓慢上涨后最后一根放量突破
    fn breakout_window() -> Vec<Candle> {
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.1).collect();
        let last = closes[closes.len() - 1];
        closes.push(last * 1.03);
        let mut candles = candles_from_closes("BTCUSDT", &closes);
        if let Some(c) = candles.last_mut() {
            c.volume = 5000.0;
        }
        candles
    }

    #[test]
    fn test_breakout_long() {
        let candles = breakout_window();
        let signal = strategy().evaluate("BTCUSDT", &candles);
        assert_eq!(signal.action, SignalAction::EnterLong);
        assert!(signal.strength >= 0.5 && signal.strength <= 0.9);
        assert!(signal.stop_loss.unwrap() < signal.entry_price);
        assert!(signal.take_profit.unwrap() > signal.entry_price);
    }

    #[test]
    fn test_breakout_without_volume_holds() {
        let mut candles = breakout_window();
        if let Some(c) = candles.last_mut() {
            c.volume = 1000.0;
        }
        let signal = strategy().evaluate("BTCUSDT", &candles);
        assert_ne!(signal.action, SignalAction::EnterLong);
    }

    #[test]
    fn test_exit_long_on_short_channel_break() {
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.1).collect();
        let last = closes[closes.len() - 1];
        closes.push(last * 0.97);
        let candles = candles_from_closes("BTCUSDT", &closes);
        let signal = strategy().evaluate("BTCUSDT", &candles);
        assert_eq!(signal.action, SignalAction::Exit(Some(PositionSide::Long)));
    }

    #[test]
    fn test_short_window_holds() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes("BTCUSDT", &closes);
        let signal = strategy().evaluate("BTCUSDT", &candles);
        assert_eq!(signal.action, SignalAction::Hold);
    }
}

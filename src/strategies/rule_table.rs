//! 规则表策略
//!
//! 指标：RSI、MACD、布林带、EMA快慢线、ATR（止损距离）。
//! 规则表来自配置，每条规则是若干条件的合取；所有规则都会被求值，
//! 与规则在表中的顺序无关：
//! - 多空入场同时命中 => hold
//! - 只命中一个方向的入场 => 该方向入场
//! - 否则任一平仓规则命中 => exit
//! - 否则 hold
//!
//! 交叉类条件比较完整窗口与去掉最后一根K线的窗口，所以需要多一根K线。

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{atr_levels, SignalStrategy};
use crate::core::config::{ConditionConfig, ConditionKind, IndicatorConfig, RuleAction, RuleConfig};
use crate::core::types::{Candle, Interval, PositionSide, Signal, SignalAction};
use crate::utils::indicators::functions::{atr, bollinger_bands, ema, macd, range_volatility, rsi};
use crate::utils::indicators::{BollingerBands, MacdValue, PriceColumns};

const NAME: &str = "rule_table";

/// 单个窗口上的指标读数
#[derive(Debug, Clone, Copy)]
struct Readings {
    close: f64,
    rsi: f64,
    macd: MacdValue,
    bands: BollingerBands,
    ema_fast: f64,
    ema_slow: f64,
}

impl Readings {
    fn compute(closes: &[f64], cfg: &IndicatorConfig) -> Option<Self> {
        Some(Self {
            close: *closes.last()?,
            rsi: rsi(closes, cfg.rsi_period)?,
            macd: macd(closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal)?,
            bands: bollinger_bands(closes, cfg.bollinger_period, cfg.bollinger_std_dev)?,
            ema_fast: ema(closes, cfg.ema_fast)?,
            ema_slow: ema(closes, cfg.ema_slow)?,
        })
    }
}

/// 规则表策略
pub struct RuleTableStrategy {
    indicators: IndicatorConfig,
    rules: Vec<RuleConfig>,
    min_strength: f64,
}

impl RuleTableStrategy {
    pub fn new(indicators: IndicatorConfig, rules: Vec<RuleConfig>, min_strength: f64) -> Self {
        Self {
            indicators,
            rules,
            min_strength,
        }
    }

    fn condition_holds(condition: &ConditionConfig, now: &Readings, prev: &Readings) -> bool {
        use ConditionKind::*;

        let t = condition.threshold;
        match condition.kind {
            RsiBelow => now.rsi < t,
            RsiAbove => now.rsi > t,
            MacdHistogramAbove => now.macd.histogram > t,
            MacdHistogramBelow => now.macd.histogram < t,
            MacdCrossUp => prev.macd.macd <= prev.macd.signal && now.macd.macd > now.macd.signal,
            MacdCrossDown => prev.macd.macd >= prev.macd.signal && now.macd.macd < now.macd.signal,
            CloseBelowLowerBand => now.close < now.bands.lower,
            CloseAboveUpperBand => now.close > now.bands.upper,
            CloseAboveMiddleBand => now.close > now.bands.middle,
            CloseBelowMiddleBand => now.close < now.bands.middle,
            EmaFastAboveSlow => now.ema_fast > now.ema_slow,
            EmaFastBelowSlow => now.ema_fast < now.ema_slow,
            EmaCrossUp => prev.ema_fast <= prev.ema_slow && now.ema_fast > now.ema_slow,
            EmaCrossDown => prev.ema_fast >= prev.ema_slow && now.ema_fast < now.ema_slow,
        }
    }

    fn matching_rules(&self, now: &Readings, prev: &Readings) -> Vec<&RuleConfig> {
        self.rules
            .iter()
            .filter(|rule| {
                rule.all
                    .iter()
                    .all(|condition| Self::condition_holds(condition, now, prev))
            })
            .collect()
    }

    fn indicator_map(now: &Readings, atr_value: f64, volatility: f64) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("close".to_string(), now.close);
        map.insert("rsi".to_string(), now.rsi);
        map.insert("macd".to_string(), now.macd.macd);
        map.insert("macd_signal".to_string(), now.macd.signal);
        map.insert("macd_histogram".to_string(), now.macd.histogram);
        map.insert("bb_upper".to_string(), now.bands.upper);
        map.insert("bb_middle".to_string(), now.bands.middle);
        map.insert("bb_lower".to_string(), now.bands.lower);
        map.insert("ema_fast".to_string(), now.ema_fast);
        map.insert("ema_slow".to_string(), now.ema_slow);
        map.insert("atr".to_string(), atr_value);
        map.insert(Signal::VOLATILITY_KEY.to_string(), volatility);
        map
    }

    fn names(rules: &[&RuleConfig]) -> String {
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.join(",")
    }

    fn max_strength(rules: &[&RuleConfig]) -> f64 {
        rules.iter().map(|r| r.strength).fold(0.0, f64::max)
    }
}

impl SignalStrategy for RuleTableStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn required_candles(&self) -> usize {
        let cfg = &self.indicators;
        let longest = [
            cfg.rsi_period + 1,
            cfg.macd_slow + cfg.macd_signal - 1,
            cfg.bollinger_period,
            cfg.ema_slow,
            cfg.atr_period + 1,
            cfg.volatility_lookback,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        longest + 1
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

        let cols = PriceColumns::from_candles(candles);
        let cfg = &self.indicators;
        let (now, prev, atr_value, volatility) = match (
            Readings::compute(&cols.closes, cfg),
            Readings::compute(&cols.closes[..cols.closes.len() - 1], cfg),
            atr(&cols.highs, &cols.lows, &cols.closes, cfg.atr_period),
            range_volatility(candles, cfg.volatility_lookback),
        ) {
            (Some(now), Some(prev), Some(a), Some(v)) => (now, prev, a, v),
            _ => return Signal::hold(symbol, interval, NAME, timestamp, "指标计算失败"),
        };

        let mut signal = Signal::hold(symbol, interval, NAME, timestamp, "无规则命中");
        signal.entry_price = now.close;
        signal.indicators = Self::indicator_map(&now, atr_value, volatility);

        let matched = self.matching_rules(&now, &prev);
        let longs: Vec<&RuleConfig> = matched
            .iter()
            .copied()
            .filter(|r| r.action == RuleAction::EnterLong)
            .collect();
        let shorts: Vec<&RuleConfig> = matched
            .iter()
            .copied()
            .filter(|r| r.action == RuleAction::EnterShort)
            .collect();
        let exits: Vec<&RuleConfig> = matched
            .iter()
            .copied()
            .filter(|r| r.action == RuleAction::Exit)
            .collect();

        if !longs.is_empty() && !shorts.is_empty() {
            signal.reason = format!(
                "多空规则冲突: 多[{}] 空[{}]",
                Self::names(&longs),
                Self::names(&shorts)
            );
            return signal;
        }

        let entry = if !longs.is_empty() {
            Some((PositionSide::Long, longs))
        } else if !shorts.is_empty() {
            Some((PositionSide::Short, shorts))
        } else {
            None
        };

        if let Some((side, rules)) = entry {
            let strength = Self::max_strength(&rules);
            if strength < self.min_strength {
                signal.reason = format!(
                    "{} 强度 {:.2} 低于阈值 {:.2}",
                    Self::names(&rules),
                    strength,
                    self.min_strength
                );
                return signal;
            }
            let long = side == PositionSide::Long;
            let (stop_loss, take_profit) = atr_levels(
                now.close,
                atr_value,
                cfg.atr_stop_multiplier,
                cfg.reward_ratio,
                long,
            );
            signal.action = if long {
                SignalAction::EnterLong
            } else {
                SignalAction::EnterShort
            };
            signal.strength = strength;
            signal.stop_loss = Some(stop_loss);
            signal.take_profit = Some(take_profit);
            signal.reason = format!("命中规则 [{}]", Self::names(&rules));
            return signal;
        }

        if !exits.is_empty() {
            let first = exits[0].closes;
            let scope = if exits.iter().all(|r| r.closes == first) {
                first
            } else {
                None
            };
            signal.action = SignalAction::Exit(scope);
            signal.strength = Self::max_strength(&exits);
            signal.reason = format!("命中平仓规则 [{}]", Self::names(&exits));
        }

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::default_rules;
    use crate::strategies::test_support::candles_from_closes;

    fn uptrend(n: usize) -> Vec<Candle> {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 * 1.01f64.powi(i as i32)).collect();
        candles_from_closes("BTCUSDT", &closes)
    }

    fn rule(name: &str, action: RuleAction, all: Vec<ConditionConfig>) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            action,
            closes: None,
            all,
            strength: 0.6,
        }
    }

    fn trend_long() -> RuleConfig {
        rule(
            "trend_long",
            RuleAction::EnterLong,
            vec![
                ConditionConfig::flag(ConditionKind::EmaFastAboveSlow),
                ConditionConfig::new(ConditionKind::RsiAbove, 50.0),
            ],
        )
    }

    #[test]
    fn test_short_window_holds() {
        let strategy = RuleTableStrategy::new(IndicatorConfig::default(), default_rules(), 0.0);
        assert_eq!(strategy.required_candles(), 35);

        let candles = uptrend(34);
        let signal = strategy.evaluate("BTCUSDT", &candles);
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.indicators.is_empty());
    }

    #[test]
    fn test_entry_with_atr_levels() {
        let strategy =
            RuleTableStrategy::new(IndicatorConfig::default(), vec![trend_long()], 0.0);
        let candles = uptrend(60);
        let signal = strategy.evaluate("BTCUSDT", &candles);

        assert_eq!(signal.action, SignalAction::EnterLong);
        let close = candles.last().unwrap().close;
        assert_eq!(signal.entry_price, close);
        assert!(signal.stop_loss.unwrap() < close);
        assert!(signal.take_profit.unwrap() > close);
        assert!(signal.volatility_pct().unwrap() > 0.0);
        assert_eq!(signal.timestamp, candles.last().unwrap().close_time());
    }

    #[test]
    fn test_conflicting_entries_hold() {
        let short = rule(
            "trend_short",
            RuleAction::EnterShort,
            vec![
                ConditionConfig::flag(ConditionKind::EmaFastAboveSlow),
                ConditionConfig::new(ConditionKind::RsiAbove, 0.0),
            ],
        );
        let strategy =
            RuleTableStrategy::new(IndicatorConfig::default(), vec![trend_long(), short], 0.0);
        let signal = strategy.evaluate("BTCUSDT", &uptrend(60));
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.reason.contains("冲突"));
    }

    #[test]
    fn test_exit_scoped_and_order_independent() {
        let mut exit_long = rule(
            "exit_long",
            RuleAction::Exit,
            vec![
                ConditionConfig::new(ConditionKind::RsiAbove, 0.0),
                ConditionConfig::flag(ConditionKind::CloseAboveMiddleBand),
            ],
        );
        exit_long.closes = Some(PositionSide::Long);
        let never = rule(
            "never_short",
            RuleAction::EnterShort,
            vec![ConditionConfig::flag(ConditionKind::EmaFastBelowSlow)],
        );

        let a = RuleTableStrategy::new(
            IndicatorConfig::default(),
            vec![exit_long.clone(), never.clone()],
            0.0,
        );
        let b = RuleTableStrategy::new(IndicatorConfig::default(), vec![never, exit_long], 0.0);
        let candles = uptrend(60);

        let sa = a.evaluate("BTCUSDT", &candles);
        let sb = b.evaluate("BTCUSDT", &candles);
        assert_eq!(sa.action, SignalAction::Exit(Some(PositionSide::Long)));
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_deterministic_on_identical_windows() {
        let strategy = RuleTableStrategy::new(IndicatorConfig::default(), default_rules(), 0.0);
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let candles = candles_from_closes("ETHUSDT", &closes);
        let first = strategy.evaluate("ETHUSDT", &candles);
        let second = strategy.evaluate("ETHUSDT", &candles.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn test_min_strength_filters_entry() {
        let strategy =
            RuleTableStrategy::new(IndicatorConfig::default(), vec![trend_long()], 0.9);
        let signal = strategy.evaluate("BTCUSDT", &uptrend(60));
        assert_eq!(signal.action, SignalAction::Hold);
    }
}

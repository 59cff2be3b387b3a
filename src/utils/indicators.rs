use crate::core::types::Candle;
/// 统一的技术指标模块
/// 纯函数实现，同样的输入永远得到同样的输出
use serde::{Deserialize, Serialize};

/// MACD指标值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// 布林带
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Donchian通道
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DonchianChannel {
    pub upper: f64,
    pub lower: f64,
}

/// 静态技术指标计算函数（无状态）
pub mod functions {
    use super::*;

    /// 计算简单移动平均线 (SMA)
    pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
        if prices.len() < period || period == 0 {
            return None;
        }

        let sum: f64 = prices[prices.len() - period..].iter().sum();
        Some(sum / period as f64)
    }

    /// EMA序列，以前 period 个值的SMA作为种子
    ///
    /// 返回值第 0 项对应 prices[period - 1]。
    pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
        if prices.len() < period || period == 0 {
            return Vec::new();
        }

        let multiplier = 2.0 / (period as f64 + 1.0);
        let seed = prices[..period].iter().sum::<f64>() / period as f64;

        let mut series = Vec::with_capacity(prices.len() - period + 1);
        series.push(seed);
        let mut ema = seed;
        for price in &prices[period..] {
            ema = (price - ema) * multiplier + ema;
            series.push(ema);
        }
        series
    }

    /// 计算指数移动平均线 (EMA)
    pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
        ema_series(prices, period).last().copied()
    }

    /// 计算相对强弱指数 (RSI)，Wilder平滑
    pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
        if prices.len() < period + 1 || period == 0 {
            return None;
        }

        let mut avg_gain = 0.0;
        let mut avg_loss = 0.0;
        for i in 1..=period {
            let change = prices[i] - prices[i - 1];
            if change > 0.0 {
                avg_gain += change;
            } else {
                avg_loss -= change;
            }
        }
        avg_gain /= period as f64;
        avg_loss /= period as f64;

        let p = period as f64;
        for i in period + 1..prices.len() {
            let change = prices[i] - prices[i - 1];
            let (gain, loss) = if change > 0.0 {
                (change, 0.0)
            } else {
                (0.0, -change)
            };
            avg_gain = (avg_gain * (p - 1.0) + gain) / p;
            avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        }

        if avg_loss == 0.0 {
            // 完全没有波动时视为中性
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }

        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }

    /// 计算MACD指标，信号线为MACD序列的EMA
    pub fn macd(
        prices: &[f64],
        fast: usize,
        slow: usize,
        signal_period: usize,
    ) -> Option<MacdValue> {
        if fast == 0 || fast >= slow || signal_period == 0 {
            return None;
        }
        if prices.len() < slow + signal_period - 1 {
            return None;
        }

        let fast_series = ema_series(prices, fast);
        let slow_series = ema_series(prices, slow);

        // 两条序列都从 slow - 1 开始对齐
        let offset = slow - fast;
        let macd_series: Vec<f64> = slow_series
            .iter()
            .enumerate()
            .map(|(i, slow_ema)| fast_series[i + offset] - slow_ema)
            .collect();

        let signal = ema(&macd_series, signal_period)?;
        let macd = *macd_series.last()?;

        Some(MacdValue {
            macd,
            signal,
            histogram: macd - signal,
        })
    }

    /// 计算布林带（总体标准差）
    pub fn bollinger_bands(prices: &[f64], period: usize, std_dev: f64) -> Option<BollingerBands> {
        let middle = sma(prices, period)?;

        let variance: f64 = prices[prices.len() - period..]
            .iter()
            .map(|p| (p - middle).powi(2))
            .sum::<f64>()
            / period as f64;

        let std = variance.sqrt();
        Some(BollingerBands {
            upper: middle + std_dev * std,
            middle,
            lower: middle - std_dev * std,
        })
    }

    /// 计算平均真实范围 (ATR)，Wilder平滑
    pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
        let len = closes.len();
        if period == 0 || highs.len() != len || lows.len() != len || len < period + 1 {
            return None;
        }

        let true_ranges: Vec<f64> = (1..len)
            .map(|i| {
                let high_low = highs[i] - lows[i];
                let high_close = (highs[i] - closes[i - 1]).abs();
                let low_close = (lows[i] - closes[i - 1]).abs();
                high_low.max(high_close).max(low_close)
            })
            .collect();

        let p = period as f64;
        let mut atr = true_ranges[..period].iter().sum::<f64>() / p;
        for tr in &true_ranges[period..] {
            atr = (atr * (p - 1.0) + tr) / p;
        }
        Some(atr)
    }

    /// 最近 period 根的最高价 / 最低价
    pub fn donchian(highs: &[f64], lows: &[f64], period: usize) -> Option<DonchianChannel> {
        if period == 0 || highs.len() < period || lows.len() < period {
            return None;
        }

        let upper = highs[highs.len() - period..]
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        let lower = lows[lows.len() - period..]
            .iter()
            .copied()
            .fold(f64::MAX, f64::min);
        Some(DonchianChannel { upper, lower })
    }

    /// 平均振幅(%)：mean((high - low) / close * 100)
    pub fn range_volatility(candles: &[Candle], lookback: usize) -> Option<f64> {
        if lookback == 0 || candles.len() < lookback {
            return None;
        }

        let recent = &candles[candles.len() - lookback..];
        let total: f64 = recent.iter().map(|c| c.range_pct()).sum();
        Some(total / lookback as f64)
    }
}

/// K线窗口的列式视图
pub struct PriceColumns {
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl PriceColumns {
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut columns = Self {
            opens: Vec::with_capacity(candles.len()),
            highs: Vec::with_capacity(candles.len()),
            lows: Vec::with_capacity(candles.len()),
            closes: Vec::with_capacity(candles.len()),
            volumes: Vec::with_capacity(candles.len()),
        };
        for candle in candles {
            columns.opens.push(candle.open);
            columns.highs.push(candle.high);
            columns.lows.push(candle.low);
            columns.closes.push(candle.close);
            columns.volumes.push(candle.volume);
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::functions::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_sma_and_seeded_ema() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&prices, 3), Some(4.0));
        assert_eq!(sma(&prices, 6), None);

        // 种子 = (1+2+3)/3 = 2, 之后 alpha = 0.5
        let series = ema_series(&prices, 3);
        assert_eq!(series, vec![2.0, 3.0, 4.0]);
        assert_eq!(ema(&prices, 3), Some(4.0));
    }

    #[test]
    fn test_rsi_edges() {
        let rising: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let flat = vec![10.0; 20];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(approx(rsi(&falling, 14).unwrap(), 0.0));

        assert_eq!(rsi(&rising[..14], 14), None);
    }

    #[test]
    fn test_macd_on_linear_trend() {
        // 线性序列上SMA种子的EMA滞后恒定为 (p-1)/2
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let value = macd(&prices, 12, 26, 9).unwrap();
        assert!(approx(value.macd, 7.0));
        assert!(approx(value.signal, 7.0));
        assert!(approx(value.histogram, 0.0));

        assert!(macd(&prices[..33], 12, 26, 9).is_none());
        assert!(macd(&prices[..34], 12, 26, 9).is_some());
    }

    #[test]
    fn test_bollinger_population_std() {
        let prices = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bands = bollinger_bands(&prices, 8, 2.0).unwrap();
        assert!(approx(bands.middle, 5.0));
        assert!(approx(bands.upper, 9.0));
        assert!(approx(bands.lower, 1.0));
    }

    #[test]
    fn test_atr_constant_range() {
        let highs = vec![11.0; 20];
        let lows = vec![9.0; 20];
        let closes = vec![10.0; 20];
        assert!(approx(atr(&highs, &lows, &closes, 14).unwrap(), 2.0));
        assert!(atr(&highs[..14], &lows[..14], &closes[..14], 14).is_none());
    }

    #[test]
    fn test_donchian_channel() {
        let highs = [5.0, 9.0, 7.0, 6.0];
        let lows = [1.0, 3.0, 2.0, 4.0];
        let channel = donchian(&highs, &lows, 3).unwrap();
        assert_eq!(channel.upper, 9.0);
        assert_eq!(channel.lower, 2.0);
    }
}

//! 熔断器
//! 连续亏损、滚动回撤、波动率三个独立熔断，任意一个触发即暂停所有新开仓

use crate::core::config::CircuitBreakerConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// 熔断类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    ConsecutiveLosses,
    Drawdown,
    Volatility,
}

impl fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BreakerKind::ConsecutiveLosses => write!(f, "consecutive_losses"),
            BreakerKind::Drawdown => write!(f, "drawdown"),
            BreakerKind::Volatility => write!(f, "volatility"),
        }
    }
}

/// 熔断状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripState {
    pub kind: BreakerKind,
    pub detail: String,
    pub tripped_at: DateTime<Utc>,
}

/// 熔断器组合，由 RiskState 持有，调用方负责串行化
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    starting_equity: f64,
    consecutive_losses: u32,
    /// 滚动窗口内的已实现盈亏
    realized: VecDeque<(DateTime<Utc>, f64)>,
    /// 每个交易对最近一次的振幅读数
    volatility: HashMap<String, f64>,
    tripped: Option<TripState>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig, starting_equity: f64) -> Self {
        Self {
            config,
            starting_equity,
            consecutive_losses: 0,
            realized: VecDeque::new(),
            volatility: HashMap::new(),
            tripped: None,
        }
    }

    pub fn tripped(&self) -> Option<&TripState> {
        self.tripped.as_ref()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// 窗口内净已实现盈亏
    pub fn window_pnl(&self) -> f64 {
        self.realized.iter().map(|(_, pnl)| pnl).sum()
    }

    /// 冷却期结束则自动解除，返回 true 表示本次调用解除了熔断
    pub fn expire_cooldown(&mut self, now: DateTime<Utc>) -> bool {
        let expired = match &self.tripped {
            Some(trip) => now - trip.tripped_at >= Duration::seconds(self.config.cooldown_secs),
            None => false,
        };
        if expired {
            self.reset();
        }
        expired
    }

    /// 清空所有计数并解除熔断
    pub fn reset(&mut self) {
        self.tripped = None;
        self.consecutive_losses = 0;
        self.realized.clear();
        self.volatility.clear();
    }

    /// 记录一笔平仓结果；返回新触发的熔断
    pub fn record_trade(&mut self, pnl: f64, now: DateTime<Utc>) -> Option<TripState> {
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else if pnl > 0.0 {
            self.consecutive_losses = 0;
        }

        self.realized.push_back((now, pnl));
        self.prune(now);

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            let detail = format!("连续亏损 {} 笔", self.consecutive_losses);
            return self.trip(BreakerKind::ConsecutiveLosses, detail, now);
        }

        let limit = self.config.max_drawdown_pct * self.starting_equity;
        let net_loss = -self.window_pnl();
        if net_loss > limit {
            let detail = format!("滚动窗口已实现亏损 {:.2} 超过上限 {:.2}", net_loss, limit);
            return self.trip(BreakerKind::Drawdown, detail, now);
        }

        None
    }

    /// 记录交易对的振幅读数；返回新触发的熔断
    pub fn record_volatility(
        &mut self,
        symbol: &str,
        range_pct: f64,
        now: DateTime<Utc>,
    ) -> Option<TripState> {
        if !range_pct.is_finite() {
            return None;
        }
        self.volatility.insert(symbol.to_string(), range_pct);

        let threshold = self.config.volatility_threshold_pct;
        if range_pct > threshold {
            let detail = format!("{} 平均振幅 {:.2}% 超过阈值 {:.2}%", symbol, range_pct, threshold);
            return self.trip(BreakerKind::Volatility, detail, now);
        }

        let portfolio = self.portfolio_volatility();
        if portfolio > threshold {
            let detail = format!("组合平均振幅 {:.2}% 超过阈值 {:.2}%", portfolio, threshold);
            return self.trip(BreakerKind::Volatility, detail, now);
        }
        None
    }

    pub fn portfolio_volatility(&self) -> f64 {
        if self.volatility.is_empty() {
            return 0.0;
        }
        self.volatility.values().sum::<f64>() / self.volatility.len() as f64
    }

    /// 交易对移出池子后不再参与组合波动率
    pub fn forget_symbol(&mut self, symbol: &str) {
        self.volatility.remove(symbol);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = Duration::seconds(self.config.drawdown_window_secs);
        while let Some((at, _)) = self.realized.front() {
            if now - *at > window {
                self.realized.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self, kind: BreakerKind, detail: String, now: DateTime<Utc>) -> Option<TripState> {
        // 已经熔断时不重复触发，也不刷新冷却起点
        if self.tripped.is_some() {
            return None;
        }
        let trip = TripState {
            kind,
            detail,
            tripped_at: now,
        };
        self.tripped = Some(trip.clone());
        Some(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(
            CircuitBreakerConfig {
                max_consecutive_losses: 3,
                max_drawdown_pct: 0.10,
                drawdown_window_secs: 3600,
                volatility_threshold_pct: 5.0,
                cooldown_secs: 600,
            },
            1000.0,
        )
    }

    #[test]
    fn test_trips_after_consecutive_losses() {
        let mut b = breakers();
        let now = Utc::now();
        assert!(b.record_trade(-1.0, now).is_none());
        assert!(b.record_trade(-1.0, now).is_none());
        let trip = b.record_trade(-1.0, now).unwrap();
        assert_eq!(trip.kind, BreakerKind::ConsecutiveLosses);
        assert!(b.tripped().is_some());
    }

    #[test]
    fn test_win_resets_loss_streak_breakeven_does_not() {
        let mut b = breakers();
        let now = Utc::now();
        b.record_trade(-1.0, now);
        b.record_trade(-1.0, now);
        b.record_trade(0.0, now);
        assert_eq!(b.consecutive_losses(), 2);
        b.record_trade(2.0, now);
        assert_eq!(b.consecutive_losses(), 0);
    }

    #[test]
    fn test_drawdown_window_rolls_off() {
        let mut b = breakers();
        let start = Utc::now();
        b.record_trade(-60.0, start);
        b.record_trade(5.0, start);
        // 窗口外的亏损不再计入
        assert!(b
            .record_trade(-50.0, start + Duration::seconds(3700))
            .is_none());
        assert_eq!(b.window_pnl(), -50.0);

        let trip = b
            .record_trade(-60.0, start + Duration::seconds(3800))
            .unwrap();
        assert_eq!(trip.kind, BreakerKind::Drawdown);
    }

    #[test]
    fn test_volatility_and_cooldown() {
        let mut b = breakers();
        let now = Utc::now();
        assert!(b.record_volatility("BTCUSDT", 2.0, now).is_none());
        let trip = b.record_volatility("ETHUSDT", 6.0, now).unwrap();
        assert_eq!(trip.kind, BreakerKind::Volatility);

        assert!(!b.expire_cooldown(now + Duration::seconds(599)));
        assert!(b.expire_cooldown(now + Duration::seconds(600)));
        assert!(b.tripped().is_none());
        assert_eq!(b.portfolio_volatility(), 0.0);
    }
}

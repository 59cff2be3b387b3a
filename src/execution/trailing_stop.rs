//! 追踪止损
//! 浮盈达到初始风险的 activation_r 倍后启用，之后只收紧不放松

use crate::core::config::TrailingStopConfig;
use crate::core::types::PositionSide;

#[derive(Debug, Clone)]
pub struct TrailingStop {
    side: PositionSide,
    entry_price: f64,
    initial_risk: f64,
    distance_pct: f64,
    activation_r: f64,
    stop: f64,
    /// 持仓以来最有利的价格
    best_price: f64,
    active: bool,
}

impl TrailingStop {
    pub fn new(config: &TrailingStopConfig, side: PositionSide, entry_price: f64, stop: f64) -> Self {
        Self {
            side,
            entry_price,
            initial_risk: (entry_price - stop).abs(),
            distance_pct: config.distance_pct,
            activation_r: config.activation_r,
            stop,
            best_price: entry_price,
            active: false,
        }
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// 浮盈R倍数
    fn profit_r(&self, price: f64) -> f64 {
        if self.initial_risk <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) * self.side.sign() / self.initial_risk
    }

    pub fn is_tighter(&self, candidate: f64) -> bool {
        match self.side {
            PositionSide::Long => candidate > self.stop,
            PositionSide::Short => candidate < self.stop,
        }
    }

    /// 根据新价格计算候选止损；只有比当前止损更紧时返回
    ///
    /// 返回的值要在交易所确认新止损单后再 `commit`。
    pub fn propose(&mut self, price: f64) -> Option<f64> {
        let better = match self.side {
            PositionSide::Long => price > self.best_price,
            PositionSide::Short => price < self.best_price,
        };
        if better {
            self.best_price = price;
        }

        if !self.active {
            if self.profit_r(self.best_price) < self.activation_r {
                return None;
            }
            self.active = true;
        }

        let candidate = match self.side {
            PositionSide::Long => self.best_price * (1.0 - self.distance_pct),
            PositionSide::Short => self.best_price * (1.0 + self.distance_pct),
        };
        self.is_tighter(candidate).then_some(candidate)
    }

    /// 采用新止损；放松方向的值被忽略
    pub fn commit(&mut self, stop: f64) -> bool {
        if self.is_tighter(stop) {
            self.stop = stop;
            true
        } else {
            false
        }
    }

    /// 价格是否已经越过止损
    pub fn is_crossed(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop,
            PositionSide::Short => price >= self.stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrailingStopConfig {
        TrailingStopConfig {
            enabled: true,
            distance_pct: 0.01,
            activation_r: 1.0,
            use_live_candle: false,
        }
    }

    #[test]
    fn test_inactive_until_activation() {
        let mut trail = TrailingStop::new(&config(), PositionSide::Long, 100.0, 98.0);
        assert_eq!(trail.propose(101.5), None);
        assert!(!trail.is_active());
        let candidate = trail.propose(102.5).unwrap();
        assert!(trail.is_active());
        assert!((candidate - 101.475).abs() < 1e-9);
    }

    #[test]
    fn test_long_stop_never_loosens() {
        let mut trail = TrailingStop::new(&config(), PositionSide::Long, 100.0, 98.0);
        let prices = [101.0, 103.0, 102.0, 105.0, 99.0, 104.0, 110.0, 100.0];
        let mut last = trail.stop();
        for price in prices {
            if let Some(candidate) = trail.propose(price) {
                assert!(trail.commit(candidate));
            }
            assert!(trail.stop() >= last);
            last = trail.stop();
        }
        assert!((trail.stop() - 108.9).abs() < 1e-9);
        assert!(!trail.commit(90.0));
        assert!(trail.is_crossed(108.0));
    }

    #[test]
    fn test_short_stop_never_loosens() {
        let mut trail = TrailingStop::new(&config(), PositionSide::Short, 100.0, 102.0);
        let mut last = trail.stop();
        for price in [99.0, 97.0, 98.5, 95.0, 101.0, 96.0] {
            if let Some(candidate) = trail.propose(price) {
                trail.commit(candidate);
            }
            assert!(trail.stop() <= last);
            last = trail.stop();
        }
        assert!((trail.stop() - 95.95).abs() < 1e-9);
        assert!(!trail.is_crossed(95.0));
        assert!(trail.is_crossed(96.0));
    }
}

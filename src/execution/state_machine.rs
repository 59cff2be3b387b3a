//! 订单生命周期状态机
//!
//! pending -> placed -> open -> closing -> closed
//! failed 可以从 pending / placed 进入，或在任何非终止状态遇到不可恢复错误时进入。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::core::error::TradingError;
use crate::core::types::{ExitReason, PositionIntent, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Pending,
    Placed,
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Failed)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PositionState::Pending => "pending",
            PositionState::Placed => "placed",
            PositionState::Open => "open",
            PositionState::Closing => "closing",
            PositionState::Closed => "closed",
            PositionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 驱动状态转换的事件
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    EntrySubmitted { order_id: String },
    /// 重试用尽或被交易所拒绝
    SubmitFailed { reason: String },
    EntryFilled { quantity: f64, average_price: f64 },
    EntryTimedOut,
    /// 关闭进程时撤掉未成交的入场单
    EntryCancelled,
    ExitTriggered(ExitReason),
    Flat { exit_price: f64 },
    Unrecoverable { reason: String },
}

/// 纯转换函数，非法转换返回错误且不改变状态
pub fn transition(state: PositionState, event: &PositionEvent) -> Result<PositionState, TradingError> {
    use PositionEvent::*;
    use PositionState::*;

    let next = match (state, event) {
        (Pending, EntrySubmitted { .. }) => Placed,
        (Pending, SubmitFailed { .. }) | (Placed, SubmitFailed { .. }) => Failed,
        (Pending, EntryCancelled) | (Placed, EntryCancelled) => Failed,
        (Placed, EntryFilled { .. }) => Open,
        (Placed, EntryTimedOut) => Failed,
        (Open, ExitTriggered(_)) => Closing,
        (Closing, Flat { .. }) => Closed,
        (s, Unrecoverable { .. }) if !s.is_terminal() => Failed,
        (s, e) => {
            return Err(TradingError::validation(
                "position_state",
                format!("非法状态转换: {} 收到 {:?}", s, e),
            ))
        }
    };
    Ok(next)
}

/// 一个仓位的完整记录，归状态机独占，终止后只读归档
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub intent: PositionIntent,
    pub state: PositionState,
    pub entry_order_id: Option<String>,
    pub filled_quantity: f64,
    pub average_entry_price: f64,
    pub stop_loss: f64,
    pub stop_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: f64,
    pub failure: Option<String>,
    pub history: Vec<(PositionState, DateTime<Utc>)>,
}

impl Position {
    pub fn new(intent: PositionIntent, now: DateTime<Utc>) -> Self {
        let stop_loss = intent.stop_loss;
        Self {
            intent,
            state: PositionState::Pending,
            entry_order_id: None,
            filled_quantity: 0.0,
            average_entry_price: 0.0,
            stop_loss,
            stop_order_id: None,
            take_profit_order_id: None,
            opened_at: None,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: 0.0,
            failure: None,
            history: vec![(PositionState::Pending, now)],
        }
    }

    pub fn symbol(&self) -> &str {
        &self.intent.symbol
    }

    pub fn side(&self) -> PositionSide {
        self.intent.side
    }

    /// 应用事件并记录附带数据
    pub fn apply(&mut self, event: PositionEvent, now: DateTime<Utc>) -> Result<PositionState, TradingError> {
        let next = transition(self.state, &event)?;

        match event {
            PositionEvent::EntrySubmitted { order_id } => self.entry_order_id = Some(order_id),
            PositionEvent::EntryFilled {
                quantity,
                average_price,
            } => {
                self.filled_quantity = quantity;
                self.average_entry_price = average_price;
                self.opened_at = Some(now);
            }
            PositionEvent::ExitTriggered(reason) => self.exit_reason = Some(reason),
            PositionEvent::Flat { exit_price } => {
                self.exit_price = Some(exit_price);
                self.realized_pnl = (exit_price - self.average_entry_price)
                    * self.filled_quantity
                    * self.side().sign();
                self.closed_at = Some(now);
            }
            PositionEvent::SubmitFailed { reason } | PositionEvent::Unrecoverable { reason } => {
                self.failure = Some(reason);
                self.closed_at = Some(now);
            }
            PositionEvent::EntryTimedOut => {
                self.failure = Some("入场单超时未成交".to_string());
                self.closed_at = Some(now);
            }
            PositionEvent::EntryCancelled => {
                self.failure = Some("入场单已撤销".to_string());
                self.closed_at = Some(now);
            }
        }

        log::debug!("🔁 {} {} -> {}", self.symbol(), self.state, next);
        self.state = next;
        self.history.push((next, now));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> PositionIntent {
        PositionIntent {
            intent_id: "I1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: 5.0,
            leverage: 5,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: Some(103.0),
            reduce_only: false,
            post_only: false,
            reserved_margin: 100.0,
            estimated_liquidation_price: 80.5,
            strategy: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_happy_path_and_pnl() {
        let now = Utc::now();
        let mut position = Position::new(intent(), now);
        position
            .apply(PositionEvent::EntrySubmitted { order_id: "1".into() }, now)
            .unwrap();
        position
            .apply(
                PositionEvent::EntryFilled {
                    quantity: 5.0,
                    average_price: 100.0,
                },
                now,
            )
            .unwrap();
        position
            .apply(PositionEvent::ExitTriggered(ExitReason::TakeProfit), now)
            .unwrap();
        let state = position
            .apply(PositionEvent::Flat { exit_price: 103.0 }, now)
            .unwrap();

        assert_eq!(state, PositionState::Closed);
        assert!((position.realized_pnl - 15.0).abs() < 1e-9);
        let states: Vec<PositionState> = position.history.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                PositionState::Pending,
                PositionState::Placed,
                PositionState::Open,
                PositionState::Closing,
                PositionState::Closed
            ]
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use PositionState::*;
        assert!(transition(Pending, &PositionEvent::Flat { exit_price: 1.0 }).is_err());
        assert!(transition(Open, &PositionEvent::EntryTimedOut).is_err());
        assert!(transition(Closed, &PositionEvent::Unrecoverable { reason: "x".into() }).is_err());
        assert!(transition(Failed, &PositionEvent::ExitTriggered(ExitReason::Manual)).is_err());
        // open 不能直接跳到 closed
        assert!(transition(Open, &PositionEvent::Flat { exit_price: 1.0 }).is_err());
    }

    #[test]
    fn test_failed_reachable_from_pending_and_placed() {
        use PositionState::*;
        let failed = PositionEvent::SubmitFailed { reason: "rejected".into() };
        assert_eq!(transition(Pending, &failed).unwrap(), Failed);
        assert_eq!(transition(Placed, &PositionEvent::EntryTimedOut).unwrap(), Failed);
        assert_eq!(
            transition(Open, &PositionEvent::Unrecoverable { reason: "auth".into() }).unwrap(),
            Failed
        );
    }
}

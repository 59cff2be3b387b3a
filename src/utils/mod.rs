// 工具模块 - 通用工具函数
pub mod indicators;
pub mod logging;
pub mod order_id;
pub mod trade_logger;
pub mod webhook;

pub use order_id::{OrderIdGenerator, OrderPurpose};
pub use trade_logger::{TradeFilter, TradeLogger, TradeRecord, TradeStatistics};
pub use webhook::{AlertBus, AlertEvent, MessageLevel};

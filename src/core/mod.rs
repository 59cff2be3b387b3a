// 核心模块 - 只包含核心业务逻辑
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod retry_policy;
pub mod risk_manager;
pub mod types;
pub mod universe;
pub mod websocket;

pub use config::*;
pub use error::*;
pub use exchange::*;
pub use types::{
    Candle, ExitReason, Instrument, Interval, LiquidityTier, OrderAck, OrderRequest, OrderSide,
    OrderStatus, OrderType, PositionIntent, PositionSide, PositionSnapshot, Signal, SignalAction,
};
pub use websocket::ConnectionState;

// 模拟盘网关与行情来源
pub mod binance;
pub mod paper;
pub mod synthetic;

use crate::core::exchange::CandleStream;
use crate::core::types::{Instrument, Interval, Result};
use async_trait::async_trait;

/// 行情来源：交易对列表 + K线推送
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_instruments(&self) -> Result<Vec<Instrument>>;

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<CandleStream>;
}

// 导出实现
pub use binance::BinancePublicFeed;
pub use paper::PaperExchange;
pub use synthetic::SyntheticMarket;

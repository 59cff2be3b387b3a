use crate::core::types::{
    Candle, Instrument, Interval, OrderAck, OrderRequest, PositionSnapshot, Result,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// K线推送流；流结束或返回 Err 都表示连接断开
pub type CandleStream = BoxStream<'static, Result<Candle>>;

/// 交易所网关trait
///
/// 流水线只依赖这一个接口，模拟盘和实盘实现可以互换。
/// 所有方法都可能因网络问题失败，调用方负责按错误类型重试。
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// 获取交易所名称
    fn name(&self) -> &str;

    /// 获取所有合约交易对及其交易约束、24小时统计
    async fn list_instruments(&self) -> Result<Vec<Instrument>>;

    /// 订阅单个交易对的K线推送
    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<CandleStream>;

    /// 下单；相同 client_order_id 重复提交必须返回同一笔订单
    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck>;

    /// 取消订单
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// 获取持仓
    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot>;
}

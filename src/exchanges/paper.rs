//! 模拟盘网关
//! 订单在内存中撮合，价格来自行情来源推送的K线

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::MarketDataSource;
use crate::core::error::TradingError;
use crate::core::exchange::{CandleStream, ExchangeGateway};
use crate::core::types::{
    Candle, Instrument, Interval, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType,
    PositionSide, PositionSnapshot, Result,
};

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    side: Option<PositionSide>,
    size: f64,
    entry_price: f64,
    realized_pnl: f64,
    last_exit_price: Option<f64>,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: String,
    request: OrderRequest,
}

/// 故障注入
#[derive(Debug, Default)]
struct Faults {
    /// 接下来这些类型的订单被交易所拒绝
    reject: HashMap<OrderType, u32>,
    /// 订单已成交但回执丢失，调用方收到网络错误
    drop_acks: u32,
}

#[derive(Debug, Default)]
struct Book {
    marks: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    resting: Vec<RestingOrder>,
    acks: HashMap<String, OrderAck>,
    submitted: Vec<OrderRequest>,
    faults: Faults,
}

/// 模拟盘网关
pub struct PaperExchange {
    source: Arc<dyn MarketDataSource>,
    book: Arc<Mutex<Book>>,
    order_seq: AtomicU64,
}

impl PaperExchange {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            book: Arc::new(Mutex::new(Book::default())),
            order_seq: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|_| TradingError::TransientNetwork("模拟盘状态锁中毒".to_string()))
    }

    /// 直接设置标记价格
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        if let Ok(mut book) = self.book.lock() {
            book.marks.insert(symbol.to_string(), price);
        }
    }

    /// 用一根K线驱动撮合（订阅流里的每根K线都会经过这里）
    pub fn on_candle(&self, candle: &Candle) {
        if let Ok(mut book) = self.book.lock() {
            process_candle(&mut book, candle);
        }
    }

    /// 接下来 n 个该类型的订单被拒
    pub fn reject_next(&self, order_type: OrderType, n: u32) {
        if let Ok(mut book) = self.book.lock() {
            book.faults.reject.insert(order_type, n);
        }
    }

    /// 接下来 n 个订单成交但回执丢失
    pub fn drop_next_acks(&self, n: u32) {
        if let Ok(mut book) = self.book.lock() {
            book.faults.drop_acks = n;
        }
    }

    /// 所有提交过的订单（含重复提交）
    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.book
            .lock()
            .map(|book| book.submitted.clone())
            .unwrap_or_default()
    }

    /// 当前挂单
    pub fn open_orders(&self, symbol: &str) -> Vec<OrderRequest> {
        self.book
            .lock()
            .map(|book| {
                book.resting
                    .iter()
                    .filter(|o| o.request.symbol == symbol)
                    .map(|o| o.request.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn realized_pnl(&self, symbol: &str) -> f64 {
        self.book
            .lock()
            .ok()
            .and_then(|book| book.positions.get(symbol).map(|p| p.realized_pnl))
            .unwrap_or(0.0)
    }

    fn next_order_id(&self) -> String {
        format!("P{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }
}

/// 成交并更新持仓；返回实际成交数量
fn fill(book: &mut Book, symbol: &str, side: OrderSide, quantity: f64, price: f64, reduce_only: bool) -> f64 {
    let position = book.positions.entry(symbol.to_string()).or_default();
    let incoming = match side {
        OrderSide::Buy => PositionSide::Long,
        OrderSide::Sell => PositionSide::Short,
    };

    match position.side {
        Some(current) if current != incoming => {
            // 减仓
            let closed = quantity.min(position.size);
            position.realized_pnl += (price - position.entry_price) * closed * current.sign();
            position.size -= closed;
            position.last_exit_price = Some(price);
            let remainder = quantity - closed;
            if position.size <= 1e-12 {
                position.size = 0.0;
                position.side = None;
                position.entry_price = 0.0;
                if remainder > 1e-12 && !reduce_only {
                    position.side = Some(incoming);
                    position.size = remainder;
                    position.entry_price = price;
                    return quantity;
                }
            }
            closed
        }
        _ if reduce_only => 0.0,
        Some(_) => {
            // 加仓，均价加权
            let total = position.size + quantity;
            position.entry_price = (position.entry_price * position.size + price * quantity) / total;
            position.size = total;
            quantity
        }
        None => {
            position.side = Some(incoming);
            position.size = quantity;
            position.entry_price = price;
            quantity
        }
    }
}

fn process_candle(book: &mut Book, candle: &Candle) {
    book.marks.insert(candle.symbol.clone(), candle.close);

    let mut triggered = Vec::new();
    book.resting.retain(|order| {
        let request = &order.request;
        if request.symbol != candle.symbol {
            return true;
        }
        let fill_price = match (request.order_type, request.side) {
            (OrderType::Limit, OrderSide::Buy) => request.price.filter(|p| candle.low <= *p),
            (OrderType::Limit, OrderSide::Sell) => request.price.filter(|p| candle.high >= *p),
            (OrderType::StopMarket, OrderSide::Sell) => {
                request.trigger_price.filter(|p| candle.low <= *p)
            }
            (OrderType::StopMarket, OrderSide::Buy) => {
                request.trigger_price.filter(|p| candle.high >= *p)
            }
            (OrderType::TakeProfitMarket, OrderSide::Sell) => {
                request.trigger_price.filter(|p| candle.high >= *p)
            }
            (OrderType::TakeProfitMarket, OrderSide::Buy) => {
                request.trigger_price.filter(|p| candle.low <= *p)
            }
            (OrderType::Market, _) => None,
        };
        match fill_price {
            Some(price) => {
                triggered.push((order.clone(), price));
                false
            }
            None => true,
        }
    });

    for (order, price) in triggered {
        let request = &order.request;
        let filled = fill(
            book,
            &request.symbol,
            request.side,
            request.quantity,
            price,
            request.reduce_only,
        );
        log::debug!(
            "📝 模拟盘 {} {:?} {:?} 触发 @ {} 成交 {}",
            request.symbol,
            request.order_type,
            request.side,
            price,
            filled
        );
        if let Some(ack) = book.acks.get_mut(&request.client_order_id) {
            ack.status = if filled > 0.0 {
                OrderStatus::Filled
            } else {
                OrderStatus::Canceled
            };
            ack.filled_quantity = filled;
            ack.average_price = Some(price);
        }
    }
}

fn rejection(code: i32, message: &str) -> TradingError {
    TradingError::ExchangeRejection {
        code,
        message: message.to_string(),
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        self.source.list_instruments().await
    }

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<CandleStream> {
        let stream = self.source.subscribe_candles(symbol, interval).await?;
        let book = Arc::clone(&self.book);
        let stream = stream.inspect(move |item| {
            if let Ok(candle) = item {
                if let Ok(mut book) = book.lock() {
                    process_candle(&mut book, candle);
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck> {
        let order_id = self.next_order_id();
        let mut book = self.lock()?;
        book.submitted.push(request.clone());

        // 相同 client_order_id 返回同一笔订单
        if let Some(ack) = book.acks.get(&request.client_order_id) {
            return Ok(ack.clone());
        }

        if let Some(remaining) = book.faults.reject.get_mut(&request.order_type) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(rejection(-2010, "注入的拒单"));
            }
        }

        if request.quantity <= 0.0 {
            return Err(rejection(-4003, "Quantity less than or equal to zero."));
        }

        let mark = book.marks.get(&request.symbol).copied().ok_or_else(|| {
            rejection(-1121, "模拟盘还没有该交易对的行情")
        })?;

        let position_side = book.positions.get(&request.symbol).and_then(|p| p.side);
        if request.reduce_only {
            let reduces = match position_side {
                Some(PositionSide::Long) => request.side == OrderSide::Sell,
                Some(PositionSide::Short) => request.side == OrderSide::Buy,
                None => false,
            };
            if !reduces {
                return Err(rejection(-2022, "ReduceOnly Order is rejected."));
            }
        }

        let mut ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
        };

        match request.order_type {
            OrderType::Market => {
                let filled = fill(
                    &mut book,
                    &request.symbol,
                    request.side,
                    request.quantity,
                    mark,
                    request.reduce_only,
                );
                ack.status = OrderStatus::Filled;
                ack.filled_quantity = filled;
                ack.average_price = Some(mark);
            }
            OrderType::Limit => {
                let price = request
                    .price
                    .ok_or_else(|| rejection(-1102, "限价单缺少价格"))?;
                let crosses = match request.side {
                    OrderSide::Buy => price >= mark,
                    OrderSide::Sell => price <= mark,
                };
                if crosses && request.post_only {
                    return Err(rejection(-5022, "Post Only order will be rejected."));
                }
                if crosses {
                    let filled = fill(
                        &mut book,
                        &request.symbol,
                        request.side,
                        request.quantity,
                        mark,
                        request.reduce_only,
                    );
                    ack.status = OrderStatus::Filled;
                    ack.filled_quantity = filled;
                    ack.average_price = Some(mark);
                } else {
                    book.resting.push(RestingOrder {
                        order_id: order_id.clone(),
                        request: request.clone(),
                    });
                }
            }
            OrderType::StopMarket | OrderType::TakeProfitMarket => {
                let trigger = request
                    .trigger_price
                    .ok_or_else(|| rejection(-1102, "条件单缺少触发价"))?;
                let immediate = match (request.order_type, request.side) {
                    (OrderType::StopMarket, OrderSide::Sell) => trigger >= mark,
                    (OrderType::StopMarket, OrderSide::Buy) => trigger <= mark,
                    (OrderType::TakeProfitMarket, OrderSide::Sell) => trigger <= mark,
                    _ => trigger >= mark,
                };
                if immediate {
                    return Err(rejection(-2021, "Order would immediately trigger."));
                }
                book.resting.push(RestingOrder {
                    order_id: order_id.clone(),
                    request: request.clone(),
                });
            }
        }

        book.acks.insert(request.client_order_id.clone(), ack.clone());

        if book.faults.drop_acks > 0 {
            book.faults.drop_acks -= 1;
            return Err(TradingError::TransientNetwork("回执丢失".to_string()));
        }
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut book = self.lock()?;
        let before = book.resting.len();
        book.resting
            .retain(|o| !(o.order_id == order_id && o.request.symbol == symbol));
        if book.resting.len() == before {
            return Err(rejection(-2011, "Unknown order sent."));
        }
        if let Some(ack) = book.acks.values_mut().find(|a| a.order_id == order_id) {
            ack.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot> {
        let book = self.lock()?;
        let mark = book.marks.get(symbol).copied().unwrap_or(0.0);
        Ok(match book.positions.get(symbol) {
            Some(p) if p.size > 0.0 => PositionSnapshot {
                symbol: symbol.to_string(),
                side: p.side,
                size: p.size,
                entry_price: p.entry_price,
                mark_price: mark,
                last_exit_price: p.last_exit_price,
            },
            Some(p) => PositionSnapshot {
                last_exit_price: p.last_exit_price,
                ..PositionSnapshot::flat(symbol, mark)
            },
            None => PositionSnapshot::flat(symbol, mark),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::SyntheticMarket;
    use chrono::{TimeZone, Utc};

    fn exchange() -> PaperExchange {
        let market = Arc::new(SyntheticMarket::with_symbols(&["BTCUSDT".to_string()]));
        let exchange = PaperExchange::new(market);
        exchange.set_mark_price("BTCUSDT", 100.0);
        exchange
    }

    fn candle(low: f64, high: f64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 10.0,
            closed: true,
        }
    }

    #[tokio::test]
    async fn test_market_entry_and_stop_trigger() {
        let ex = exchange();
        let ack = ex
            .place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, 2.0, 5, "E1".into()))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        ex.place_order(OrderRequest::stop_market("BTCUSDT", OrderSide::Sell, 2.0, 98.0, "S1".into()))
            .await
            .unwrap();
        ex.on_candle(&candle(97.5, 101.0, 98.5));

        let position = ex.get_position("BTCUSDT").await.unwrap();
        assert!(position.is_flat());
        assert_eq!(position.last_exit_price, Some(98.0));
        assert!((ex.realized_pnl("BTCUSDT") + 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_idempotent_on_client_order_id() {
        let ex = exchange();
        ex.drop_next_acks(1);
        let request = OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0, 5, "E1".into());
        assert!(ex.place_order(request.clone()).await.is_err());
        let ack = ex.place_order(request).await.unwrap();
        assert_eq!(ack.filled_quantity, 1.0);

        let position = ex.get_position("BTCUSDT").await.unwrap();
        assert_eq!(position.size, 1.0);
        assert_eq!(ex.submitted_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_reduce_only_and_post_only_rules() {
        let ex = exchange();
        let err = ex
            .place_order(OrderRequest::close_market("BTCUSDT", OrderSide::Sell, 1.0, "C1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::ExchangeRejection { code: -2022, .. }));

        let err = ex
            .place_order(OrderRequest::limit("BTCUSDT", OrderSide::Buy, 1.0, 101.0, 5, true, "L1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::ExchangeRejection { code: -5022, .. }));

        let ack = ex
            .place_order(OrderRequest::limit("BTCUSDT", OrderSide::Buy, 1.0, 99.0, 5, true, "L2".into()))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        ex.on_candle(&candle(98.9, 100.0, 99.5));
        assert_eq!(ex.get_position("BTCUSDT").await.unwrap().size, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_and_stop_validation() {
        let ex = exchange();
        ex.place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0, 5, "E1".into()))
            .await
            .unwrap();

        let err = ex
            .place_order(OrderRequest::stop_market("BTCUSDT", OrderSide::Sell, 1.0, 100.5, "S1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::ExchangeRejection { code: -2021, .. }));

        let ack = ex
            .place_order(OrderRequest::stop_market("BTCUSDT", OrderSide::Sell, 1.0, 95.0, "S2".into()))
            .await
            .unwrap();
        ex.cancel_order("BTCUSDT", &ack.order_id).await.unwrap();
        assert!(ex.open_orders("BTCUSDT").is_empty());
        assert!(ex.cancel_order("BTCUSDT", &ack.order_id).await.is_err());
    }
}

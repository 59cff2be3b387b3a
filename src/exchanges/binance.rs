//! Binance U本位合约公共行情
//! 只用无需签名的接口：exchangeInfo + ticker/24hr 生成交易对列表，kline WebSocket 推送K线

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::MarketDataSource;
use crate::core::error::TradingError;
use crate::core::exchange::CandleStream;
use crate::core::types::{Candle, Instrument, Interval, LiquidityTier, Result};
use crate::core::websocket::connect_text_stream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(default)]
    contract_type: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    price_change_percent: String,
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

fn parse_f64(field: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| TradingError::validation(field, format!("无法解析数字: {}", value)))
}

fn filter_value(filters: &[serde_json::Value], filter_type: &str, key: &str) -> Option<f64> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some(filter_type))
        .and_then(|f| f.get(key))
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok())
}

/// 解析 kline 推送
pub fn parse_kline_message(text: &str) -> Result<Candle> {
    let event: KlineEvent = serde_json::from_str(text)?;
    let k = event.kline;
    let open_time = Utc
        .timestamp_millis_opt(k.open_time)
        .single()
        .ok_or_else(|| TradingError::validation("open_time", k.open_time.to_string()))?;

    Ok(Candle {
        symbol: event.symbol,
        interval: Interval::from_string(&k.interval)?,
        open_time,
        open: parse_f64("open", &k.open)?,
        high: parse_f64("high", &k.high)?,
        low: parse_f64("low", &k.low)?,
        close: parse_f64("close", &k.close)?,
        volume: parse_f64("volume", &k.volume)?,
        closed: k.closed,
    })
}

/// Binance 公共行情
pub struct BinancePublicFeed {
    client: Client,
    rest_url: String,
    ws_url: String,
    default_max_leverage: u32,
    idle_timeout: Duration,
}

impl BinancePublicFeed {
    pub fn new(rest_url: &str, ws_url: &str, default_max_leverage: u32) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
            default_max_leverage,
            idle_timeout: Duration::from_secs(90),
        })
    }

    /// 发送公共请求
    async fn send_public_request<T>(&self, endpoint: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = Url::parse(&format!("{}{}", self.rest_url, endpoint))
            .map_err(|e| TradingError::FatalConfiguration(format!("无效的REST地址: {}", e)))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "未知错误".to_string());
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
                Err(TradingError::RateLimit(error_text, Some(60)))
            }
            s if s.is_server_error() => Err(TradingError::ExchangeRejection {
                code: s.as_u16() as i32,
                message: error_text,
            }),
            s => Err(TradingError::UniverseFetch(format!("{}: {}", s, error_text))),
        }
    }

    fn build_instruments(
        &self,
        info: ExchangeInfoResponse,
        tickers: Vec<Ticker24h>,
    ) -> Vec<Instrument> {
        let stats: HashMap<String, (f64, f64)> = tickers
            .into_iter()
            .filter_map(|t| {
                let change = t.price_change_percent.parse::<f64>().ok()?;
                let volume = t.quote_volume.parse::<f64>().ok()?;
                Some((t.symbol, (change, volume)))
            })
            .collect();

        info.symbols
            .into_iter()
            .filter(|s| s.contract_type.is_empty() || s.contract_type == "PERPETUAL")
            .filter_map(|s| {
                let tick_size = filter_value(&s.filters, "PRICE_FILTER", "tickSize")?;
                let qty_step = filter_value(&s.filters, "LOT_SIZE", "stepSize")?;
                let min_qty = filter_value(&s.filters, "LOT_SIZE", "minQty")?;
                let max_qty = filter_value(&s.filters, "MARKET_LOT_SIZE", "maxQty")
                    .or_else(|| filter_value(&s.filters, "LOT_SIZE", "maxQty"))?;
                let (change, quote_volume) = stats.get(&s.symbol).copied().unwrap_or((0.0, 0.0));

                Some(Instrument {
                    tradable: s.status == "TRADING",
                    symbol: s.symbol,
                    base_asset: s.base_asset,
                    quote_asset: s.quote_asset,
                    tick_size,
                    qty_step,
                    min_qty,
                    max_qty,
                    max_leverage: self.default_max_leverage,
                    liquidity: LiquidityTier::from_quote_volume(quote_volume),
                    quote_volume_24h: quote_volume,
                    price_change_pct_24h: change.abs(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataSource for BinancePublicFeed {
    fn name(&self) -> &str {
        "binance"
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let info: ExchangeInfoResponse = self.send_public_request("/fapi/v1/exchangeInfo").await?;
        let tickers: Vec<Ticker24h> = self.send_public_request("/fapi/v1/ticker/24hr").await?;
        let instruments = self.build_instruments(info, tickers);
        log::debug!("📋 Binance 返回 {} 个合约", instruments.len());
        Ok(instruments)
    }

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<CandleStream> {
        let url = format!(
            "{}/{}@kline_{}",
            self.ws_url,
            symbol.to_lowercase(),
            interval.as_str()
        );
        let text_stream = connect_text_stream(&url, self.idle_timeout).await?;

        let stream = text_stream.filter_map(|item| async move {
            match item {
                Ok(text) => match parse_kline_message(&text) {
                    Ok(candle) => Some(Ok(candle)),
                    Err(e) => {
                        // 订阅确认等非K线消息
                        log::trace!("忽略非K线消息: {}", e);
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kline_message() {
        let text = r#"{"e":"kline","E":1700000001000,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"37000.1","c":"37010.5","h":"37020.0","l":"36990.0","v":"12.5","x":true}}"#;
        let candle = parse_kline_message(text).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.interval, Interval::OneMinute);
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candle.close, 37010.5);
        assert!(candle.closed);

        assert!(parse_kline_message(r#"{"result":null,"id":1}"#).is_err());
    }

    #[test]
    fn test_build_instruments_from_filters() {
        let info: ExchangeInfoResponse = serde_json::from_str(
            r#"{"symbols":[
                {"symbol":"BTCUSDT","status":"TRADING","contractType":"PERPETUAL","baseAsset":"BTC","quoteAsset":"USDT",
                 "filters":[{"filterType":"PRICE_FILTER","tickSize":"0.10"},
                            {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"1000"},
                            {"filterType":"MARKET_LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"120"}]},
                {"symbol":"BTCUSDT_240628","status":"TRADING","contractType":"CURRENT_QUARTER","baseAsset":"BTC","quoteAsset":"USDT","filters":[]}
            ]}"#,
        )
        .unwrap();
        let tickers: Vec<Ticker24h> = serde_json::from_str(
            r#"[{"symbol":"BTCUSDT","priceChangePercent":"-3.5","quoteVolume":"25000000000"}]"#,
        )
        .unwrap();

        let feed = BinancePublicFeed::new("https://fapi.binance.com", "wss://fstream.binance.com/ws", 20)
            .unwrap();
        let instruments = feed.build_instruments(info, tickers);
        assert_eq!(instruments.len(), 1);
        let btc = &instruments[0];
        assert_eq!(btc.tick_size, 0.1);
        assert_eq!(btc.max_qty, 120.0);
        assert_eq!(btc.liquidity, LiquidityTier::High);
        assert_eq!(btc.price_change_pct_24h, 3.5);
        assert!(btc.tradable);
    }
}

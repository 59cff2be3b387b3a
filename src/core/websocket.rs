/// WebSocket文本流
/// 把 tungstenite 连接包装成只产出文本消息的流，自动回复Ping，空闲超时视为断线
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::error::TradingError;
use crate::core::types::Result;

type RawStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 文本消息流；产出 Err 后流即结束
pub type TextStream = BoxStream<'static, Result<String>>;

/// 订阅连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Streaming => write!(f, "streaming"),
        }
    }
}

/// 建立连接并返回文本流
pub async fn connect_text_stream(url: &str, idle_timeout: Duration) -> Result<TextStream> {
    log::info!("🔌 正在连接WebSocket: {}", url);

    let (ws_stream, _) = connect_async(url).await.map_err(|e| {
        log::error!("❌ WebSocket连接失败: {}", e);
        TradingError::Connection(format!("Connection failed: {}", e))
    })?;
    log::info!("✅ WebSocket连接成功: {}", url);

    let stream = futures_util::stream::unfold(Some(ws_stream), move |state| async move {
        let mut ws = state?;
        let item = next_text(&mut ws, idle_timeout).await?;
        match item {
            Ok(text) => Some((Ok(text), Some(ws))),
            Err(e) => {
                let _ = ws.close(None).await;
                Some((Err(e), None))
            }
        }
    });

    Ok(stream.boxed())
}

/// 读取下一条文本消息；None 表示流正常结束
async fn next_text(ws: &mut RawStream, idle_timeout: Duration) -> Option<Result<String>> {
    loop {
        let message = match timeout(idle_timeout, ws.next()).await {
            Ok(message) => message,
            Err(_) => {
                return Some(Err(TradingError::Timeout {
                    operation: "websocket_receive".to_string(),
                    timeout_seconds: idle_timeout.as_secs(),
                }))
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                // 只在TRACE级别记录原始消息
                log::trace!(
                    "📥 接收WebSocket消息: {}",
                    if text.len() <= 200 {
                        &text
                    } else {
                        &text[..200]
                    }
                );
                return Some(Ok(text));
            }
            Some(Ok(Message::Ping(data))) => {
                // 自动回复Pong
                let _ = ws.send(Message::Pong(data)).await;
                log::trace!("🎾 回复WebSocket Ping");
            }
            Some(Ok(Message::Close(frame))) => {
                log::info!("🔚 WebSocket连接关闭: {:?}", frame);
                return Some(Err(TradingError::Connection("服务端关闭连接".to_string())));
            }
            Some(Ok(_)) => {} // 其他消息类型忽略
            Some(Err(e)) => {
                log::error!("❌ WebSocket接收错误: {}", e);
                return Some(Err(TradingError::WebSocketError(format!(
                    "Receive error: {}",
                    e
                ))));
            }
            None => {
                log::debug!("🔄 WebSocket流结束");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let err = match connect_text_stream("ws://127.0.0.1:1/ws", Duration::from_secs(1)).await {
            Ok(_) => panic!("不应该连接成功"),
            Err(e) => e,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Streaming.to_string(), "streaming");
    }
}

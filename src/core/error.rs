use thiserror::Error;

#[derive(Error, Debug)]
pub enum TradingError {
    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("临时网络错误: {0}")]
    TransientNetwork(String),

    #[error("连接中断: {0}")]
    Connection(String),

    #[error("速率限制: {0}")]
    RateLimit(String, Option<u64>),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("参数验证错误: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("保证金不足: 需要 {required:.4}, 可用 {available:.4}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("交易所拒单: {code} - {message}")]
    ExchangeRejection { code: i32, message: String },

    #[error("仓位无保护: {symbol} - {reason}")]
    UnprotectedPosition { symbol: String, reason: String },

    #[error("交易对列表获取失败: {0}")]
    UniverseFetch(String),

    #[error("交易对列表连续刷新失败 {failures} 次")]
    UniverseExhausted { failures: u32 },

    #[error("配置错误: {0}")]
    FatalConfiguration(String),

    #[error("认证错误: {0}")]
    Authentication(String),

    #[error("交易对已暂停: {0}")]
    InstrumentSuspended(String),

    #[error("风控状态不一致: {0}")]
    RiskStateInconsistency(String),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("配置加载错误: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket错误: {0}")]
    WebSocketError(String),
}

impl TradingError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TradingError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TradingError::NetworkError(_) => true,
            TradingError::TransientNetwork(_) => true,
            TradingError::Connection(_) => true,
            TradingError::WebSocketError(_) => true,
            TradingError::Timeout { .. } => true,
            TradingError::RateLimit(_, _) => true,
            TradingError::ExchangeRejection { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取建议的重试等待时间(秒)
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TradingError::RateLimit(_, retry_after) => *retry_after,
            TradingError::NetworkError(_) | TradingError::TransientNetwork(_) => Some(1),
            TradingError::Timeout { .. } => Some(2),
            TradingError::ExchangeRejection { code, .. } if *code >= 500 => Some(5),
            _ => None,
        }
    }

    /// 整个进程必须停止的错误
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::UniverseExhausted { .. }
                | TradingError::Authentication(_)
                | TradingError::RiskStateInconsistency(_)
                | TradingError::FatalConfiguration(_)
        )
    }

    /// 订单层面无法恢复，状态机直接进入 failed
    pub fn is_unrecoverable_for_order(&self) -> bool {
        matches!(
            self,
            TradingError::Authentication(_) | TradingError::InstrumentSuspended(_)
        )
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TradingError::NetworkError(_)
            | TradingError::TransientNetwork(_)
            | TradingError::Connection(_)
            | TradingError::WebSocketError(_)
            | TradingError::Timeout { .. }
            | TradingError::RateLimit(_, _) => ErrorSeverity::Warning,
            TradingError::Validation { .. } | TradingError::InsufficientMargin { .. } => {
                ErrorSeverity::Info
            }
            TradingError::UniverseFetch(_) => ErrorSeverity::Warning,
            TradingError::UnprotectedPosition { .. } => ErrorSeverity::Critical,
            _ if self.is_process_fatal() => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，可以重试
    Error,    // 一般错误，影响单个交易对
    Critical, // 严重错误，需要立即处理
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TradingError::TransientNetwork("reset".into()).is_retryable());
        assert!(TradingError::Connection("eof".into()).is_retryable());
        assert!(TradingError::ExchangeRejection {
            code: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!TradingError::ExchangeRejection {
            code: 400,
            message: "bad qty".into()
        }
        .is_retryable());
        assert!(!TradingError::validation("quantity", "too small").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TradingError::UniverseExhausted { failures: 5 }.is_process_fatal());
        assert!(TradingError::Authentication("revoked".into()).is_process_fatal());
        assert!(!TradingError::UniverseFetch("timeout".into()).is_process_fatal());
        assert!(TradingError::InstrumentSuspended("XUSDT".into()).is_unrecoverable_for_order());
        assert_eq!(
            TradingError::UnprotectedPosition {
                symbol: "BTCUSDT".into(),
                reason: "stop rejected".into()
            }
            .severity(),
            ErrorSeverity::Critical
        );
    }
}

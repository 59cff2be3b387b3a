//! 告警事件与Webhook通知模块
//! 事件先进入无界通道，再由后台任务写日志并推送到企业微信等平台

use crate::core::circuit_breaker::BreakerKind;
use crate::core::config::AlertConfig;
use crate::core::error::TradingError;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 消息级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl MessageLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }

    pub fn emoji(&self) -> &str {
        match self {
            Self::Debug => "🔍",
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Error => "❌",
            Self::Critical => "🚨",
        }
    }
}

/// 健康/告警事件
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    UniverseRefreshFailed {
        consecutive_failures: u32,
        error: String,
    },
    /// 连续刷新失败达到上限，进程即将停止
    UniverseExhausted { failures: u32 },
    FeedDegraded { symbol: String, attempts: u32 },
    FeedRecovered { symbol: String },
    CircuitBreakerTripped { breaker: BreakerKind, detail: String },
    CircuitBreakerReset { manual: bool },
    EmergencyClose { symbol: String, reason: String },
    PositionFailed { symbol: String, reason: String },
    /// 进程级致命错误，流水线排空后退出
    Fatal { reason: String },
}

impl AlertEvent {
    pub fn level(&self) -> MessageLevel {
        match self {
            AlertEvent::UniverseRefreshFailed { .. } => MessageLevel::Warning,
            AlertEvent::UniverseExhausted { .. } => MessageLevel::Critical,
            AlertEvent::FeedDegraded { .. } => MessageLevel::Error,
            AlertEvent::FeedRecovered { .. } => MessageLevel::Info,
            AlertEvent::CircuitBreakerTripped { .. } => MessageLevel::Error,
            AlertEvent::CircuitBreakerReset { .. } => MessageLevel::Info,
            AlertEvent::EmergencyClose { .. } => MessageLevel::Critical,
            AlertEvent::PositionFailed { .. } => MessageLevel::Warning,
            AlertEvent::Fatal { .. } => MessageLevel::Critical,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AlertEvent::UniverseRefreshFailed { .. } => "交易对刷新失败",
            AlertEvent::UniverseExhausted { .. } => "交易对刷新彻底失败",
            AlertEvent::FeedDegraded { .. } => "行情降级",
            AlertEvent::FeedRecovered { .. } => "行情恢复",
            AlertEvent::CircuitBreakerTripped { .. } => "熔断触发",
            AlertEvent::CircuitBreakerReset { .. } => "熔断解除",
            AlertEvent::EmergencyClose { .. } => "紧急平仓",
            AlertEvent::PositionFailed { .. } => "开仓失败",
            AlertEvent::Fatal { .. } => "致命错误",
        }
    }

    pub fn body(&self) -> String {
        match self {
            AlertEvent::UniverseRefreshFailed {
                consecutive_failures,
                error,
            } => format!("连续失败 {} 次，继续使用旧列表: {}", consecutive_failures, error),
            AlertEvent::UniverseExhausted { failures } => {
                format!("连续失败 {} 次，停止交易", failures)
            }
            AlertEvent::FeedDegraded { symbol, attempts } => {
                format!("{} 重连 {} 次仍失败，暂停新信号，持仓走轮询兜底", symbol, attempts)
            }
            AlertEvent::FeedRecovered { symbol } => format!("{} 行情恢复", symbol),
            AlertEvent::CircuitBreakerTripped { breaker, detail } => {
                format!("[{}] {}", breaker, detail)
            }
            AlertEvent::CircuitBreakerReset { manual } => {
                if *manual {
                    "人工重置".to_string()
                } else {
                    "冷却期结束自动重置".to_string()
                }
            }
            AlertEvent::EmergencyClose { symbol, reason } => format!("{}: {}", symbol, reason),
            AlertEvent::PositionFailed { symbol, reason } => format!("{}: {}", symbol, reason),
            AlertEvent::Fatal { reason } => format!("{}，排空持仓后退出", reason),
        }
    }

    /// 限流键：同类事件同一交易对合并
    fn rate_key(&self) -> String {
        let symbol = match self {
            AlertEvent::FeedDegraded { symbol, .. }
            | AlertEvent::FeedRecovered { symbol }
            | AlertEvent::EmergencyClose { symbol, .. }
            | AlertEvent::PositionFailed { symbol, .. } => symbol.as_str(),
            _ => "",
        };
        format!("{}::{}", self.title(), symbol)
    }
}

/// 告警总线；emit 不阻塞，可以在持锁时调用
#[derive(Debug, Clone)]
pub struct AlertBus {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl AlertBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AlertEvent) {
        if self.tx.send(event).is_err() {
            debug!("告警通道已关闭，丢弃事件");
        }
    }
}

/// 企业微信消息格式
#[derive(Debug, Serialize)]
struct WeChatWorkMessage {
    msgtype: String,
    markdown: MarkdownContent,
}

#[derive(Debug, Serialize)]
struct MarkdownContent {
    content: String,
}

/// Webhook通知器
pub struct WebhookNotifier {
    config: AlertConfig,
    client: Client,
    /// 上次发送时间记录（用于限流）
    last_send_times: HashMap<String, DateTime<Utc>>,
}

impl WebhookNotifier {
    /// 创建新的通知器
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            last_send_times: HashMap::new(),
        }
    }

    fn should_push(&mut self, event: &AlertEvent, now: DateTime<Utc>) -> bool {
        if !self.config.enabled || self.config.webhook_url.is_none() {
            return false;
        }

        let min_level = MessageLevel::from_str(&self.config.min_level);
        if event.level() < min_level {
            return false;
        }

        // 致命事件不限流
        if event.level() == MessageLevel::Critical {
            return true;
        }

        let key = event.rate_key();
        if let Some(last_time) = self.last_send_times.get(&key) {
            let elapsed = now.signed_duration_since(*last_time);
            if elapsed < Duration::seconds(self.config.rate_limit_seconds as i64) {
                debug!("跳过推送，限流中: {}", key);
                return false;
            }
        }

        self.last_send_times.insert(key, now);
        true
    }

    /// 发送事件通知
    pub async fn send_event(&mut self, strategy: &str, event: &AlertEvent) -> Result<(), TradingError> {
        if !self.should_push(event, Utc::now()) {
            return Ok(());
        }

        let content = Self::build_event_message(strategy, event);
        self.send_to_wechat_work(content).await
    }

    fn build_event_message(strategy: &str, event: &AlertEvent) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let level = event.level();

        format!(
            r#"## {} {}

**策略**: {}
**级别**: {:?}
**时间**: {}

{}"#,
            level.emoji(),
            event.title(),
            strategy,
            level,
            now,
            event.body()
        )
    }

    /// 发送到企业微信
    async fn send_to_wechat_work(&self, content: String) -> Result<(), TradingError> {
        let url = match &self.config.webhook_url {
            Some(url) => url,
            None => return Ok(()),
        };

        let message = WeChatWorkMessage {
            msgtype: "markdown".to_string(),
            markdown: MarkdownContent { content },
        };

        let response = self.client.post(url).json(&message).send().await?;

        if response.status().is_success() {
            info!("成功发送Webhook通知");
        } else {
            warn!("Webhook发送失败: {}", response.status());
        }

        Ok(())
    }
}

/// 告警分发任务：所有事件写日志，满足级别的再推送
pub async fn run_alert_dispatcher(
    mut rx: mpsc::UnboundedReceiver<AlertEvent>,
    mut notifier: WebhookNotifier,
    strategy: String,
) {
    while let Some(event) = rx.recv().await {
        match event.level() {
            MessageLevel::Critical | MessageLevel::Error => {
                error!("{} {}: {}", event.level().emoji(), event.title(), event.body())
            }
            MessageLevel::Warning => {
                warn!("{} {}: {}", event.level().emoji(), event.title(), event.body())
            }
            _ => info!("{} {}: {}", event.level().emoji(), event.title(), event.body()),
        }

        if let Err(e) = notifier.send_event(&strategy, &event).await {
            warn!("推送告警失败: {}", e);
        }
    }
    debug!("告警分发任务退出");
}

/// 订单ID生成器
///
/// 格式: [策略代码][用途][yyMMddHHmmss][4位序列号]，只含字母数字，最长36个字符
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};

const MAX_LENGTH: usize = 36;

/// 订单用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPurpose {
    Entry,
    StopLoss,
    TakeProfit,
    Close,
}

impl OrderPurpose {
    fn code(&self) -> char {
        match self {
            OrderPurpose::Entry => 'E',
            OrderPurpose::StopLoss => 'S',
            OrderPurpose::TakeProfit => 'T',
            OrderPurpose::Close => 'C',
        }
    }

    fn from_code(code: char) -> Option<Self> {
        match code {
            'E' => Some(OrderPurpose::Entry),
            'S' => Some(OrderPurpose::StopLoss),
            'T' => Some(OrderPurpose::TakeProfit),
            'C' => Some(OrderPurpose::Close),
            _ => None,
        }
    }
}

/// 订单ID生成器，进程内共享
pub struct OrderIdGenerator {
    strategy_code: String,
    sequence: AtomicU32,
}

impl OrderIdGenerator {
    /// 创建新的订单ID生成器
    pub fn new(strategy_name: &str) -> Self {
        Self {
            strategy_code: Self::generate_strategy_code(strategy_name),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn strategy_code(&self) -> &str {
        &self.strategy_code
    }

    /// 生成订单ID
    pub fn generate(&self, purpose: OrderPurpose) -> String {
        self.generate_at(purpose, Utc::now())
    }

    pub fn generate_at(&self, purpose: OrderPurpose, now: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut order_id = format!(
            "{}{}{}{:04}",
            self.strategy_code,
            purpose.code(),
            now.format("%y%m%d%H%M%S"),
            seq % 10000
        );

        // 确保不超过最大长度
        order_id.truncate(MAX_LENGTH);
        order_id
    }

    /// 解析订单ID获取策略代码和用途
    pub fn parse_order_id(order_id: &str) -> Option<OrderIdInfo> {
        // 用途(1) + 时间戳(12) + 序列号(4)
        const SUFFIX: usize = 17;
        if order_id.len() <= SUFFIX || !order_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }

        let split = order_id.len() - SUFFIX;
        let strategy_code = &order_id[..split];
        let purpose = OrderPurpose::from_code(order_id[split..].chars().next()?)?;
        let sequence = order_id[order_id.len() - 4..].parse().ok()?;

        Some(OrderIdInfo {
            strategy_code: strategy_code.to_string(),
            purpose,
            sequence,
        })
    }

    /// 生成策略代码：取每个单词的首字母，最多3个
    fn generate_strategy_code(strategy_name: &str) -> String {
        let code: String = strategy_name
            .split(|c: char| c == '_' || c == '-' || c == ' ')
            .filter_map(|w| w.chars().find(|c| c.is_ascii_alphanumeric()))
            .take(3)
            .collect::<String>()
            .to_uppercase();

        if code.is_empty() {
            "CTA".to_string()
        } else {
            code
        }
    }
}

/// 订单ID信息
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIdInfo {
    pub strategy_code: String,
    pub purpose: OrderPurpose,
    pub sequence: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_order_id_generation() {
        let gen = OrderIdGenerator::new("rule_table");
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let id1 = gen.generate_at(OrderPurpose::Entry, now);
        let id2 = gen.generate_at(OrderPurpose::Entry, now);

        assert_eq!(id1, "RTE2403051407090000");
        assert_ne!(id1, id2);
        assert!(id1.len() <= 36);
        assert!(id1.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_order_id_parsing() {
        let gen = OrderIdGenerator::new("donchian");
        let id = gen.generate(OrderPurpose::StopLoss);

        let info = OrderIdGenerator::parse_order_id(&id).unwrap();
        assert_eq!(info.strategy_code, "D");
        assert_eq!(info.purpose, OrderPurpose::StopLoss);
        assert_eq!(info.sequence, 0);

        assert!(OrderIdGenerator::parse_order_id("short").is_none());
    }
}

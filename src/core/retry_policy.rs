use crate::core::config::BackoffConfig;
use crate::core::error::TradingError;
/// 智能重试策略
use std::time::Duration;
use tokio::time::sleep;

/// 指数退避计算器
///
/// 第 n 次失败后的等待时间为 base * factor^n，封顶 max。
/// 开启抖动时在 [0.75, 1.0] 倍之间随机，保证不会超过上限。
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            factor,
            max,
            jitter,
            attempt: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.factor,
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// 已连续失败的次数
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// 不带抖动的第 attempt 次延迟
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 返回下一次等待时间并累加失败计数
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if !self.jitter {
            return delay;
        }

        // 添加抖动以避免雷同重试
        use rand::Rng;
        let millis = delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=millis / 4);
        Duration::from_millis(millis - jitter)
    }

    /// 连接稳定后重置
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 是否添加抖动
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

/// 指数退避重试策略
///
/// 只重试 `TradingError::is_retryable` 的错误；限流错误优先使用交易所给出的等待时间。
pub struct ExponentialBackoffRetry {
    config: RetryConfig,
}

impl ExponentialBackoffRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 判断是否应该重试
    pub fn should_retry(&self, error: &TradingError, attempt: u32) -> bool {
        attempt < self.config.max_retries && error.is_retryable()
    }

    /// 计算重试延迟
    pub fn calculate_delay(&self, error: &TradingError, attempt: u32) -> Duration {
        if let TradingError::RateLimit(_, Some(seconds)) = error {
            return Duration::from_secs(*seconds);
        }

        let backoff = Backoff::new(
            Duration::from_millis(self.config.initial_delay_ms),
            self.config.backoff_factor,
            Duration::from_millis(self.config.max_delay_ms),
            self.config.jitter,
        );
        let mut delay_ms = backoff.delay_for(attempt).as_millis() as u64;

        if self.config.jitter {
            use rand::Rng;
            let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4);
            delay_ms = delay_ms.saturating_sub(jitter);
        }

        Duration::from_millis(delay_ms)
    }

    /// 执行带重试的操作
    pub async fn execute_with_retry<F, T, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, TradingError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TradingError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        log::info!("✅ {} 在第{}次尝试后成功", operation_name, attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        if attempt > 0 || error.is_retryable() {
                            log::error!("❌ {} 重试{}次后仍失败: {}", operation_name, attempt, error);
                        }
                        return Err(error);
                    }

                    let delay = self.calculate_delay(&error, attempt);
                    log::warn!(
                        "⚠️ {} 失败，将在{:.2}秒后重试 (尝试 {}/{}): {}",
                        operation_name,
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.config.max_retries,
                        error
                    );

                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delays_double_then_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
            false,
        );
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempts(), 7);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_under_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
            true,
        );
        for attempt in 0..20 {
            let expected = backoff.delay_for(attempt);
            let delay = backoff.next_delay();
            assert!(delay <= expected);
            assert!(delay >= expected * 3 / 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let retry = ExponentialBackoffRetry::new(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result: Result<(), TradingError> = retry
            .execute_with_retry("下单", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TradingError::validation("quantity", "below min"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let retry = ExponentialBackoffRetry::new(RetryConfig {
            max_retries: 3,
            ..RetryConfig::default()
        });
        let calls = AtomicU32::new(0);

        let result = retry
            .execute_with_retry("下单", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TradingError::TransientNetwork("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

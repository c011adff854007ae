use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result, SyncError};

/// 重放失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplayFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 可重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试
    ServerError(u16),
    /// 远端拒绝 - 定时重试无意义，等待下一次上线
    Rejected,
}

impl ReplayFailureReason {
    /// 是否值得定时重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayFailureReason::NetworkTimeout | ReplayFailureReason::NetworkUnavailable => true,
            ReplayFailureReason::ServerError(code) => *code >= 500 && *code < 600,
            ReplayFailureReason::Rejected => false,
        }
    }

    /// 重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            ReplayFailureReason::NetworkTimeout => 1.0,
            ReplayFailureReason::NetworkUnavailable => 2.0,
            ReplayFailureReason::ServerError(_) => 1.5,
            ReplayFailureReason::Rejected => 1.0,
        }
    }
}

impl From<&RemoteError> for ReplayFailureReason {
    fn from(error: &RemoteError) -> Self {
        match error {
            RemoteError::Timeout(_) => ReplayFailureReason::NetworkTimeout,
            RemoteError::Unavailable(_) => ReplayFailureReason::NetworkUnavailable,
            RemoteError::Backend { code, .. } => ReplayFailureReason::ServerError(*code),
            RemoteError::Rejected(_) => ReplayFailureReason::Rejected,
        }
    }
}

/// 排空重试策略
///
/// 由协调器持有，与 UI 定时器无关。`attempt` 为连续中断次数（从 1 开始）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 自动重试的最大连续次数，超过后等待下一次上线
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不自动重试，只在上线时排空
    pub fn disabled() -> Self {
        Self { max_attempts: 0, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_factor < 1.0 {
            return Err(SyncError::Config("backoff_factor must be >= 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(SyncError::Config("jitter_factor must be within 0.0..=1.0".to_string()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config("base_delay_ms must not exceed max_delay_ms".to_string()));
        }
        Ok(())
    }

    pub fn should_retry(&self, attempt: u32, reason: &ReplayFailureReason) -> bool {
        attempt >= 1 && attempt <= self.max_attempts && reason.is_retryable()
    }

    /// 计算第 `attempt` 次中断后的重试延迟；不再重试时返回 None
    pub fn delay_for(&self, attempt: u32, reason: &ReplayFailureReason) -> Option<Duration> {
        if !self.should_retry(attempt, reason) {
            return None;
        }

        // 基础延迟 = base * factor^(attempt-1)
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1).min(32) as i32);
        let adjusted = self.base_delay_ms as f64 * exp * reason.delay_multiplier();
        let capped = adjusted.min(self.max_delay_ms as f64);

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_ms = (capped + jitter).clamp(0.0, self.max_delay_ms as f64);

        Some(Duration::from_millis(final_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(ReplayFailureReason::NetworkTimeout.is_retryable());
        assert!(ReplayFailureReason::NetworkUnavailable.is_retryable());
        assert!(ReplayFailureReason::ServerError(502).is_retryable());
        assert!(!ReplayFailureReason::ServerError(409).is_retryable());
        assert!(!ReplayFailureReason::Rejected.is_retryable());
    }

    #[test]
    fn test_reason_from_remote_error() {
        assert_eq!(
            ReplayFailureReason::from(&RemoteError::Timeout(10)),
            ReplayFailureReason::NetworkTimeout
        );
        assert_eq!(
            ReplayFailureReason::from(&RemoteError::Backend { code: 500, message: String::new() }),
            ReplayFailureReason::ServerError(500)
        );
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy { jitter_factor: 0.0, max_attempts: 10, ..RetryPolicy::default() };
        let reason = ReplayFailureReason::NetworkTimeout;
        assert_eq!(policy.delay_for(1, &reason), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay_for(2, &reason), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.delay_for(3, &reason), Some(Duration::from_millis(4_000)));
        assert_eq!(policy.delay_for(10, &reason), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1, &ReplayFailureReason::NetworkTimeout).unwrap();
            assert!(delay >= Duration::from_millis(950) && delay <= Duration::from_millis(1_050));
        }
    }

    #[test]
    fn test_no_retry_past_max_or_when_rejected() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(6, &ReplayFailureReason::NetworkTimeout).is_none());
        assert!(policy.delay_for(0, &ReplayFailureReason::NetworkTimeout).is_none());
        assert!(policy.delay_for(1, &ReplayFailureReason::Rejected).is_none());
        assert!(RetryPolicy::disabled().delay_for(1, &ReplayFailureReason::NetworkTimeout).is_none());
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { backoff_factor: 0.5, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { jitter_factor: 2.0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { base_delay_ms: 10, max_delay_ms: 1, ..RetryPolicy::default() }
            .validate()
            .is_err());
    }
}

//! 分片重试退避

use std::time::Duration;

/// 初始退避时间（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避时间（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms
pub fn calculate_backoff_delay(retry_count: u32) -> Duration {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
}

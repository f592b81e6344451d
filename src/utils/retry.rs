use std::future::Future;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use crate::core::TransferError;

/// 重试退避策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed {
        #[serde(with = "crate::config::duration_ms")]
        delay: Duration,
    },
    /// 指数退避
    Exponential {
        #[serde(with = "crate::config::duration_ms")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "crate::config::duration_ms")]
        max_delay: Duration,
    },
    /// 线性退避
    Linear {
        #[serde(with = "crate::config::duration_ms")]
        initial: Duration,
        #[serde(with = "crate::config::duration_ms")]
        increment: Duration,
        #[serde(with = "crate::config::duration_ms")]
        max_delay: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryStrategy {
    /// 不等待，立即重试
    pub fn immediate() -> Self {
        RetryStrategy::Fixed { delay: Duration::ZERO }
    }

    /// 计算第 n 次重试的延迟（从 1 开始）
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        match self {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(exponent as f64);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(delay.max(0.0))
            }
            RetryStrategy::Linear { initial, increment, max_delay } => {
                let delay = initial.saturating_add(increment.saturating_mul(exponent));
                std::cmp::min(delay, *max_delay)
            }
        }
    }
}

/// 可被取消的等待，取消时返回 `false`
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// 执行带重试的操作
///
/// 最多执行 `max_retries + 1` 次，只有 [`TransferError::is_retryable`] 的错误会重试。
/// `on_retry` 在每次失败后收到已重试次数与错误。
pub async fn retry_with_strategy<F, Fut, T, R>(
    strategy: &RetryStrategy,
    max_retries: u32,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
    R: FnMut(u32, &TransferError),
{
    let mut retries = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::cancelled());
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !error.is_retryable() || retries >= max_retries {
                    return Err(error);
                }

                retries += 1;
                on_retry(retries, &error);

                if !backoff(strategy.get_delay(retries), cancel).await {
                    return Err(TransferError::cancelled());
                }
            }
        }
    }
}

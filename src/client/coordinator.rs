use crate::error::Result;
use crate::parser::detect_transient;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 隨機抖動範圍（秒）
const JITTER_SECS: std::ops::Range<f64> = 1.0..2.5;

/// 最小間隔限流器
///
/// 與客戶端同生共死：建立時沒有任何紀錄，之後不重置。檢查與等待都在鎖內，
/// 共用同一個客戶端的並行搜尋會依序通過，不會同時看到過期的時間戳。
pub struct RateLimiter {
    interval: Duration,
    jitter: bool,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration, jitter: bool) -> Self {
        Self {
            interval,
            jitter,
            last_request: Mutex::new(None),
        }
    }

    /// 等到可以送出下一個請求為止
    ///
    /// 時間戳在等待結束、請求送出前更新；等待途中被取消時不會更新。
    pub async fn acquire(&self) {
        let mut last_request = self.last_request.lock().await;

        let mut wait = match *last_request {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        };
        if self.jitter {
            wait += Duration::from_secs_f64(rand::rng().random_range(JITTER_SECS));
        }

        if !wait.is_zero() {
            tracing::debug!("限流等待 {:.2} 秒", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }

        *last_request = Some(Instant::now());
    }
}

/// 限流 + 暫態錯誤重試
pub struct Coordinator {
    limiter: RateLimiter,
    max_retries: u32,
    retry_delay: Duration,
}

impl Coordinator {
    pub fn new(rate_limit: Duration, jitter: bool, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit, jitter),
            max_retries,
            retry_delay,
        }
    }

    /// 透過限流器送出請求，遇到暫態錯誤時重試
    ///
    /// `request` 每次呼叫都要能重新送出同樣的請求。
    /// 只有 `RetryableQuery` 會重試，其餘錯誤直接回傳。
    pub async fn execute<F, Fut>(&self, mut request: F) -> Result<String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let attempts = self.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let html = request().await?;
            let Some(err) = detect_transient(&html) else {
                return Ok(html);
            };

            if attempt >= attempts {
                tracing::warn!("重試 {} 次後仍失敗: {}", self.max_retries, err);
                return Err(err);
            }

            let delay = self.retry_delay + Duration::from_secs_f64(rand::rng().random_range(0.0..1.0));
            tracing::warn!(
                "暫態錯誤 ({})，{:.1} 秒後重試 ({}/{})",
                err,
                delay.as_secs_f64(),
                attempt,
                self.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, IqdbError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRANSIENT: &str = "<html><body>Can't read query result!</body></html>";
    const OK_PAGE: &str = "<html><body>ok</body></html>";

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spacing_without_jitter() {
        let coordinator = Coordinator::new(Duration::from_secs(1), false, 0, Duration::ZERO);
        let mut dispatched = Vec::new();

        for _ in 0..2 {
            coordinator
                .execute(|| {
                    dispatched.push(Instant::now());
                    async { Ok(OK_PAGE.to_string()) }
                })
                .await
                .unwrap();
        }

        let gap = dispatched[1] - dispatched[0];
        assert!(gap >= Duration::from_secs(1), "間隔太短: {:?}", gap);
        assert!(gap < Duration::from_millis(1500), "間隔太長: {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_not_delayed() {
        let limiter = RateLimiter::new(Duration::from_secs(5), false);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_adds_delay() {
        let limiter = RateLimiter::new(Duration::ZERO, true);
        let start = Instant::now();
        limiter.acquire().await;

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_millis(2510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1), false));
        let start = Instant::now();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for task in tasks {
            times.push(task.await.unwrap());
        }
        times.sort();

        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert!(times[2] - times[1] >= Duration::from_secs(1));
        assert!(times[2] - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let coordinator = Coordinator::new(Duration::from_millis(10), false, 2, Duration::from_millis(100));
        let attempts = AtomicUsize::new(0);

        let err = coordinator
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(TRANSIENT.to_string()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetryableQuery);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let coordinator = Coordinator::new(Duration::ZERO, false, 3, Duration::from_millis(100));
        let attempts = AtomicUsize::new(0);

        let html = coordinator
            .execute(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(TRANSIENT.to_string())
                    } else {
                        Ok(OK_PAGE.to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(html, OK_PAGE);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let coordinator = Coordinator::new(Duration::ZERO, false, 5, Duration::ZERO);
        let attempts = AtomicUsize::new(0);

        let err = coordinator
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(IqdbError::http("連線中斷")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HttpRequestFailed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_does_not_update_timestamp() {
        let limiter = RateLimiter::new(Duration::from_secs(10), false);
        limiter.acquire().await;

        // 等待途中放棄
        let _ = tokio::time::timeout(Duration::from_secs(1), limiter.acquire()).await;

        let start = Instant::now();
        limiter.acquire().await;
        // 仍以第一次請求為基準：總共 10 秒
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(9) && waited < Duration::from_millis(9010), "{:?}", waited);
    }
}

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::EngineError;

const BASE_DELAY: Duration = Duration::from_secs(2);
const MIN_DELAY: Duration = Duration::from_secs(3);
const MAX_DELAY: Duration = Duration::from_secs(12);

/// Randomized exponential delay for the given zero-based attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .clamp(MIN_DELAY, MAX_DELAY);
    let millis = rand::thread_rng().gen_range(MIN_DELAY.as_millis()..=ceiling.as_millis());
    Duration::from_millis(millis as u64)
}

/// Runs `op` until it succeeds, fails with a non-transient error, or
/// `attempts` tries are used up.
pub async fn with_backoff<T, F, Fut>(label: &str, attempts: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(attempt);
                debug!("{label} failed (attempt {}): {e}, retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

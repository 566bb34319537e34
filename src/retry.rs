use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

const DEFAULT_BASE: Duration = Duration::from_millis(25);
const DEFAULT_MAX: Duration = Duration::from_secs(1);
const MAX_SHIFT: u32 = 16;

/// Bounded exponential backoff with half-jitter, shared by the lock wait
/// loop and the STM conflict retry loop so contending sessions do not wake
/// in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max: DEFAULT_MAX,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay for the given 1-based attempt, drawn from [cap/2, cap] where
    /// cap doubles per attempt up to the configured maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_SHIFT);
        let cap = self.base.saturating_mul(1u32 << shift).min(self.max);
        let half = cap / 2;
        let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }

    pub async fn wait(&self, attempt: u32) {
        sleep(self.delay(attempt)).await;
    }
}

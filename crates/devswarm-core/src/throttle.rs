//! Per-direction artificial latency, applied independently to inbound and
//! outbound frames so one virtual device can approximate a slow link
//! without blocking the others sharing the process.

use std::time::Duration;

/// Delays a single direction of traffic by a fixed amount. Order within a
/// direction is preserved: the delay happens on the awaiting task before
/// the frame is handed to the next pipeline stage, so frames already in
/// flight are never reordered relative to later ones queued behind them.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleFilter {
    delay: Duration,
}

impl ThrottleFilter {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub async fn delay(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn zero_delay_returns_immediately() {
        let filter = ThrottleFilter::disabled();
        let start = Instant::now();
        filter.delay().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_delay_advances_virtual_time() {
        let filter = ThrottleFilter::new(50);
        let start = tokio::time::Instant::now();
        filter.delay().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub factor: f64,
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            factor: 2.0,
            min: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff: `min * factor^attempt`, clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let min = self.cfg.min;
        let max = self.cfg.max.max(min);
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let secs = min.as_secs_f64() * self.cfg.factor.powi(exp);
        self.attempt = self.attempt.saturating_add(1);

        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return max;
        }
        if secs <= min.as_secs_f64() {
            return min;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[cfg(test)]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

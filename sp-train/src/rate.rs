//! Production/consumption rate tracking for the replay buffer.
//!
//! One balancer per training run, handed to the learner loop; it reads the
//! buffer counters at epoch boundaries and tells the learner when sampling is
//! outrunning generation. Advisory only: it never blocks producers and never
//! drops data.

use std::time::Duration;

use sp_core::config::RateConfig;

pub struct RateBalancer {
    threshold_factor: f64,
    decay: f64,
    backoff: Duration,

    prev_added: u64,
    prev_sampled: u64,
    add_rate: f64,
    sample_rate: f64,
    primed: bool,
    throttled: bool,
}

impl RateBalancer {
    pub fn new(cfg: &RateConfig) -> Self {
        Self {
            threshold_factor: cfg.threshold_factor,
            decay: cfg.decay,
            backoff: Duration::from_millis(cfg.backoff_ms),
            prev_added: 0,
            prev_sampled: 0,
            add_rate: 0.0,
            sample_rate: 0.0,
            primed: false,
            throttled: false,
        }
    }

    /// Fold the counter deltas over `elapsed` into the running averages.
    ///
    /// The smoothing weight is `decay^elapsed_secs`, so a long gap discounts
    /// history proportionally more than a short one.
    pub fn update(&mut self, num_added: u64, num_sampled: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(1e-9);
        let inst_add = num_added.saturating_sub(self.prev_added) as f64 / secs;
        let inst_sample = num_sampled.saturating_sub(self.prev_sampled) as f64 / secs;
        self.prev_added = num_added;
        self.prev_sampled = num_sampled;

        if self.primed {
            let alpha = self.decay.powf(secs);
            self.add_rate = alpha * self.add_rate + (1.0 - alpha) * inst_add;
            self.sample_rate = alpha * self.sample_rate + (1.0 - alpha) * inst_sample;
        } else {
            self.add_rate = inst_add;
            self.sample_rate = inst_sample;
            self.primed = true;
        }
        self.throttled = self.sample_rate > self.threshold_factor * self.add_rate;
    }

    /// True while the learner should pause and re-check after [`Self::backoff`].
    pub fn throttled(&self) -> bool {
        self.throttled
    }

    pub fn add_rate(&self) -> f64 {
        self.add_rate
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn threshold_factor(&self) -> f64 {
        self.threshold_factor
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: f64) -> RateConfig {
        RateConfig {
            threshold_factor: threshold,
            decay: 0.9,
            backoff_ms: 10,
        }
    }

    #[test]
    fn oversampling_engages_the_throttle_within_bounded_epochs() {
        let mut b = RateBalancer::new(&cfg(1.25));
        let mut added = 0u64;
        let mut sampled = 0u64;
        let mut engaged_at = None;
        for epoch in 0..10 {
            added += 10;
            sampled += 20;
            b.update(added, sampled, Duration::from_secs(1));
            if b.throttled() {
                engaged_at = Some(epoch);
                break;
            }
        }
        // 20/s against 10/s at threshold 1.25 must throttle almost at once.
        assert!(engaged_at.is_some_and(|e| e <= 3), "never throttled");
    }

    #[test]
    fn balanced_rates_do_not_throttle() {
        let mut b = RateBalancer::new(&cfg(1.25));
        let mut added = 0u64;
        let mut sampled = 0u64;
        for _ in 0..20 {
            added += 100;
            sampled += 110;
            b.update(added, sampled, Duration::from_secs(1));
        }
        assert!(!b.throttled());
        assert!((b.add_rate() - 100.0).abs() < 1.0);
    }

    #[test]
    fn throttle_releases_once_production_catches_up() {
        let mut b = RateBalancer::new(&cfg(1.25));
        let mut added = 0u64;
        let mut sampled = 0u64;
        for _ in 0..5 {
            added += 10;
            sampled += 40;
            b.update(added, sampled, Duration::from_secs(1));
        }
        assert!(b.throttled());
        for _ in 0..40 {
            added += 100;
            sampled += 10;
            b.update(added, sampled, Duration::from_secs(1));
            if !b.throttled() {
                return;
            }
        }
        panic!("throttle never released");
    }

    #[test]
    fn longer_gaps_discount_history_more() {
        let mut short = RateBalancer::new(&cfg(1.25));
        let mut long = RateBalancer::new(&cfg(1.25));
        // Both start from a stable 100/s add rate.
        short.update(100, 0, Duration::from_secs(1));
        long.update(100, 0, Duration::from_secs(1));

        // Then production stops; the balancer that waited 10s must have
        // pulled its average much further toward zero than the 1s one.
        short.update(100, 0, Duration::from_secs(1));
        long.update(100, 0, Duration::from_secs(10));
        assert!(long.add_rate() < short.add_rate());
    }

    #[test]
    fn idle_run_is_not_throttled() {
        let mut b = RateBalancer::new(&cfg(1.25));
        b.update(0, 0, Duration::from_secs(1));
        assert!(!b.throttled());
        assert_eq!(b.add_rate(), 0.0);
    }
}

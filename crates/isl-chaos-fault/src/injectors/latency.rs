//! Network latency: delays the caller before the behavior runs.

use super::{
    lock, rng_from_seed, round3, Injector, InjectorState, InjectorStats, Interception, Lifecycle,
};
use crate::behavior::CallInfo;
use crate::faults::{InjectionType, LatencyConfig, LatencyDistribution};
use crate::timeline::Timeline;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    /// Calls that were delayed.
    pub delayed: u64,
    /// Calls that passed the allowlist but lost the probability gate, or
    /// were not in the allowlist.
    pub skipped: u64,
    pub total_delay_ms: f64,
    pub mean_delay_ms: f64,
    pub max_delay_ms: f64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct Samples {
    retained: VecDeque<f64>,
    delayed: u64,
    skipped: u64,
    total_ms: f64,
    max_ms: f64,
}

pub struct LatencyInjector {
    config: LatencyConfig,
    seed: u64,
    rng: Mutex<ChaCha20Rng>,
    samples: Mutex<Samples>,
    lifecycle: Lifecycle,
}

impl LatencyInjector {
    pub fn new(config: LatencyConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            rng: Mutex::new(rng_from_seed(seed)),
            samples: Mutex::new(Samples::default()),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Draw one delay from the configured distribution, clamped to
    /// `[0, max_latency_ms]`.  Does not record anything.
    pub fn sample_delay_ms(&self) -> f64 {
        let mut rng = lock(&self.rng);
        let c = &self.config;
        let raw = match c.distribution {
            LatencyDistribution::Fixed => c.latency_ms,
            LatencyDistribution::Uniform => {
                if c.max_latency_ms > c.min_latency_ms {
                    rng.gen_range(c.min_latency_ms..=c.max_latency_ms)
                } else {
                    c.min_latency_ms
                }
            }
            LatencyDistribution::Normal => {
                // Box–Muller; u1 in (0, 1] keeps ln finite.
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                c.latency_ms + z * c.effective_std_dev()
            }
            LatencyDistribution::Exponential => {
                let u: f64 = 1.0 - rng.gen::<f64>();
                -c.latency_ms * u.ln()
            }
        };
        raw.clamp(0.0, c.max_latency_ms.max(0.0))
    }

    /// Nearest-rank percentile over the retained samples.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let samples = lock(&self.samples);
        percentile_of(&samples.retained, p)
    }

    fn applies_to(&self, behavior: &str) -> bool {
        self.config.affected_operations.is_empty()
            || self.config.affected_operations.iter().any(|op| op == behavior)
    }

    fn gate(&self) -> bool {
        if self.config.probability >= 1.0 {
            return true;
        }
        lock(&self.rng).gen::<f64>() < self.config.probability
    }

    fn record(&self, delay_ms: f64) {
        let mut s = lock(&self.samples);
        s.delayed += 1;
        s.total_ms += delay_ms;
        s.max_ms = s.max_ms.max(delay_ms);
        if self.config.max_samples > 0 {
            if s.retained.len() >= self.config.max_samples {
                s.retained.pop_front();
            }
            s.retained.push_back(delay_ms);
        }
    }

    fn stats(&self) -> LatencyStats {
        let s = lock(&self.samples);
        let mean = if s.delayed == 0 {
            0.0
        } else {
            s.total_ms / s.delayed as f64
        };
        LatencyStats {
            delayed: s.delayed,
            skipped: s.skipped,
            total_delay_ms: round3(s.total_ms),
            mean_delay_ms: round3(mean),
            max_delay_ms: round3(s.max_ms),
            p50_ms: percentile_of(&s.retained, 50.0).map(round3),
            p95_ms: percentile_of(&s.retained, 95.0).map(round3),
            p99_ms: percentile_of(&s.retained, 99.0).map(round3),
        }
    }
}

fn percentile_of(samples: &VecDeque<f64>, p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

impl Injector for LatencyInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::NetworkLatency
    }

    fn activate(&mut self, timeline: &Timeline) {
        *lock(&self.samples) = Samples::default();
        *lock(&self.rng) = rng_from_seed(self.seed);
        self.lifecycle.begin(
            InjectionType::NetworkLatency,
            timeline,
            json!({
                "distribution": self.config.distribution,
                "latencyMs": self.config.latency_ms,
                "maxLatencyMs": self.config.max_latency_ms,
                "probability": self.config.probability,
            }),
        );
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(InjectionType::NetworkLatency, timeline) {
            timeline.injection_end(InjectionType::NetworkLatency, json!(self.stats()));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        self.lifecycle
            .snapshot(InjectionType::NetworkLatency, InjectorStats::Latency(self.stats()))
    }

    fn intercept(&self, call: &CallInfo<'_>, _timeline: &Timeline) -> Interception {
        if !self.is_active() {
            return Interception::Proceed;
        }
        if !self.applies_to(call.behavior) || !self.gate() {
            lock(&self.samples).skipped += 1;
            return Interception::Proceed;
        }
        let delay_ms = self.sample_delay_ms();
        self.record(delay_ms);
        if delay_ms > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(delay_ms / 1000.0));
        }
        Interception::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Instant;

    fn call<'a>(behavior: &'a str, input: &'a Value) -> CallInfo<'a> {
        CallInfo {
            behavior,
            input,
            attempt: 1,
            sequence: 0,
        }
    }

    #[test]
    fn normal_distribution_is_centered_and_clamped() {
        let injector = LatencyInjector::new(
            LatencyConfig {
                distribution: LatencyDistribution::Normal,
                latency_ms: 100.0,
                std_dev_ms: Some(20.0),
                max_latency_ms: 150.0,
                ..Default::default()
            },
            42,
        );
        let samples: Vec<f64> = (0..1000).map(|_| injector.sample_delay_ms()).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 100.0).abs() <= 10.0, "mean {mean}");
        assert!(samples.iter().all(|&s| (0.0..=150.0).contains(&s)));
    }

    #[test]
    fn exponential_and_uniform_stay_in_bounds() {
        let exp = LatencyInjector::new(
            LatencyConfig {
                distribution: LatencyDistribution::Exponential,
                latency_ms: 50.0,
                max_latency_ms: 200.0,
                ..Default::default()
            },
            1,
        );
        let uni = LatencyInjector::new(
            LatencyConfig {
                distribution: LatencyDistribution::Uniform,
                min_latency_ms: 10.0,
                max_latency_ms: 20.0,
                ..Default::default()
            },
            1,
        );
        for _ in 0..500 {
            assert!((0.0..=200.0).contains(&exp.sample_delay_ms()));
            assert!((10.0..=20.0).contains(&uni.sample_delay_ms()));
        }
    }

    #[test]
    fn same_seed_same_samples() {
        let cfg = LatencyConfig {
            distribution: LatencyDistribution::Normal,
            ..Default::default()
        };
        let a = LatencyInjector::new(cfg.clone(), 9);
        let b = LatencyInjector::new(cfg, 9);
        for _ in 0..20 {
            assert_eq!(a.sample_delay_ms(), b.sample_delay_ms());
        }
    }

    #[test]
    fn intercept_delays_the_caller_and_tracks_stats() {
        let timeline = Timeline::new();
        let mut injector = LatencyInjector::new(
            LatencyConfig {
                latency_ms: 5.0,
                ..Default::default()
            },
            0,
        );
        injector.activate(&timeline);
        let input = json!({});
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(injector.intercept(&call("Pay", &input), &timeline), Interception::Proceed);
        }
        assert!(start.elapsed() >= Duration::from_millis(15));

        let InjectorStats::Latency(stats) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        assert_eq!(stats.delayed, 3);
        assert_eq!(stats.total_delay_ms, 15.0);
        assert_eq!(stats.mean_delay_ms, 5.0);
        assert_eq!(stats.p99_ms, Some(5.0));
        injector.deactivate(&timeline);
    }

    #[test]
    fn allowlist_and_zero_probability_skip() {
        let timeline = Timeline::new();
        let mut only_pay = LatencyInjector::new(
            LatencyConfig {
                latency_ms: 1.0,
                affected_operations: vec!["Pay".into()],
                ..Default::default()
            },
            0,
        );
        let mut never = LatencyInjector::new(
            LatencyConfig {
                latency_ms: 1.0,
                probability: 0.0,
                ..Default::default()
            },
            0,
        );
        only_pay.activate(&timeline);
        never.activate(&timeline);
        let input = json!({});
        only_pay.intercept(&call("Refund", &input), &timeline);
        only_pay.intercept(&call("Pay", &input), &timeline);
        never.intercept(&call("Pay", &input), &timeline);

        let InjectorStats::Latency(a) = only_pay.state().stats else {
            panic!("wrong stats kind");
        };
        let InjectorStats::Latency(b) = never.state().stats else {
            panic!("wrong stats kind");
        };
        assert_eq!((a.delayed, a.skipped), (1, 1));
        assert_eq!((b.delayed, b.skipped), (0, 1));
    }

    #[test]
    fn nearest_rank_percentiles() {
        let samples: VecDeque<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile_of(&samples, 50.0), Some(50.0));
        assert_eq!(percentile_of(&samples, 95.0), Some(95.0));
        assert_eq!(percentile_of(&samples, 100.0), Some(100.0));
        assert_eq!(percentile_of(&VecDeque::new(), 50.0), None);
    }
}

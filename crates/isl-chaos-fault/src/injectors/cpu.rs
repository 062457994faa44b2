//! CPU pressure: background workers alternating spin bursts and yields.

use super::{round3, Injector, InjectorError, InjectorState, InjectorStats, Lifecycle};
use crate::cancel::CancelToken;
use crate::faults::{CpuConfig, InjectionType};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub workers: usize,
    pub bursts: u64,
    pub spin_ms: f64,
    pub yield_ms: f64,
    /// Measured share of time spent spinning.
    pub duty_cycle: f64,
}

#[derive(Debug, Default)]
struct Counters {
    bursts: AtomicU64,
    spin_us: AtomicU64,
    yield_us: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.bursts.store(0, Ordering::Relaxed);
        self.spin_us.store(0, Ordering::Relaxed);
        self.yield_us.store(0, Ordering::Relaxed);
    }
}

pub struct CpuPressureInjector {
    config: CpuConfig,
    counters: Arc<Counters>,
    token: Option<CancelToken>,
    workers: Vec<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl CpuPressureInjector {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            token: None,
            workers: Vec::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    fn spawn_worker(
        &self,
        index: usize,
        token: CancelToken,
    ) -> Result<JoinHandle<()>, InjectorError> {
        let counters = Arc::clone(&self.counters);
        let spin = Duration::from_micros(self.config.spin_micros());
        let pause = Duration::from_millis(self.config.yield_ms);
        let deadline = self
            .config
            .duration_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let handle = std::thread::Builder::new()
            .name(format!("cpu-pressure-{index}"))
            .spawn(move || pressure_loop(&token, &counters, spin, pause, deadline))?;
        Ok(handle)
    }

    /// Cancel and join every worker.
    fn stop(&mut self, timeline: &Timeline) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                timeline.error(
                    Some(InjectionType::CpuPressure),
                    json!({ "reason": InjectorError::WorkerPanicked.to_string() }),
                );
            }
        }
    }

    fn stats(&self) -> CpuStats {
        let spin_us = self.counters.spin_us.load(Ordering::Relaxed);
        let yield_us = self.counters.yield_us.load(Ordering::Relaxed);
        let busy = spin_us + yield_us;
        CpuStats {
            workers: self.config.workers,
            bursts: self.counters.bursts.load(Ordering::Relaxed),
            spin_ms: round3(spin_us as f64 / 1000.0),
            yield_ms: round3(yield_us as f64 / 1000.0),
            duty_cycle: if busy == 0 {
                0.0
            } else {
                round3(spin_us as f64 / busy as f64)
            },
        }
    }
}

fn pressure_loop(
    token: &CancelToken,
    counters: &Counters,
    spin: Duration,
    pause: Duration,
    deadline: Option<Instant>,
) {
    while !token.is_cancelled() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let burst = Instant::now();
        while burst.elapsed() < spin {
            std::hint::spin_loop();
        }
        counters
            .spin_us
            .fetch_add(burst.elapsed().as_micros() as u64, Ordering::Relaxed);
        counters.bursts.fetch_add(1, Ordering::Relaxed);

        if !pause.is_zero() {
            let gap = Instant::now();
            let completed = token.sleep(pause);
            counters
                .yield_us
                .fetch_add(gap.elapsed().as_micros() as u64, Ordering::Relaxed);
            if !completed {
                break;
            }
        }
    }
}

impl Injector for CpuPressureInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::CpuPressure
    }

    fn activate(&mut self, timeline: &Timeline) {
        self.stop(timeline);
        self.counters.reset();
        self.lifecycle.begin(
            InjectionType::CpuPressure,
            timeline,
            json!({
                "percentage": self.config.percentage,
                "burstMs": self.config.burst_ms,
                "yieldMs": self.config.yield_ms,
                "workers": self.config.workers,
            }),
        );
        let token = CancelToken::new();
        for index in 0..self.config.workers {
            match self.spawn_worker(index, token.clone()) {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    log::warn!("cpu pressure worker {index} failed to start: {err}");
                    timeline.error(
                        Some(InjectionType::CpuPressure),
                        json!({ "reason": err.to_string(), "worker": index }),
                    );
                }
            }
        }
        self.token = Some(token);
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if !self.lifecycle.is_active() {
            return;
        }
        self.stop(timeline);
        self.lifecycle.end(InjectionType::CpuPressure, timeline);
        timeline.injection_end(InjectionType::CpuPressure, json!(self.stats()));
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        self.lifecycle
            .snapshot(InjectionType::CpuPressure, InjectorStats::Cpu(self.stats()))
    }
}

impl Drop for CpuPressureInjector {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> CpuConfig {
        CpuConfig {
            percentage: 50,
            burst_ms: 4,
            yield_ms: 2,
            duration_ms: None,
            workers: 2,
        }
    }

    #[test]
    fn spins_while_active_and_stops_on_deactivate() {
        let timeline = Timeline::new();
        let mut injector = CpuPressureInjector::new(small());
        injector.activate(&timeline);
        std::thread::sleep(Duration::from_millis(30));
        injector.deactivate(&timeline);

        let InjectorStats::Cpu(stats) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        assert!(stats.bursts >= 2, "bursts {}", stats.bursts);
        assert!(stats.spin_ms > 0.0);
        assert!(!injector.is_active());

        let after = stats.bursts;
        std::thread::sleep(Duration::from_millis(10));
        let InjectorStats::Cpu(later) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        assert_eq!(later.bursts, after);
    }

    #[test]
    fn deactivate_returns_promptly_during_long_yield() {
        let timeline = Timeline::new();
        let mut injector = CpuPressureInjector::new(CpuConfig {
            yield_ms: 10_000,
            workers: 1,
            ..small()
        });
        injector.activate(&timeline);
        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        injector.deactivate(&timeline);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn duration_bounds_the_loop() {
        let timeline = Timeline::new();
        let mut injector = CpuPressureInjector::new(CpuConfig {
            duration_ms: Some(5),
            workers: 1,
            ..small()
        });
        injector.activate(&timeline);
        std::thread::sleep(Duration::from_millis(80));
        let InjectorStats::Cpu(first) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        std::thread::sleep(Duration::from_millis(20));
        let InjectorStats::Cpu(second) = injector.state().stats else {
            panic!("wrong stats kind");
        };
        assert_eq!(first.bursts, second.bursts);
        injector.deactivate(&timeline);
    }
}

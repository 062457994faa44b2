//! Memory pressure: holds a target number of megabytes for the duration of
//! the scenario, allocated at once or ramped up in steps.

use super::{lock, Injector, InjectorError, InjectorState, InjectorStats, Lifecycle};
use crate::cancel::CancelToken;
use crate::faults::{InjectionType, MemoryConfig};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const MB: u64 = 1024 * 1024;
const FILL: u8 = 0xA5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub target_mb: u64,
    pub allocated_bytes: u64,
    pub peak_bytes: u64,
    pub steps_completed: u32,
    pub steps_total: u32,
    pub allocation_failures: u32,
    pub released: bool,
}

impl MemoryStats {
    pub fn allocated_mb(&self) -> f64 {
        self.allocated_bytes as f64 / MB as f64
    }

    pub fn peak_mb(&self) -> f64 {
        self.peak_bytes as f64 / MB as f64
    }
}

#[derive(Debug, Default)]
struct Held {
    buffers: Vec<Vec<u8>>,
    stats: MemoryStats,
}

pub struct MemoryPressureInjector {
    config: MemoryConfig,
    held: Arc<Mutex<Held>>,
    token: Option<CancelToken>,
    ramp: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl MemoryPressureInjector {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            held: Arc::new(Mutex::new(Held::default())),
            token: None,
            ramp: None,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Byte sizes of each allocation step; the last step takes the
    /// remainder.
    fn step_sizes(&self) -> Vec<usize> {
        let total = usize::try_from(self.config.target_mb.saturating_mul(MB)).unwrap_or(usize::MAX);
        let steps = self.config.steps.max(1) as usize;
        let each = total / steps;
        let mut sizes = vec![each; steps];
        if let Some(last) = sizes.last_mut() {
            *last = total - each * (steps - 1);
        }
        sizes
    }

    fn stop_ramp(&mut self, timeline: &Timeline) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(handle) = self.ramp.take() {
            if handle.join().is_err() {
                timeline.error(
                    Some(InjectionType::MemoryPressure),
                    json!({ "reason": InjectorError::WorkerPanicked.to_string() }),
                );
            }
        }
    }

    fn release(&self) {
        let mut held = lock(&self.held);
        held.buffers = Vec::new();
        held.stats.allocated_bytes = 0;
        held.stats.released = true;
    }
}

fn allocate(bytes: usize) -> Result<Vec<u8>, InjectorError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|source| InjectorError::Allocation {
            requested_bytes: bytes,
            source,
        })?;
    buffer.resize(bytes, FILL);
    Ok(buffer)
}

/// Perform one step.  Allocation failures are recorded, never raised.
fn allocate_step(held: &Mutex<Held>, bytes: usize, timeline: &Timeline) {
    match allocate(bytes) {
        Ok(buffer) => {
            let mut held = lock(held);
            held.buffers.push(buffer);
            held.stats.allocated_bytes += bytes as u64;
            held.stats.peak_bytes = held.stats.peak_bytes.max(held.stats.allocated_bytes);
            held.stats.steps_completed += 1;
        }
        Err(err) => {
            log::warn!("memory pressure step failed: {err}");
            lock(held).stats.allocation_failures += 1;
            timeline.error(
                Some(InjectionType::MemoryPressure),
                json!({ "reason": err.to_string(), "requestedBytes": bytes }),
            );
        }
    }
}

impl Injector for MemoryPressureInjector {
    fn injection_type(&self) -> InjectionType {
        InjectionType::MemoryPressure
    }

    fn activate(&mut self, timeline: &Timeline) {
        self.stop_ramp(timeline);
        *lock(&self.held) = Held {
            buffers: Vec::new(),
            stats: MemoryStats {
                target_mb: self.config.target_mb,
                steps_total: self.config.steps.max(1),
                ..Default::default()
            },
        };
        self.lifecycle.begin(
            InjectionType::MemoryPressure,
            timeline,
            json!({
                "targetMb": self.config.target_mb,
                "steps": self.config.steps,
                "stepDelayMs": self.config.step_delay_ms,
            }),
        );

        let sizes = self.step_sizes();
        if sizes.len() == 1 {
            allocate_step(&self.held, sizes[0], timeline);
            return;
        }

        let token = CancelToken::new();
        let worker_token = token.clone();
        let held = Arc::clone(&self.held);
        let worker_timeline = timeline.clone();
        let delay = Duration::from_millis(self.config.step_delay_ms);
        let spawned = std::thread::Builder::new()
            .name("memory-ramp".into())
            .spawn(move || {
                let last = sizes.len() - 1;
                for (i, bytes) in sizes.into_iter().enumerate() {
                    if worker_token.is_cancelled() {
                        break;
                    }
                    allocate_step(&held, bytes, &worker_timeline);
                    if i < last && !worker_token.sleep(delay) {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                self.ramp = Some(handle);
                self.token = Some(token);
            }
            Err(err) => timeline.error(
                Some(InjectionType::MemoryPressure),
                json!({ "reason": InjectorError::Spawn(err).to_string() }),
            ),
        }
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if !self.lifecycle.is_active() {
            return;
        }
        self.stop_ramp(timeline);
        if self.config.release_on_deactivate {
            self.release();
        }
        self.lifecycle.end(InjectionType::MemoryPressure, timeline);
        let stats = lock(&self.held).stats.clone();
        timeline.injection_end(InjectionType::MemoryPressure, json!(stats));
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        let stats = lock(&self.held).stats.clone();
        self.lifecycle
            .snapshot(InjectionType::MemoryPressure, InjectorStats::Memory(stats))
    }
}

impl Drop for MemoryPressureInjector {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(handle) = self.ramp.take() {
            let _ = handle.join();
        }
    }
}

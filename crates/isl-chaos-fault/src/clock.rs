//! Clock abstraction consulted by the behavior under test.
//!
//! Implementations read wall-clock time through [`Clock`] (exposed on the
//! per-call [`CallContext`](crate::behavior::CallContext)).  Outside a clock
//! skew injection the executor hands out [`SystemClock`]; while a skew is
//! engaged the behavior sees a [`SkewedClock`] instead.

use crate::faults::{ClockSkewConfig, ClockSkewMode};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The host's real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }
}

/// Offset applied by `config` after `elapsed_ms` of engagement.
pub fn skew_offset_ms(config: &ClockSkewConfig, elapsed_ms: u64) -> i64 {
    match config.mode {
        ClockSkewMode::Fixed => config.offset_ms,
        ClockSkewMode::Drift => {
            (config.drift_ms_per_sec * elapsed_ms as f64 / 1000.0).round() as i64
        }
        ClockSkewMode::Jump => {
            if elapsed_ms >= config.jump_after_ms {
                config.offset_ms
            } else {
                0
            }
        }
        ClockSkewMode::Oscillate => {
            let period = config.period_ms.max(1) as f64;
            let phase = 2.0 * std::f64::consts::PI * (elapsed_ms as f64 / period);
            (config.amplitude_ms as f64 * phase.sin()).round() as i64
        }
    }
}

/// A clock whose readings are shifted by a skew profile while engaged.
#[derive(Debug)]
pub struct SkewedClock {
    config: ClockSkewConfig,
    engaged: AtomicBool,
    engaged_at: Mutex<Option<Instant>>,
    reads: AtomicU64,
    last_offset_ms: AtomicI64,
    max_abs_offset_ms: AtomicI64,
}

impl SkewedClock {
    pub fn new(config: ClockSkewConfig) -> Self {
        Self {
            config,
            engaged: AtomicBool::new(false),
            engaged_at: Mutex::new(None),
            reads: AtomicU64::new(0),
            last_offset_ms: AtomicI64::new(0),
            max_abs_offset_ms: AtomicI64::new(0),
        }
    }

    /// Start skewing and reset read statistics.
    pub fn engage(&self) {
        *self.anchor() = Some(Instant::now());
        self.reads.store(0, Ordering::Relaxed);
        self.last_offset_ms.store(0, Ordering::Relaxed);
        self.max_abs_offset_ms.store(0, Ordering::Relaxed);
        self.engaged.store(true, Ordering::Release);
    }

    /// Stop skewing; subsequent reads return real time.
    pub fn disengage(&self) {
        self.engaged.store(false, Ordering::Release);
        *self.anchor() = None;
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Offset that a read right now would apply.
    pub fn current_offset_ms(&self) -> i64 {
        if !self.is_engaged() {
            return 0;
        }
        let elapsed = self
            .anchor()
            .map_or(0, |at| at.elapsed().as_millis() as u64);
        skew_offset_ms(&self.config, elapsed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn last_offset_ms(&self) -> i64 {
        self.last_offset_ms.load(Ordering::Relaxed)
    }

    pub fn max_abs_offset_ms(&self) -> i64 {
        self.max_abs_offset_ms.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ClockSkewConfig {
        &self.config
    }

    fn anchor(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.engaged_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for SkewedClock {
    fn now_ms(&self) -> i64 {
        let offset = self.current_offset_ms();
        if self.is_engaged() {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.last_offset_ms.store(offset, Ordering::Relaxed);
            self.max_abs_offset_ms
                .fetch_max(offset.saturating_abs(), Ordering::Relaxed);
        }
        SystemClock.now_ms().saturating_add(offset)
    }
}

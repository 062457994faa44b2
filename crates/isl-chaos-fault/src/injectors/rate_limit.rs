//! Rate limiting and rate-limit storms.
//!
//! A fixed-window limiter admits up to `limit` requests per key per
//! `window_ms`.  Requests beyond the budget get the configured action:
//! `reject`, `redirect` and `dead_letter` answer the call with an error
//! outcome, while `throttle` suspends the caller until the window resets.
//! The storm variant floods the limiter with synthetic requests so real
//! calls arrive with the budget already spent: the global bucket on
//! activation, or, when `key` partitions the budget, each partition the
//! first time a real call lands in it.

use super::{lock, pointer, round3, Injector, InjectorState, InjectorStats, Interception, Lifecycle};
use crate::behavior::{BehaviorOutcome, CallInfo};
use crate::canonical::canonical_json;
use crate::faults::{InjectionType, RateLimitAction, RateLimitConfig};
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const GLOBAL_KEY: &str = "*";
/// Upper bound on throttle re-admission attempts for one call.
const MAX_THROTTLE_WAITS: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub limit: u32,
    pub window_ms: u64,
    pub action: RateLimitAction,
    pub allowed: u64,
    /// Requests that exceeded the budget, whatever the action.
    pub limited: u64,
    pub rejected: u64,
    pub throttled: u64,
    pub redirected: u64,
    pub dead_lettered: u64,
    pub throttle_wait_ms: f64,
    pub storm_requests: u64,
    pub storm_limited: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<RateLimitAction>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    admitted: u32,
}

/// Fixed-window counters keyed by partition.
#[derive(Debug, Default)]
struct Limiter {
    windows: BTreeMap<String, Window>,
}

impl Limiter {
    /// Admit one request, or return how long until the window resets.
    fn admit(&mut self, key: &str, limit: u32, window: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let slot = self.windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            admitted: 0,
        });
        let age = now.duration_since(slot.opened);
        if age >= window {
            slot.opened = now;
            slot.admitted = 0;
        }
        if slot.admitted < limit {
            slot.admitted += 1;
            Ok(())
        } else {
            Err(window.saturating_sub(now.duration_since(slot.opened)))
        }
    }
}

pub struct RateLimitInjector {
    injection_type: InjectionType,
    config: RateLimitConfig,
    limiter: Mutex<Limiter>,
    stats: Mutex<RateLimitStats>,
    dead_letters: Mutex<Vec<Value>>,
    /// Partitions already flooded by the storm.
    stormed: Mutex<BTreeSet<String>>,
    lifecycle: Lifecycle,
}

impl RateLimitInjector {
    pub fn new(injection_type: InjectionType, config: RateLimitConfig) -> Self {
        let stats = Mutex::new(Self::fresh_stats(&config));
        Self {
            injection_type,
            config,
            limiter: Mutex::new(Limiter::default()),
            stats,
            dead_letters: Mutex::new(Vec::new()),
            stormed: Mutex::new(BTreeSet::new()),
            lifecycle: Lifecycle::default(),
        }
    }

    fn fresh_stats(config: &RateLimitConfig) -> RateLimitStats {
        RateLimitStats {
            limit: config.limit,
            window_ms: config.window_ms,
            action: config.action,
            ..Default::default()
        }
    }

    /// Inputs parked by the `dead_letter` action.
    pub fn dead_letters(&self) -> Vec<Value> {
        lock(&self.dead_letters).clone()
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    fn partition_key(&self, input: &Value) -> String {
        match &self.config.key {
            None => GLOBAL_KEY.to_string(),
            Some(path) => pointer(input, path)
                .map(canonical_json)
                .unwrap_or_else(|| "<missing>".to_string()),
        }
    }

    fn admit(&self, key: &str) -> Result<(), Duration> {
        lock(&self.limiter).admit(key, self.config.limit, self.window())
    }

    fn is_storm(&self) -> bool {
        self.injection_type == InjectionType::RateLimitStorm
    }

    /// Flood `key` once per activation.
    fn storm(&self, key: &str, timeline: &Timeline) {
        if !lock(&self.stormed).insert(key.to_string()) {
            return;
        }
        let requests = self.config.effective_storm_requests();
        let mut limited = 0u64;
        for _ in 0..requests {
            if self.admit(key).is_err() {
                limited += 1;
            }
        }
        let mut stats = lock(&self.stats);
        stats.storm_requests += u64::from(requests);
        stats.storm_limited += limited;
        drop(stats);
        log::debug!("rate limit storm fired {requests} requests at {key}, {limited} limited");
        if requests > 0 && limited == 0 {
            timeline.error(
                Some(self.injection_type),
                json!({
                    "reason": "storm did not exhaust the budget",
                    "requests": requests,
                    "key": key,
                }),
            );
        }
    }

    fn throttle(&self, key: &str, mut wait: Duration) {
        let start = Instant::now();
        for _ in 0..MAX_THROTTLE_WAITS {
            std::thread::sleep(wait);
            match self.admit(key) {
                Ok(()) => break,
                Err(next) => wait = next.max(Duration::from_millis(1)),
            }
        }
        let mut stats = lock(&self.stats);
        stats.throttle_wait_ms =
            round3(stats.throttle_wait_ms + start.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Injector for RateLimitInjector {
    fn injection_type(&self) -> InjectionType {
        self.injection_type
    }

    fn activate(&mut self, timeline: &Timeline) {
        *lock(&self.limiter) = Limiter::default();
        *lock(&self.stats) = Self::fresh_stats(&self.config);
        lock(&self.dead_letters).clear();
        lock(&self.stormed).clear();
        self.lifecycle.begin(
            self.injection_type,
            timeline,
            json!({
                "limit": self.config.limit,
                "windowMs": self.config.window_ms,
                "action": self.config.action,
            }),
        );
        if self.is_storm() && self.config.key.is_none() {
            self.storm(GLOBAL_KEY, timeline);
        }
    }

    fn deactivate(&mut self, timeline: &Timeline) {
        if self.lifecycle.end(self.injection_type, timeline) {
            let stats = lock(&self.stats).clone();
            timeline.injection_end(self.injection_type, json!(stats));
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    fn state(&self) -> InjectorState {
        let stats = lock(&self.stats).clone();
        self.lifecycle
            .snapshot(self.injection_type, InjectorStats::RateLimit(stats))
    }

    fn intercept(&self, call: &CallInfo<'_>, timeline: &Timeline) -> Interception {
        if !self.is_active() {
            return Interception::Proceed;
        }
        let key = self.partition_key(call.input);
        if self.is_storm() {
            self.storm(&key, timeline);
        }
        let retry_after = match self.admit(&key) {
            Ok(()) => {
                lock(&self.stats).allowed += 1;
                return Interception::Proceed;
            }
            Err(retry_after) => retry_after,
        };

        let action = self.config.action;
        {
            let mut stats = lock(&self.stats);
            stats.limited += 1;
            stats.last_action = Some(action);
            match action {
                RateLimitAction::Reject => stats.rejected += 1,
                RateLimitAction::Throttle => stats.throttled += 1,
                RateLimitAction::Redirect => stats.redirected += 1,
                RateLimitAction::DeadLetter => stats.dead_lettered += 1,
            }
        }
        let message = format!(
            "rate limit of {} per {}ms exceeded for key {key}",
            self.config.limit, self.config.window_ms
        );
        match action {
            RateLimitAction::Throttle => {
                self.throttle(&key, retry_after);
                Interception::Proceed
            }
            RateLimitAction::DeadLetter => {
                lock(&self.dead_letters).push(call.input.clone());
                Interception::Fail(BehaviorOutcome::failure(action.code(), message))
            }
            RateLimitAction::Reject | RateLimitAction::Redirect => {
                Interception::Fail(BehaviorOutcome::failure(action.code(), message))
            }
        }
    }
}

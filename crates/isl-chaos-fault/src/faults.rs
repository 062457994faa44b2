//! Injection directives for chaos scenarios.
//!
//! Each [`Injection`] variant represents one failure mode together with its
//! typed parameters.  Injections are immutable once parsed: the executor
//! builds a fresh injector from the directive for every scenario run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of fault an injection simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionType {
    NetworkLatency,
    NetworkPartition,
    DatabaseFailure,
    ServiceUnavailable,
    CpuPressure,
    MemoryPressure,
    ClockSkew,
    ConcurrentRequests,
    RateLimitStorm,
    RateLimit,
    IdempotencyCheck,
}

impl InjectionType {
    /// Every injection type the engine knows about, in declaration order.
    pub const ALL: [InjectionType; 11] = [
        InjectionType::NetworkLatency,
        InjectionType::NetworkPartition,
        InjectionType::DatabaseFailure,
        InjectionType::ServiceUnavailable,
        InjectionType::CpuPressure,
        InjectionType::MemoryPressure,
        InjectionType::ClockSkew,
        InjectionType::ConcurrentRequests,
        InjectionType::RateLimitStorm,
        InjectionType::RateLimit,
        InjectionType::IdempotencyCheck,
    ];

    /// Wire name of this type (`network_latency`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionType::NetworkLatency => "network_latency",
            InjectionType::NetworkPartition => "network_partition",
            InjectionType::DatabaseFailure => "database_failure",
            InjectionType::ServiceUnavailable => "service_unavailable",
            InjectionType::CpuPressure => "cpu_pressure",
            InjectionType::MemoryPressure => "memory_pressure",
            InjectionType::ClockSkew => "clock_skew",
            InjectionType::ConcurrentRequests => "concurrent_requests",
            InjectionType::RateLimitStorm => "rate_limit_storm",
            InjectionType::RateLimit => "rate_limit",
            InjectionType::IdempotencyCheck => "idempotency_check",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for InjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault directive with its type-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Injection {
    NetworkLatency(LatencyConfig),
    NetworkPartition(FailureConfig),
    DatabaseFailure(FailureConfig),
    ServiceUnavailable(FailureConfig),
    CpuPressure(CpuConfig),
    MemoryPressure(MemoryConfig),
    ClockSkew(ClockSkewConfig),
    ConcurrentRequests(ConcurrentConfig),
    RateLimitStorm(RateLimitConfig),
    RateLimit(RateLimitConfig),
    IdempotencyCheck(IdempotencyConfig),
}

impl Injection {
    /// The type of this injection.
    pub fn injection_type(&self) -> InjectionType {
        match self {
            Injection::NetworkLatency(_) => InjectionType::NetworkLatency,
            Injection::NetworkPartition(_) => InjectionType::NetworkPartition,
            Injection::DatabaseFailure(_) => InjectionType::DatabaseFailure,
            Injection::ServiceUnavailable(_) => InjectionType::ServiceUnavailable,
            Injection::CpuPressure(_) => InjectionType::CpuPressure,
            Injection::MemoryPressure(_) => InjectionType::MemoryPressure,
            Injection::ClockSkew(_) => InjectionType::ClockSkew,
            Injection::ConcurrentRequests(_) => InjectionType::ConcurrentRequests,
            Injection::RateLimitStorm(_) => InjectionType::RateLimitStorm,
            Injection::RateLimit(_) => InjectionType::RateLimit,
            Injection::IdempotencyCheck(_) => InjectionType::IdempotencyCheck,
        }
    }

    /// Check parameter ranges.  Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Injection::NetworkLatency(c) => c.validate(),
            Injection::NetworkPartition(c)
            | Injection::DatabaseFailure(c)
            | Injection::ServiceUnavailable(c) => c.validate(),
            Injection::CpuPressure(c) => c.validate(),
            Injection::MemoryPressure(c) => c.validate(),
            Injection::ClockSkew(c) => c.validate(),
            Injection::ConcurrentRequests(c) => c.validate(),
            Injection::RateLimitStorm(c) | Injection::RateLimit(c) => c.validate(),
            Injection::IdempotencyCheck(c) => c.validate(),
        }
    }
}

impl fmt::Display for Injection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Injection::NetworkLatency(c) => write!(
                f,
                "network-latency({:?}, {}ms, max={}ms, p={})",
                c.distribution, c.latency_ms, c.max_latency_ms, c.probability
            ),
            Injection::NetworkPartition(c)
            | Injection::DatabaseFailure(c)
            | Injection::ServiceUnavailable(c) => {
                let attempts = c
                    .fail_attempts
                    .map_or_else(|| "always".to_string(), |n| n.to_string());
                write!(f, "{}(attempts={attempts})", self.injection_type())
            }
            Injection::CpuPressure(c) => {
                write!(f, "cpu-pressure({}%, burst={}ms)", c.percentage, c.burst_ms)
            }
            Injection::MemoryPressure(c) => {
                write!(f, "memory-pressure({}MB in {} steps)", c.target_mb, c.steps)
            }
            Injection::ClockSkew(c) => write!(f, "clock-skew({:?})", c.mode),
            Injection::ConcurrentRequests(c) => {
                write!(f, "concurrent-requests({} {:?})", c.count, c.pattern)
            }
            Injection::RateLimitStorm(c) | Injection::RateLimit(c) => write!(
                f,
                "{}({}/{}ms, {:?})",
                self.injection_type(),
                c.limit,
                c.window_ms,
                c.action
            ),
            Injection::IdempotencyCheck(c) => {
                write!(f, "idempotency-check(window={}ms)", c.window_ms)
            }
        }
    }
}

fn check_probability(name: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{name} must be within 0..=1, got {value}"))
    }
}

// ── Latency ─────────────────────────────────────────────────────

/// Delay distribution for the latency injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyDistribution {
    #[default]
    Fixed,
    Uniform,
    Normal,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub distribution: LatencyDistribution,
    /// Fixed delay, or the mean for normal/exponential.
    pub latency_ms: f64,
    /// Lower bound for the uniform distribution.
    pub min_latency_ms: f64,
    /// Every sample is clamped to `[0, max_latency_ms]`.
    pub max_latency_ms: f64,
    /// Standard deviation for the normal distribution.  Defaults to 20% of
    /// the mean when unset.
    pub std_dev_ms: Option<f64>,
    /// Chance (0..=1) that a given call is delayed at all.
    pub probability: f64,
    /// Operation names that are delayed.  Empty means every operation.
    pub affected_operations: Vec<String>,
    /// Number of samples retained for percentile queries.
    pub max_samples: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            distribution: LatencyDistribution::Fixed,
            latency_ms: 100.0,
            min_latency_ms: 0.0,
            max_latency_ms: 5_000.0,
            std_dev_ms: None,
            probability: 1.0,
            affected_operations: Vec::new(),
            max_samples: 10_000,
        }
    }
}

impl LatencyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.latency_ms < 0.0 || self.min_latency_ms < 0.0 {
            return Err("latency values must be non-negative".into());
        }
        if self.max_latency_ms < self.min_latency_ms {
            return Err(format!(
                "max_latency_ms ({}) is below min_latency_ms ({})",
                self.max_latency_ms, self.min_latency_ms
            ));
        }
        if self.std_dev_ms.is_some_and(|s| s < 0.0) {
            return Err("std_dev_ms must be non-negative".into());
        }
        check_probability("probability", self.probability)
    }

    /// Standard deviation used by the normal distribution.
    pub fn effective_std_dev(&self) -> f64 {
        self.std_dev_ms.unwrap_or(self.latency_ms * 0.2)
    }
}

// ── Network / dependency failures ───────────────────────────────

/// Error shape returned by a failure injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureShape {
    Timeout,
    ConnectionRefused,
    Deadlock,
    Unavailable,
    Partition,
}

impl FailureShape {
    /// Error code surfaced in the failed outcome.
    pub fn code(&self) -> &'static str {
        match self {
            FailureShape::Timeout => "ETIMEDOUT",
            FailureShape::ConnectionRefused => "ECONNREFUSED",
            FailureShape::Deadlock => "DEADLOCK_DETECTED",
            FailureShape::Unavailable => "SERVICE_UNAVAILABLE",
            FailureShape::Partition => "NETWORK_PARTITION",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            FailureShape::Timeout => "operation timed out",
            FailureShape::ConnectionRefused => "connection refused",
            FailureShape::Deadlock => "deadlock detected, transaction rolled back",
            FailureShape::Unavailable => "service unavailable",
            FailureShape::Partition => "network partition: peer unreachable",
        }
    }

    /// Shape used when a declaration does not name one.
    pub fn default_for(injection_type: InjectionType) -> Self {
        match injection_type {
            InjectionType::DatabaseFailure => FailureShape::ConnectionRefused,
            InjectionType::ServiceUnavailable => FailureShape::Unavailable,
            _ => FailureShape::Partition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    /// Error shape.  Defaults by injection type.
    pub error: Option<FailureShape>,
    /// Number of failing attempts before recovering.  `None` never recovers.
    pub fail_attempts: Option<u32>,
    /// Chance (0..=1) that an eligible attempt fails.
    pub failure_rate: f64,
    /// Delay before a timeout surfaces.
    pub timeout_ms: u64,
    /// The failure models an unrecoverable condition and is surfaced to
    /// the executor instead of being returned as an outcome.
    pub fatal: bool,
    pub message: Option<String>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            error: None,
            fail_attempts: None,
            failure_rate: 1.0,
            timeout_ms: 0,
            fatal: false,
            message: None,
        }
    }
}

impl FailureConfig {
    pub fn validate(&self) -> Result<(), String> {
        check_probability("failure_rate", self.failure_rate)
    }
}

// ── CPU pressure ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Share of each burst window spent spinning (1..=100).
    pub percentage: u8,
    pub burst_ms: u64,
    pub yield_ms: u64,
    /// Stop spinning after this long even if still active.
    pub duration_ms: Option<u64>,
    /// Number of spinning threads.
    pub workers: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            percentage: 80,
            burst_ms: 50,
            yield_ms: 10,
            duration_ms: None,
            workers: 1,
        }
    }
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.percentage) {
            return Err(format!(
                "percentage must be within 1..=100, got {}",
                self.percentage
            ));
        }
        if self.burst_ms == 0 {
            return Err("burst_ms must be positive".into());
        }
        if !(1..=64).contains(&self.workers) {
            return Err(format!("workers must be within 1..=64, got {}", self.workers));
        }
        Ok(())
    }

    /// Spin time per burst: `burst_ms * percentage / 100`.
    pub fn spin_micros(&self) -> u64 {
        self.burst_ms * 1000 * u64::from(self.percentage) / 100
    }
}

// ── Memory pressure ─────────────────────────────────────────────

/// Upper bound on ramp-up steps.
pub const MAX_MEMORY_STEPS: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub target_mb: u64,
    /// 1 allocates everything at once; more ramps up incrementally.
    pub steps: u32,
    pub step_delay_ms: u64,
    /// Keep buffers alive until the injector is dropped when false.
    pub release_on_deactivate: bool,
    /// Upper bound accepted for `target_mb`.
    pub max_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            target_mb: 64,
            steps: 1,
            step_delay_ms: 0,
            release_on_deactivate: true,
            max_mb: 1024,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_MEMORY_STEPS).contains(&self.steps) {
            return Err(format!(
                "steps must be within 1..={MAX_MEMORY_STEPS}, got {}",
                self.steps
            ));
        }
        if self.target_mb > self.max_mb {
            return Err(format!(
                "target_mb ({}) exceeds max_mb ({})",
                self.target_mb, self.max_mb
            ));
        }
        Ok(())
    }
}

// ── Clock skew ──────────────────────────────────────────────────

/// Largest skew magnitude accepted: one year.
pub const MAX_SKEW_MS: i64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSkewMode {
    /// Constant offset.
    #[default]
    Fixed,
    /// Offset grows linearly with time.
    Drift,
    /// Offset jumps once after a delay.
    Jump,
    /// Offset follows a sine wave.
    Oscillate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSkewConfig {
    pub mode: ClockSkewMode,
    /// Fixed offset, or the jump delta.
    pub offset_ms: i64,
    pub drift_ms_per_sec: f64,
    pub jump_after_ms: u64,
    pub amplitude_ms: i64,
    pub period_ms: u64,
}

impl Default for ClockSkewConfig {
    fn default() -> Self {
        Self {
            mode: ClockSkewMode::Fixed,
            offset_ms: 0,
            drift_ms_per_sec: 0.0,
            jump_after_ms: 0,
            amplitude_ms: 0,
            period_ms: 1_000,
        }
    }
}

impl ClockSkewConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.mode == ClockSkewMode::Oscillate && self.period_ms == 0 {
            return Err("oscillating skew requires a positive period_ms".into());
        }
        if !self.drift_ms_per_sec.is_finite() {
            return Err("drift_ms_per_sec must be finite".into());
        }
        for (field, value) in [("offset_ms", self.offset_ms), ("amplitude_ms", self.amplitude_ms)] {
            if !(-MAX_SKEW_MS..=MAX_SKEW_MS).contains(&value) {
                return Err(format!("{field} must be within ±{MAX_SKEW_MS}, got {value}"));
            }
        }
        Ok(())
    }
}

// ── Concurrent requests ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPattern {
    #[default]
    AllAtOnce,
    Staggered,
    Burst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentConfig {
    pub count: usize,
    pub pattern: ConcurrencyPattern,
    /// Delay between call starts for the staggered pattern.
    pub stagger_ms: u64,
    pub burst_size: usize,
    pub burst_pause_ms: u64,
    /// JSON pointer into result data whose values must be distinct.
    pub unique_field: Option<String>,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            count: 5,
            pattern: ConcurrencyPattern::AllAtOnce,
            stagger_ms: 0,
            burst_size: 2,
            burst_pause_ms: 0,
            unique_field: None,
        }
    }
}

impl ConcurrentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=1024).contains(&self.count) {
            return Err(format!("count must be within 1..=1024, got {}", self.count));
        }
        if self.pattern == ConcurrencyPattern::Burst && self.burst_size == 0 {
            return Err("burst pattern requires a positive burst_size".into());
        }
        if let Some(field) = &self.unique_field {
            if !field.is_empty() && !field.starts_with('/') {
                return Err(format!("unique_field must be a JSON pointer, got {field:?}"));
            }
        }
        Ok(())
    }
}

// ── Rate limiting ───────────────────────────────────────────────

/// What the limiter does with a request beyond its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    #[default]
    Reject,
    Throttle,
    Redirect,
    DeadLetter,
}

impl RateLimitAction {
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitAction::Reject => "RATE_LIMITED",
            RateLimitAction::Throttle => "THROTTLED",
            RateLimitAction::Redirect => "RATE_LIMIT_REDIRECTED",
            RateLimitAction::DeadLetter => "DEAD_LETTERED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub limit: u32,
    pub window_ms: u64,
    pub action: RateLimitAction,
    /// JSON pointer into the request input used as the partition key.
    pub key: Option<String>,
    /// Synthetic requests fired at activation (storm only).  Zero means
    /// twice the limit.
    pub storm_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window_ms: 1_000,
            action: RateLimitAction::Reject,
            key: None,
            storm_requests: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.window_ms == 0 {
            return Err("window_ms must be positive".into());
        }
        if let Some(key) = &self.key {
            if !key.is_empty() && !key.starts_with('/') {
                return Err(format!("key must be a JSON pointer, got {key:?}"));
            }
        }
        Ok(())
    }

    pub fn effective_storm_requests(&self) -> u32 {
        if self.storm_requests == 0 {
            self.limit.saturating_mul(2)
        } else {
            self.storm_requests
        }
    }
}

// ── Idempotency ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Duplicates are flagged when seen again within this window.
    pub window_ms: u64,
    /// Number of times each request is sent.
    pub replays: u32,
    /// JSON pointers forming the key.  Empty keys on the whole input.
    pub key_fields: Vec<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            replays: 2,
            key_fields: Vec::new(),
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.replays == 0 {
            return Err("replays must be at least 1".into());
        }
        if let Some(bad) = self.key_fields.iter().find(|f| !f.starts_with('/')) {
            return Err(format!("key_fields must be JSON pointers, got {bad:?}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_type_round_trips_wire_names() {
        for t in InjectionType::ALL {
            assert_eq!(InjectionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(InjectionType::parse("disk_full"), None);
    }

    #[test]
    fn injection_deserializes_with_defaults() {
        let inj: Injection = serde_json::from_value(serde_json::json!({
            "type": "network_latency",
            "distribution": "normal",
            "latency_ms": 100.0
        }))
        .unwrap();
        match &inj {
            Injection::NetworkLatency(c) => {
                assert_eq!(c.distribution, LatencyDistribution::Normal);
                assert_eq!(c.probability, 1.0);
                assert_eq!(c.effective_std_dev(), 20.0);
            }
            other => panic!("unexpected injection {other:?}"),
        }
        assert_eq!(inj.injection_type(), InjectionType::NetworkLatency);
        assert!(inj.validate().is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_parameters() {
        let latency = Injection::NetworkLatency(LatencyConfig {
            probability: 1.5,
            ..Default::default()
        });
        assert!(latency.validate().is_err());

        let cpu = Injection::CpuPressure(CpuConfig {
            percentage: 0,
            ..Default::default()
        });
        assert!(cpu.validate().is_err());

        let memory = Injection::MemoryPressure(MemoryConfig {
            target_mb: 4096,
            ..Default::default()
        });
        assert!(memory.validate().is_err());

        let idem = Injection::IdempotencyCheck(IdempotencyConfig {
            key_fields: vec!["email".into()],
            ..Default::default()
        });
        assert!(idem.validate().is_err());
    }

    #[test]
    fn cpu_spin_time_is_burst_times_percentage() {
        let cfg = CpuConfig {
            percentage: 25,
            burst_ms: 40,
            ..Default::default()
        };
        assert_eq!(cfg.spin_micros(), 10_000);
    }

    #[test]
    fn failure_shape_defaults_by_type() {
        assert_eq!(
            FailureShape::default_for(InjectionType::DatabaseFailure),
            FailureShape::ConnectionRefused
        );
        assert_eq!(
            FailureShape::default_for(InjectionType::ServiceUnavailable).code(),
            "SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn storm_requests_default_to_twice_the_limit() {
        let cfg = RateLimitConfig {
            limit: 7,
            ..Default::default()
        };
        assert_eq!(cfg.effective_storm_requests(), 14);
    }

    #[test]
    fn memory_steps_are_bounded() {
        let huge = MemoryConfig {
            target_mb: 1,
            steps: 4_000_000_000,
            ..Default::default()
        };
        assert!(huge.validate().unwrap_err().contains("steps"));
        let ramp = MemoryConfig {
            steps: MAX_MEMORY_STEPS,
            ..Default::default()
        };
        assert!(ramp.validate().is_ok());
    }

    #[test]
    fn clock_skew_magnitude_is_bounded() {
        let extreme = ClockSkewConfig {
            offset_ms: i64::MIN,
            ..Default::default()
        };
        assert!(extreme.validate().unwrap_err().contains("offset_ms"));
        let wide = ClockSkewConfig {
            mode: ClockSkewMode::Oscillate,
            amplitude_ms: i64::MAX,
            ..Default::default()
        };
        assert!(wide.validate().unwrap_err().contains("amplitude_ms"));
        let day = ClockSkewConfig {
            offset_ms: -86_400_000,
            ..Default::default()
        };
        assert!(day.validate().is_ok());
    }

    #[test]
    fn injection_display() {
        let inj = Injection::MemoryPressure(MemoryConfig {
            target_mb: 8,
            steps: 4,
            ..Default::default()
        });
        assert_eq!(inj.to_string(), "memory-pressure(8MB in 4 steps)");
    }
}

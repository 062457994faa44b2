//! Fault injectors, timeline and scenario model for ISL chaos verification.
//!
//! This crate is the leaf of the chaos engine.  It provides:
//!
//! 1. **[`faults`]**: Injection directives (latency, partitions, resource
//!    pressure, clock skew, concurrency, rate limiting, idempotency)
//! 2. **[`injectors`]**: Independently-stateful fault models that simulate
//!    each directive at the call boundary of the behavior under test
//! 3. **[`timeline`]**: Append-only, time-ordered event log of one run
//! 4. **[`scenario`]**: Validated "inject X, then assert Y" definitions and
//!    the plan compiler that turns them into executable step sequences
//! 5. **[`oracle`]**: Assertion evaluation over the final run state
//!
//! # Architecture
//!
//! ```text
//! Executor                  Injectors                  Timeline
//! ────────                  ─────────                  ────────
//! activate()          ──→ reset + background loop ──→ injection_start
//! call behavior       ──→ intercept()/observe()    ──→ recovery / error
//! deactivate()        ──→ cancel + release         ──→ injection_end
//! ```

pub mod behavior;
pub mod cancel;
pub mod canonical;
pub mod clock;
pub mod faults;
pub mod injectors;
pub mod oracle;
pub mod scenario;
pub mod timeline;

pub use behavior::{BehaviorError, BehaviorImpl, BehaviorOutcome, CallContext, CallRecord};
pub use faults::{Injection, InjectionType};
pub use injectors::{build_injector, Injector, InjectorState};
pub use oracle::{AssertionOracle, AssertionResult, AssertionSubject};
pub use scenario::{Assertion, ChaosScenario, ScenarioBuilder, ScenarioError, Step};
pub use timeline::{Timeline, TimelineEvent, TimelineEventType};

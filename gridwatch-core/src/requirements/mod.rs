//! Requirement engine
//!
//! A requirement check is a strategy evaluated against one input type: a
//! [`Topology`](crate::topology::Topology) for the local scope, a
//! [`NeighborhoodView`] per border region and a [`SensorView`] per NM cycle
//! for the neighborhood scope. Engines are ordered lists of boxed checks built
//! from a deployment profile (see [`profile`]).
//!
//! Checks never fail. Components without a live value are skipped for the
//! cycle; only an observed breach produces a [`Violation`].

pub mod domain;
pub mod local;
pub mod neighborhood;
pub mod profile;

pub use neighborhood::{NeighborhoodView, SensorView, SideSnapshot};
pub use profile::{
    local_engine, neighborhood_engine, CheckParams, NeighborhoodEngine, DEFAULT_PROFILE,
};

use crate::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Numeric requirement identifier carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(pub i32);

impl RequirementId {
    pub const BUS_CURRENT_BALANCE: Self = Self(1);
    pub const BUS_VOLTAGE_CONSISTENCY: Self = Self(2);
    pub const OPEN_SWITCH_ZERO_CURRENT: Self = Self(3);
    pub const LINE_UNIFORMITY: Self = Self(4);
    pub const SAFETY_CURRENT: Self = Self(7);
    pub const SAFETY_VOLTAGE: Self = Self(8);
    pub const BATTERY_STATE_OF_CHARGE: Self = Self(9);
    pub const FEED_IN_GENERATORS: Self = Self(10);
    pub const SOLAR_SANITY: Self = Self(11);
    pub const TRANSFORMER_CURRENT: Self = Self(12);
    pub const HARMONIC_DISTORTION: Self = Self(13);
    pub const TRANSFORMER_VOLTAGE: Self = Self(14);
    pub const BATTERY_RATE: Self = Self(15);
    pub const COIL_RATIO: Self = Self(20);
    pub const TAP_POSITION: Self = Self(21);
    pub const CABLE_ENDS: Self = Self(22);
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REQ{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub requirement: RequirementId,
    pub component_id: String,
    pub timestamp: OffsetDateTime,
}

impl Violation {
    pub fn new(requirement: RequirementId, component_id: impl Into<String>) -> Self {
        Self {
            requirement,
            component_id: component_id.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub trait Check<I>: Send {
    fn id(&self) -> RequirementId;
    fn name(&self) -> &'static str;
    fn evaluate(&mut self, input: &I) -> Vec<Violation>;
}

/// Adapts a closure into a [`Check`].
pub struct FnCheck<F> {
    id: RequirementId,
    name: &'static str,
    f: F,
}

impl<F> FnCheck<F> {
    pub fn new(id: RequirementId, name: &'static str, f: F) -> Self {
        Self { id, name, f }
    }
}

impl<I, F> Check<I> for FnCheck<F>
where
    F: FnMut(&I) -> Vec<Violation> + Send,
{
    fn id(&self) -> RequirementId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn evaluate(&mut self, input: &I) -> Vec<Violation> {
        (self.f)(input)
    }
}

pub struct RequirementEngine<I> {
    checks: Vec<Box<dyn Check<I>>>,
}

impl<I> Default for RequirementEngine<I> {
    fn default() -> Self {
        Self { checks: Vec::new() }
    }
}

impl<I> RequirementEngine<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, check: impl Check<I> + 'static) -> Self {
        self.push(Box::new(check));
        self
    }

    pub fn push(&mut self, check: Box<dyn Check<I>>) {
        self.checks.push(check);
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs every check in order and returns all violations found.
    pub fn evaluate(&mut self, input: &I) -> Vec<Violation> {
        let mut found = Vec::new();
        for check in &mut self.checks {
            let violations = check.evaluate(input);
            if !violations.is_empty() {
                let count = violations.len();
                tracing::debug!(check = check.name(), count, "requirement violated");
            }
            found.extend(violations);
        }
        found
    }

    /// Same as [`evaluate`](Self::evaluate) but enqueues the result. Returns the count.
    pub fn evaluate_into(&mut self, input: &I, queue: &mut BoundedQueue<Violation>) -> usize {
        let violations = self.evaluate(input);
        let count = violations.len();
        for violation in violations {
            queue.push(violation);
        }
        count
    }
}

const EPSILON: f64 = 1e-9;

/// `value` lies within `tolerance` of `reference`, bounds included.
pub(crate) fn within(value: f64, reference: f64, tolerance: f64) -> bool {
    (value - reference).abs() <= tolerance + EPSILON
}

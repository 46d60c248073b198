//! Error taxonomy for planning.
//!
//! Every failure the planner can surface is a [`PlanningError`]. Generators
//! signal "try another strategy" with [`Outcome::NotFound`]; only the
//! top-level entry point turns a final miss into
//! [`PlanningError::Unresolvable`].

use std::fmt;

/// Errors raised while building the reference graph, planning, or optimizing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    #[error("Could not resolve connections between [{}]", .concepts.join(", "))]
    Unresolvable { concepts: Vec<String> },

    #[error(
        "Ambiguous join path for [{}]: multiple bridging concept sets {}",
        .targets.join(", "),
        format_candidates(.candidates)
    )]
    Ambiguous {
        targets: Vec<String>,
        candidates: Vec<Vec<String>>,
    },

    #[error("Concept {address} references itself through its lineage")]
    SelfReference { address: String },

    #[error("Unresolvable join order: {left} and {right} each require the other first")]
    JoinOrder { left: String, right: String },

    #[error("Condition mismatch: have {have}, need {need}")]
    ConditionMismatch { have: String, need: String },

    #[error("{stage} did not converge within {limit} iterations")]
    IterationLimit { stage: String, limit: usize },

    #[error("Plan node {node} would become its own ancestor")]
    CyclicPlan { node: String },

    #[error("Search depth exceeded limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("Undefined concept: {0}")]
    UndefinedConcept(String),

    #[error("Concept {concept} has invalid pseudonym {pseudonym}")]
    InvalidPseudonym { concept: String, pseudonym: String },

    #[error("Unknown datasource: {0}")]
    UnknownDatasource(String),

    #[error("Invalid lineage for {address}: {reason}")]
    InvalidLineage { address: String, reason: String },
}

fn format_candidates(candidates: &[Vec<String>]) -> String {
    candidates
        .iter()
        .map(|set| format!("{{{}}}", set.join(", ")))
        .collect::<Vec<_>>()
        .join(" vs ")
}

/// Result type for planning operations.
pub type PlanningResult<T> = Result<T, PlanningError>;

/// Outcome of a generator or search attempt.
///
/// `NotFound` is a local miss the caller may recover from by trying another
/// strategy. `Invalid` carries an error that must never be downgraded to a
/// miss (ambiguity, self-reference, condition mismatch).
#[derive(Debug)]
pub enum Outcome<T> {
    Found(T),
    NotFound,
    Invalid(PlanningError),
}

impl<T> Outcome<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Outcome::Found(_))
    }

    /// Convert into a `Result` so callers can propagate errors with `?`.
    pub fn into_result(self) -> PlanningResult<Option<T>> {
        match self {
            Outcome::Found(value) => Ok(Some(value)),
            Outcome::NotFound => Ok(None),
            Outcome::Invalid(err) => Err(err),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Found(value) => Outcome::Found(f(value)),
            Outcome::NotFound => Outcome::NotFound,
            Outcome::Invalid(err) => Outcome::Invalid(err),
        }
    }
}

impl<T> From<PlanningResult<Option<T>>> for Outcome<T> {
    fn from(result: PlanningResult<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Outcome::Found(value),
            Ok(None) => Outcome::NotFound,
            Err(err) => Outcome::Invalid(err),
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Found(value) => write!(f, "found {:?}", value),
            Outcome::NotFound => write!(f, "not found"),
            Outcome::Invalid(err) => write!(f, "invalid: {}", err),
        }
    }
}

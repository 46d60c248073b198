//! Concept discovery: pick order, companion selection, the search loop and
//! stack validation.

mod candidates;
mod priority;
mod search;
mod validation;

pub use candidates::generate_candidates_restrictive;
pub use priority::{get_priority_concept, get_upstream_concepts, PriorityTier};
pub use search::{plan_query, PlannedQuery, Planner};
pub use validation::{validate_stack, StackCoverage, ValidationResult};

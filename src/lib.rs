//! # Strata
//!
//! Query planning for a semantic layer: given named concepts and the
//! datasources that bind them, find a tree of relational steps that
//! produces the requested concepts at the right grain.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │      Environment (concepts, datasources, lineage)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [graph builder]
//! ┌─────────────────────────────────────────────────────────┐
//! │      ReferenceGraph (concept / datasource nodes)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [discovery + generators]
//! ┌─────────────────────────────────────────────────────────┐
//! │      PlanNode arena ──resolve──▶ ResolvedDatasource      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [lower_plan + optimizer]
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CtePlan                                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod generators;
pub mod graph;
pub mod model;
pub mod optimizer;
pub mod plan;

pub use error::{Outcome, PlanningError, PlanningResult};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{OptimizerConfig, PlannerSettings, Settings};
    pub use crate::discovery::{plan_query, PlannedQuery, Planner};
    pub use crate::error::{Outcome, PlanningError, PlanningResult};
    pub use crate::model::{
        AggregateOp, Column, ComparisonOp, Concept, Condition, DataType, Datasource,
        Derivation, Environment, EnvironmentFile, Expr, Grain, Literal,
    };
    pub use crate::optimizer::{lower_plan, optimize_ctes, Cte, CtePlan};
    pub use crate::plan::{PlanArena, PlanId, PlanNode, ResolvedDatasource};
}

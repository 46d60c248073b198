//! Semantic model: concepts, grains, conditions, datasources.
//!
//! These are value types. Everything here is produced by declaration
//! processing and read by the planner.

pub mod concept;
pub mod datasource;
pub mod declaration;
pub mod environment;
pub mod expr;
pub mod grain;

pub use concept::{
    qualify, AggregateItem, AlignItem, Concept, DataType, Derivation, FilterItem, Function,
    Granularity, Lineage, MultiselectItem, OrderItem, Purpose, RowsetItem, SelectLineage,
    UnionItem, WindowItem, WindowKind, DEFAULT_NAMESPACE,
};
pub use datasource::{Column, Datasource};
pub use declaration::{Declaration, EnvironmentFile, QuerySpec};
pub use environment::Environment;
pub use expr::{AggregateOp, ComparisonOp, Condition, Expr, FunctionOp, Literal};
pub use grain::Grain;

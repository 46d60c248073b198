//! Plan nodes, their arena, and resolution into concrete datasources.
//!
//! ```text
//!   PlanNode (arena, by PlanId) --resolve--> ResolvedDatasource
//!        parents by id                        children by Rc
//! ```

mod arena;
pub mod grouping;
mod history;
pub mod joins;
mod node;
mod resolve;
mod resolved;

pub use arena::PlanArena;
pub use grouping::{check_if_group_required, effective_parent_grain, GroupRequired};
pub use history::{History, SearchKey};
pub use joins::{concept_to_relevant_joins, find_nullable_concepts, get_node_joins, resolve_join_order};
pub use node::{MergeNode, NodeCore, NodeJoin, PlanId, PlanNode, SelectNode, UnnestNode};
pub use resolve::resolve_concept_map;
pub use resolved::{
    build_identifier, BaseJoin, ConceptPair, JoinType, ResolvedDatasource, ResolvedJoin,
    ResolvedSource, SourceType, UnnestJoin,
};

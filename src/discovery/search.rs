//! The discovery loop: source a set of concepts into one plan node.
//!
//! ```text
//!   search_concepts ──history hit──▶ copy of cached node
//!        │
//!        ▼
//!   loop: priority concept ─▶ generate_node ─▶ stack ─▶ validate_stack
//!        │                                              │
//!        │◀──────────── incomplete ─────────────────────┘
//!        ▼
//!   complete: single node or Merge over the stack, condition applied
//! ```

use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use crate::config::PlannerSettings;
use crate::error::{Outcome, PlanningError, PlanningResult};
use crate::generators::{addresses, generate_node, is_root_or_constant, unique};
use crate::graph::ReferenceGraph;
use crate::model::{Concept, Condition, Derivation, Environment, Granularity};
use crate::plan::{
    check_if_group_required, History, NodeCore, PlanArena, PlanId, PlanNode, ResolvedSource,
    SearchKey,
};

use super::candidates::generate_candidates_restrictive;
use super::priority::get_priority_concept;
use super::validation::{validate_stack, ValidationResult};

/// Derivations that are only ever sourced once per loop; a second attempt
/// would operate on a subset of their inputs.
const SOURCED_ONCE: [Derivation; 8] = [
    Derivation::Aggregate,
    Derivation::Filter,
    Derivation::Window,
    Derivation::Unnest,
    Derivation::Rowset,
    Derivation::Basic,
    Derivation::Multiselect,
    Derivation::Union,
];

// ============================================================================
// Planner
// ============================================================================

/// State of one planning pass: the arena, the reference graph, and the
/// History memo. Nothing here is shared between passes.
#[derive(Debug)]
pub struct Planner {
    pub(crate) arena: PlanArena,
    pub(crate) graph: ReferenceGraph,
    pub(crate) history: History,
    pub(crate) settings: PlannerSettings,
    environment: Rc<Environment>,
}

impl Planner {
    /// Build the reference graph for `environment` and an empty arena.
    pub fn new(environment: Rc<Environment>, settings: PlannerSettings) -> PlanningResult<Self> {
        let graph = ReferenceGraph::from_environment(&environment)?;
        Ok(Self {
            arena: PlanArena::new(Rc::clone(&environment)),
            graph,
            history: History::new(),
            settings,
            environment,
        })
    }

    /// Shared handle to the environment, usable while the planner is
    /// mutably borrowed.
    pub fn environment(&self) -> Rc<Environment> {
        Rc::clone(&self.environment)
    }

    pub fn arena(&self) -> &PlanArena {
        &self.arena
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    pub fn into_arena(self) -> PlanArena {
        self.arena
    }

    /// Source `mandatory` into one node.
    ///
    /// Repeated searches are answered from History with a fresh copy of
    /// the stored node, including remembered misses.
    pub fn search_concepts(
        &mut self,
        mandatory: &[Concept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&Condition>,
    ) -> Outcome<PlanId> {
        self.search(mandatory, depth, accept_partial, conditions).into()
    }

    /// [`Planner::search_concepts`] as a `Result`, for generators.
    pub(crate) fn search(
        &mut self,
        mandatory: &[Concept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&Condition>,
    ) -> PlanningResult<Option<PlanId>> {
        if depth > self.settings.max_depth {
            return Err(PlanningError::DepthExceeded {
                limit: self.settings.max_depth,
            });
        }
        let key = SearchKey::new(&addresses(mandatory), accept_partial, conditions);
        if let Some(hit) = self.history.get_history(&mut self.arena, &key) {
            trace!(depth, concepts = ?key, found = hit.is_some(), "search answered from history");
            return Ok(hit);
        }
        let result = self.search_inner(mandatory, depth, accept_partial, conditions)?;
        self.history
            .search_to_history(&mut self.arena, key, result);
        Ok(result)
    }

    fn search_inner(
        &mut self,
        mandatory: &[Concept],
        depth: usize,
        accept_partial: bool,
        conditions: Option<&Condition>,
    ) -> PlanningResult<Option<PlanId>> {
        let env = self.environment();
        let mut mandatory = unique(mandatory.to_vec());
        let all_mandatory: BTreeSet<String> = mandatory.iter().map(|c| c.address.clone()).collect();
        let row_args: BTreeSet<String> = conditions
            .map(|c| c.row_arguments().into_iter().collect())
            .unwrap_or_default();

        let mut must_evaluate = false;
        let completion_mandatory = match conditions {
            Some(condition) => {
                let mut completion = mandatory.clone();
                completion.extend(env.concepts_for(&condition.row_arguments())?);
                let completion = unique(completion);
                // a derived concept the condition reads must be computed
                // here, so the condition cannot be pushed down
                must_evaluate = mandatory.iter().any(|c| {
                    !is_root_or_constant(c)
                        && !(c.derivation == Derivation::Aggregate
                            && c.granularity == Granularity::SingleRow)
                        && row_args.contains(&c.address)
                });
                if must_evaluate {
                    debug!(depth, "derived condition inputs requested, evaluating condition at this level");
                    mandatory = completion.clone();
                }
                completion
            }
            None => mandatory.clone(),
        };

        let mut attempted: BTreeSet<String> = BTreeSet::new();
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut skip: BTreeSet<String> = BTreeSet::new();
        let mut virtual_outputs: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<PlanId> = Vec::new();
        let mut complete = ValidationResult::Incomplete;

        while attempted != all_mandatory {
            let Some(priority) = get_priority_concept(&env, &mandatory, &attempted, &found) else {
                break;
            };

            let should_evaluate = match conditions {
                None => true,
                Some(_) => {
                    let mandatory_addresses: BTreeSet<&String> =
                        mandatory.iter().map(|c| &c.address).collect();
                    row_args.iter().all(|a| mandatory_addresses.contains(a))
                        && !mandatory
                            .iter()
                            .any(|c| !is_root_or_constant(c) && !row_args.contains(&c.address))
                }
            };
            let mut local_conditions = if !must_evaluate && !should_evaluate {
                conditions
            } else {
                None
            };
            // filter before anything complex that is not itself a filter input
            if conditions.is_some()
                && !is_root_or_constant(&priority)
                && !row_args.contains(&priority.address)
            {
                local_conditions = conditions;
            }

            let candidates: Vec<Concept> = mandatory
                .iter()
                .filter(|c| c.address != priority.address)
                .cloned()
                .collect();
            let optional =
                generate_candidates_restrictive(&env, &priority, &candidates, &skip, conditions)?;
            debug!(
                depth,
                concept = %priority.address,
                derivation = %priority.derivation,
                optional = ?addresses(&optional),
                accept_partial,
                conditions = ?local_conditions.map(|c| c.to_string()),
                "sourcing priority concept"
            );

            let generated = generate_node(
                self,
                &priority,
                &optional,
                depth,
                accept_partial,
                local_conditions,
            )
            .into_result()?;
            if let Some(node) = generated {
                self.arena.resolve(node)?;
                stack.push(node);
                if SOURCED_ONCE.contains(&priority.derivation) {
                    skip.insert(priority.address.clone());
                }
            }
            attempted.insert(priority.address.clone());

            let (result, coverage) = validate_stack(
                &self.arena,
                &stack,
                &mandatory,
                &completion_mandatory,
                conditions,
                accept_partial,
            )?;
            complete = result;
            found = coverage.found;
            virtual_outputs = coverage.virtual_outputs;
            debug!(
                depth,
                concept = %priority.address,
                result = ?complete,
                missing = ?coverage.missing,
                partial = ?coverage.partial,
                stack = stack.len(),
                "finished concept loop"
            );

            if complete == ValidationResult::IncompleteCondition {
                let have: Vec<String> = stack
                    .iter()
                    .map(|n| {
                        self.arena
                            .core(*n)
                            .preexisting_conditions
                            .as_ref()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string())
                    })
                    .collect();
                return Err(PlanningError::ConditionMismatch {
                    have: have.join("; "),
                    need: conditions.map(|c| c.to_string()).unwrap_or_default(),
                });
            }
            if complete == ValidationResult::Complete
                && (!accept_partial || coverage.partial.is_empty())
            {
                break;
            }
            if priority.derivation == Derivation::Root {
                trace!(depth, "attempted a root with no further progress possible");
                break;
            }
        }

        if complete == ValidationResult::Complete && !stack.is_empty() {
            let output = self.finish_stack(
                &stack,
                &mandatory,
                &completion_mandatory,
                &virtual_outputs,
                depth,
                conditions,
            )?;
            return Ok(Some(output));
        }

        if !accept_partial && self.settings.partial_retry {
            warn!(
                depth,
                concepts = ?addresses(&mandatory),
                result = ?complete,
                "retrying search with partial sources accepted"
            );
            return self.search(&mandatory, depth, true, conditions);
        }
        debug!(
            depth,
            concepts = ?addresses(&mandatory),
            missing = ?all_mandatory.difference(&found).collect::<Vec<_>>(),
            "could not resolve concepts"
        );
        Ok(None)
    }

    /// Collapse a complete stack into one node and apply the condition if no
    /// parent already did.
    fn finish_stack(
        &mut self,
        stack: &[PlanId],
        mandatory: &[Concept],
        completion_mandatory: &[Concept],
        virtual_outputs: &BTreeSet<String>,
        depth: usize,
        conditions: Option<&Condition>,
    ) -> PlanningResult<PlanId> {
        let condition_required = conditions.is_some_and(|condition| {
            !stack
                .iter()
                .all(|n| self.arena.core(*n).preexisting_conditions.as_ref() == Some(condition))
        });
        let basis = if condition_required {
            completion_mandatory
        } else {
            mandatory
        };
        let non_virtual: Vec<String> = basis
            .iter()
            .filter(|c| !virtual_outputs.contains(&c.address))
            .map(|c| c.address.clone())
            .collect();

        let output = match stack {
            [single] => *single,
            _ => self.arena.insert(PlanNode::merge(
                NodeCore::new(non_virtual.clone(), non_virtual)
                    .with_parents(stack.to_vec())
                    .with_depth(depth),
                None,
            )),
        };
        self.arena.resolve(output)?;

        match conditions {
            Some(condition) if condition_required => {
                self.arena.add_condition(output, condition.clone());
                self.append_existence_check(output, condition)?;
            }
            Some(condition) => {
                trace!(depth, "condition already applied by every parent");
                self.arena
                    .set_preexisting_conditions(output, Some(condition.clone()));
            }
            None => {}
        }
        debug!(depth, node = %output, "stack is connected");
        Ok(output)
    }

    /// Source existence-subquery inputs the node does not already read and
    /// attach them as extra parents.
    fn append_existence_check(&mut self, node: PlanId, condition: &Condition) -> PlanningResult<()> {
        let env = self.environment();
        for address in condition.existence_arguments() {
            if self.arena.core(node).input_concepts.contains(&address) {
                trace!(concept = %address, "existence inputs already present");
                continue;
            }
            let concepts = env.concepts_for(&[address.clone()])?;
            let parent = self.source_query_concepts(&concepts, None)?;
            self.arena.add_parents(node, &[parent])?;
            self.arena.add_existence_concepts(node, &[address]);
        }
        Ok(())
    }

    /// Top-level entry: source `outputs`, failing with `Unresolvable` when no
    /// plan exists, and group the result if its grain is finer than the
    /// outputs'.
    pub fn source_query_concepts(
        &mut self,
        outputs: &[Concept],
        conditions: Option<&Condition>,
    ) -> PlanningResult<PlanId> {
        self.source_at_depth(outputs, 0, conditions)?
            .ok_or_else(|| PlanningError::Unresolvable {
                concepts: addresses(outputs),
            })
    }

    /// [`Planner::source_query_concepts`] for an inner select planned
    /// `depth` levels down; a miss is `None`.
    pub(crate) fn source_at_depth(
        &mut self,
        outputs: &[Concept],
        depth: usize,
        conditions: Option<&Condition>,
    ) -> PlanningResult<Option<PlanId>> {
        if outputs.is_empty() {
            return Ok(None);
        }
        let Some(root) = self.search(outputs, depth, false, conditions)? else {
            return Ok(None);
        };

        let env = self.environment();
        let final_outputs = self.arena.core(root).usable_outputs();
        let resolved = self.arena.resolve(root)?;
        let check =
            check_if_group_required(&env, &final_outputs, &[ResolvedSource::Query(resolved)])?;
        if !check.required {
            return Ok(Some(root));
        }
        debug!(upstream = %check.upstream, target = %check.target, "grouping final outputs");
        let partial = self.arena.core(root).partial_concepts.clone();
        let group = self.arena.insert(PlanNode::Group(
            NodeCore::new(final_outputs.clone(), final_outputs)
                .with_parents(vec![root])
                .with_depth(depth)
                .with_partial(partial),
        ));
        self.arena.resolve(group)?;
        Ok(Some(group))
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// A planned query: the arena holding every node and the root to render.
#[derive(Debug)]
pub struct PlannedQuery {
    pub arena: PlanArena,
    pub root: PlanId,
}

impl PlannedQuery {
    pub fn explain(&self) -> String {
        self.arena.explain(self.root)
    }
}

/// Plan `select` under an optional row condition.
///
/// Concepts outside `select` that the plan carries (condition inputs,
/// bridge keys) are hidden on the root.
pub fn plan_query<S: AsRef<str>>(
    environment: &Environment,
    select: &[S],
    condition: Option<&Condition>,
    settings: &PlannerSettings,
) -> PlanningResult<PlannedQuery> {
    let scoped = Rc::new(environment.with_select_context(select)?);
    let outputs = scoped.concepts_for(select)?;
    let mut planner = Planner::new(scoped, settings.clone())?;
    let root = planner.source_query_concepts(&outputs, condition)?;

    let requested: BTreeSet<&str> = outputs.iter().map(|c| c.address.as_str()).collect();
    let extra: Vec<String> = planner
        .arena
        .core(root)
        .usable_outputs()
        .into_iter()
        .filter(|c| !requested.contains(c.as_str()))
        .collect();
    if !extra.is_empty() {
        planner.arena.hide_output_concepts(root, &extra);
    }
    planner.arena.resolve(root)?;
    info!(
        root = %root,
        nodes = planner.arena.len(),
        concepts = ?addresses(&outputs),
        "planned query"
    );
    Ok(PlannedQuery {
        arena: planner.into_arena(),
        root,
    })
}

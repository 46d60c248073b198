//! The concept/datasource universe a query is planned against.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{PlanningError, PlanningResult};

use super::concept::{
    qualify, AggregateItem, AlignItem, Concept, DataType, Derivation, Granularity, Lineage,
    MultiselectItem, Purpose, RowsetItem, SelectLineage,
};
use super::datasource::Datasource;
use super::expr::{AggregateOp, Expr, FunctionOp, Literal};
use super::grain::Grain;

/// Address → concept and identifier → datasource maps.
///
/// Read-only during a planning pass. Declarations go through the `add_*`
/// helpers, which derive purpose, grain and granularity from lineage.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub concepts: BTreeMap<String, Concept>,
    pub datasources: BTreeMap<String, Datasource>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concept(&self, address: &str) -> PlanningResult<&Concept> {
        self.concepts
            .get(address)
            .ok_or_else(|| PlanningError::UndefinedConcept(address.to_string()))
    }

    /// Look up several concepts, preserving order and dropping duplicates.
    pub fn concepts_for<S: AsRef<str>>(&self, addresses: &[S]) -> PlanningResult<Vec<Concept>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            let address = address.as_ref();
            if seen.insert(address.to_string()) {
                out.push(self.concept(address)?.clone());
            }
        }
        Ok(out)
    }

    pub fn datasource(&self, identifier: &str) -> PlanningResult<&Datasource> {
        self.datasources
            .get(identifier)
            .ok_or_else(|| PlanningError::UnknownDatasource(identifier.to_string()))
    }

    pub fn add_concept(&mut self, concept: Concept) -> String {
        let address = concept.address.clone();
        self.concepts.insert(address.clone(), concept);
        address
    }

    pub fn add_key(&mut self, name: &str, datatype: DataType) -> String {
        self.add_concept(Concept::key(name, datatype))
    }

    pub fn add_property(&mut self, name: &str, datatype: DataType, keys: &[&str]) -> String {
        self.add_concept(Concept::property(name, datatype, keys.iter().copied()))
    }

    pub fn add_constant(&mut self, name: &str, datatype: DataType, value: Literal) -> String {
        self.add_concept(Concept::constant(name, datatype, value))
    }

    /// Declare a derived concept, computing its purpose, grain and
    /// granularity from the lineage arguments.
    pub fn add_derived(
        &mut self,
        name: &str,
        datatype: DataType,
        lineage: Lineage,
    ) -> PlanningResult<String> {
        let address = qualify(name);
        let args = lineage.concept_arguments();
        for arg in &args {
            if arg != &address && !self.concepts.contains_key(arg) {
                return Err(PlanningError::UndefinedConcept(arg.clone()));
            }
        }
        let arg_concepts: Vec<&Concept> = args
            .iter()
            .filter_map(|a| self.concepts.get(a))
            .collect();

        let derivation = lineage.derivation();
        let all_single_row = arg_concepts.iter().all(|c| c.is_single_row());
        let args_grain = arg_concepts
            .iter()
            .fold(Grain::abstract_grain(), |acc, c| acc.union(&c.grain));

        let (purpose, grain, keys, granularity) = match (&lineage, derivation) {
            (_, Derivation::Constant) => (
                Purpose::Constant,
                Grain::abstract_grain(),
                BTreeSet::new(),
                Granularity::SingleRow,
            ),
            (Lineage::Aggregate(aggregate), _) => {
                let by: BTreeSet<String> = aggregate.by.iter().cloned().collect();
                let granularity = if by.is_empty() {
                    Granularity::SingleRow
                } else {
                    Granularity::MultiRow
                };
                (Purpose::Metric, Grain::new(by.iter().cloned()), by, granularity)
            }
            (Lineage::Function(function), Derivation::GroupTo) => {
                let by: BTreeSet<String> = function
                    .args
                    .iter()
                    .skip(1)
                    .flat_map(|a| a.concept_arguments())
                    .collect();
                (
                    Purpose::Property,
                    Grain::new(by.iter().cloned()),
                    by,
                    Granularity::MultiRow,
                )
            }
            (Lineage::Filter(filter), _) => {
                let content = self.concept(&filter.content)?;
                let grain = if content.purpose == Purpose::Key {
                    Grain::new([address.clone()])
                } else {
                    content.grain.clone()
                };
                (
                    content.purpose,
                    grain,
                    content.keys.clone(),
                    content.granularity,
                )
            }
            (Lineage::Window(window), _) => {
                let content = self.concept(&window.content)?;
                (
                    Purpose::Property,
                    content.grain.clone(),
                    content.grain.components.clone(),
                    Granularity::MultiRow,
                )
            }
            (_, Derivation::Unnest | Derivation::Union | Derivation::Recursive) => (
                Purpose::Key,
                Grain::new([address.clone()]),
                BTreeSet::new(),
                Granularity::MultiRow,
            ),
            _ => {
                let granularity = if all_single_row {
                    Granularity::SingleRow
                } else {
                    Granularity::MultiRow
                };
                let grain = if granularity == Granularity::SingleRow {
                    Grain::abstract_grain()
                } else {
                    args_grain.clone()
                };
                (
                    Purpose::Property,
                    grain.clone(),
                    grain.components,
                    granularity,
                )
            }
        };

        let mut concept = Concept::derived(name, datatype, purpose, lineage, grain, granularity);
        concept.keys = keys;
        debug!(concept = %concept.address, derivation = %concept.derivation, "declared derived concept");
        Ok(self.add_concept(concept))
    }

    /// Declare an aggregate of one concept, grouped by `by` (single row when
    /// `by` is empty).
    pub fn add_metric(
        &mut self,
        name: &str,
        datatype: DataType,
        op: AggregateOp,
        argument: &str,
        by: &[&str],
    ) -> PlanningResult<String> {
        let lineage = Lineage::Aggregate(AggregateItem {
            op,
            args: vec![Expr::concept(qualify(argument))],
            by: by.iter().map(|b| qualify(b)).collect(),
        });
        self.add_derived(name, datatype, lineage)
    }

    /// The environment as seen by one select.
    ///
    /// Aggregates declared without a `by` list are evaluated at the grain of
    /// the select's non-aggregate concepts, so each is re-grained to that
    /// grain. Selects made only of aggregates keep them single-row.
    pub fn with_select_context<S: AsRef<str>>(&self, select: &[S]) -> PlanningResult<Environment> {
        let selected = self.concepts_for(select)?;
        let grain = Grain::from_concepts(selected.iter().filter(|c| !c.is_aggregate()));
        if grain.is_abstract() {
            return Ok(self.clone());
        }
        let mut env = self.clone();
        for concept in &selected {
            let ungrouped = matches!(&concept.lineage, Some(Lineage::Aggregate(a)) if a.by.is_empty());
            if !ungrouped {
                continue;
            }
            let mut regrained = concept.with_grain(grain.clone());
            regrained.keys = grain.components.clone();
            regrained.granularity = Granularity::MultiRow;
            debug!(concept = %regrained.address, grain = %grain, "evaluating aggregate at select grain");
            env.add_concept(regrained);
        }
        Ok(env)
    }

    /// Declare that `source` and `target` are equivalent.
    ///
    /// Pseudonyms are recorded on both sides and never removed.
    pub fn merge_concepts(&mut self, source: &str, target: &str) -> PlanningResult<()> {
        let source = qualify(source);
        let target = qualify(target);
        if !self.concepts.contains_key(&source) {
            return Err(PlanningError::UndefinedConcept(source));
        }
        if !self.concepts.contains_key(&target) {
            return Err(PlanningError::UndefinedConcept(target));
        }
        if source == target {
            return Ok(());
        }
        if let Some(concept) = self.concepts.get_mut(&source) {
            concept.pseudonyms.insert(target.clone());
        }
        if let Some(concept) = self.concepts.get_mut(&target) {
            concept.pseudonyms.insert(source);
        }
        Ok(())
    }

    pub fn add_datasource(&mut self, datasource: Datasource) -> PlanningResult<()> {
        for column in &datasource.columns {
            if !self.concepts.contains_key(&column.concept) {
                return Err(PlanningError::UndefinedConcept(column.concept.clone()));
            }
        }
        self.datasources
            .insert(datasource.identifier.clone(), datasource);
        Ok(())
    }

    /// Declare a named rowset, exposing `{rowset}.{name}` for every output.
    pub fn add_rowset(&mut self, name: &str, select: SelectLineage) -> PlanningResult<Vec<String>> {
        let rowset_address = |content: &Concept| format!("{}.{}", name, content.name());
        let contents = self.concepts_for(&select.output)?;
        let exposed: BTreeMap<String, String> = contents
            .iter()
            .map(|c| (c.address.clone(), rowset_address(c)))
            .collect();

        let mut created = Vec::new();
        for content in &contents {
            let address = rowset_address(content);
            let grain = if content.purpose == Purpose::Key {
                Grain::new([address.clone()])
            } else {
                let mapped: Vec<String> = content
                    .grain
                    .components
                    .iter()
                    .filter_map(|g| exposed.get(g).cloned())
                    .collect();
                if mapped.is_empty() && !content.is_single_row() {
                    Grain::new([address.clone()])
                } else {
                    Grain::new(mapped)
                }
            };
            let keys = content
                .keys
                .iter()
                .filter_map(|k| exposed.get(k).cloned())
                .collect();
            let lineage = Lineage::Rowset(RowsetItem {
                rowset: name.to_string(),
                content: content.address.clone(),
                select: select.clone(),
            });
            let mut concept = Concept::derived(
                &address,
                content.datatype.clone(),
                content.purpose,
                lineage,
                grain,
                content.granularity,
            );
            concept.keys = keys;
            created.push(self.add_concept(concept));
        }
        Ok(created)
    }

    /// Declare a multiselect whose aligned concepts collect values across
    /// every branch.
    pub fn add_multiselect(
        &mut self,
        name: &str,
        selects: Vec<SelectLineage>,
        align: Vec<AlignItem>,
    ) -> PlanningResult<Vec<String>> {
        let align: Vec<AlignItem> = align
            .into_iter()
            .map(|item| AlignItem {
                aligned: qualify(&item.aligned),
                concepts: item.concepts,
            })
            .collect();
        let mut created = Vec::new();
        for item in &align {
            let members = self.concepts_for(&item.concepts)?;
            let first = members.first().ok_or_else(|| PlanningError::InvalidLineage {
                address: item.aligned.clone(),
                reason: "alignment lists no concepts".to_string(),
            })?;
            let is_key = members.iter().any(|m| m.purpose == Purpose::Key);
            let grain = if is_key {
                Grain::new([item.aligned.clone()])
            } else {
                Grain::abstract_grain()
            };
            let lineage = Lineage::Multiselect(MultiselectItem {
                name: name.to_string(),
                selects: selects.clone(),
                align: align.clone(),
                aligned: item.aligned.clone(),
            });
            let concept = Concept::derived(
                &item.aligned,
                first.datatype.clone(),
                if is_key { Purpose::Key } else { first.purpose },
                lineage,
                grain,
                Granularity::MultiRow,
            );
            created.push(self.add_concept(concept));
        }
        Ok(created)
    }

    /// Concepts derived through a given rowset.
    pub fn rowset_concepts(&self, rowset: &str) -> Vec<&Concept> {
        self.concepts
            .values()
            .filter(|c| matches!(&c.lineage, Some(Lineage::Rowset(r)) if r.rowset == rowset))
            .collect()
    }

    /// Concepts aligned by a given multiselect.
    pub fn multiselect_concepts(&self, name: &str) -> Vec<&Concept> {
        self.concepts
            .values()
            .filter(|c| matches!(&c.lineage, Some(Lineage::Multiselect(m)) if m.name == name))
            .collect()
    }

    /// True if `concept` is a group-to function concept.
    pub fn is_group_to(concept: &Concept) -> bool {
        matches!(&concept.lineage, Some(Lineage::Function(f)) if f.op == FunctionOp::Group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::concept::{FilterItem, Function};
    use crate::model::expr::{ComparisonOp, Condition};

    fn base() -> Environment {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("cat", DataType::String, &["id"]);
        env.add_property("value", DataType::Float, &["id"]);
        env
    }

    #[test]
    fn test_aggregate_without_by_is_single_row() {
        let mut env = base();
        let total = env
            .add_derived(
                "total",
                DataType::Float,
                Lineage::Aggregate(AggregateItem {
                    op: AggregateOp::Sum,
                    args: vec![Expr::concept("local.value")],
                    by: vec![],
                }),
            )
            .unwrap();
        let concept = env.concept(&total).unwrap();
        assert_eq!(concept.granularity, Granularity::SingleRow);
        assert!(concept.grain.is_abstract());
        assert_eq!(concept.purpose, Purpose::Metric);
    }

    #[test]
    fn test_basic_grain_is_union_of_args() {
        let mut env = base();
        let doubled = env
            .add_derived(
                "doubled",
                DataType::Float,
                Lineage::Function(Function {
                    op: FunctionOp::Multiply,
                    args: vec![Expr::concept("local.value"), Expr::int(2)],
                }),
            )
            .unwrap();
        let concept = env.concept(&doubled).unwrap();
        assert_eq!(concept.derivation, Derivation::Basic);
        assert_eq!(concept.grain, Grain::new(["local.id"]));
    }

    #[test]
    fn test_filter_of_key_is_keyed_on_itself() {
        let mut env = base();
        let filtered = env
            .add_derived(
                "big_id",
                DataType::Integer,
                Lineage::Filter(FilterItem {
                    content: "local.id".to_string(),
                    condition: Condition::compare(
                        Expr::concept("local.value"),
                        ComparisonOp::Gt,
                        Expr::int(10),
                    ),
                }),
            )
            .unwrap();
        let concept = env.concept(&filtered).unwrap();
        assert_eq!(concept.purpose, Purpose::Key);
        assert_eq!(concept.grain, Grain::new(["local.big_id"]));
    }

    #[test]
    fn test_undefined_argument_is_rejected() {
        let mut env = base();
        let err = env
            .add_derived(
                "bad",
                DataType::Float,
                Lineage::Function(Function {
                    op: FunctionOp::Add,
                    args: vec![Expr::concept("local.missing"), Expr::int(1)],
                }),
            )
            .unwrap_err();
        assert_eq!(err, PlanningError::UndefinedConcept("local.missing".to_string()));
    }

    #[test]
    fn test_merge_is_symmetric() {
        let mut env = base();
        env.add_key("other_id", DataType::Integer);
        env.merge_concepts("other_id", "id").unwrap();
        assert!(env.concepts["local.id"].pseudonyms.contains("local.other_id"));
        assert!(env.concepts["local.other_id"].pseudonyms.contains("local.id"));
    }

    #[test]
    fn test_rowset_exposes_namespaced_concepts() {
        let mut env = base();
        let created = env
            .add_rowset(
                "top",
                SelectLineage {
                    output: vec!["local.id".to_string(), "local.cat".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(created, vec!["top.id", "top.cat"]);
        assert_eq!(env.concepts["top.cat"].grain, Grain::new(["top.id"]));
        assert_eq!(env.rowset_concepts("top").len(), 2);
    }

    #[test]
    fn test_select_context_regrains_ungrouped_aggregates() {
        let mut env = base();
        env.add_metric("total", DataType::Float, AggregateOp::Sum, "value", &[])
            .unwrap();
        let scoped = env.with_select_context(&["local.cat", "local.total"]).unwrap();
        let total = scoped.concept("local.total").unwrap();
        assert_eq!(total.grain, Grain::new(["local.cat"]));
        assert_eq!(total.granularity, Granularity::MultiRow);
        assert!(total.keys.contains("local.cat"));

        let alone = env.with_select_context(&["local.total"]).unwrap();
        assert!(alone.concept("local.total").unwrap().is_single_row());
    }
}

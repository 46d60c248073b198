//! Concepts: named, typed attributes with aggregation semantics.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::expr::{AggregateOp, Condition, Expr, FunctionOp, Literal};
use super::grain::Grain;

/// Namespace used when an address is given without one.
pub const DEFAULT_NAMESPACE: &str = "local";

/// Qualify a bare name with the default namespace.
pub fn qualify(address: &str) -> String {
    if address.contains('.') {
        address.to_string()
    } else {
        format!("{}.{}", DEFAULT_NAMESPACE, address)
    }
}

// ============================================================================
// Supporting Enums
// ============================================================================

/// Semantic role of a concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Key,
    Property,
    /// A property with a one-to-one relationship to its keys.
    UniqueProperty,
    Metric,
    Constant,
    Unknown,
}

/// How a concept's value is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    Root,
    Constant,
    Basic,
    Aggregate,
    Filter,
    Window,
    Unnest,
    Union,
    Recursive,
    Rowset,
    Multiselect,
    GroupTo,
}

impl fmt::Display for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Derivation::Root => "root",
            Derivation::Constant => "constant",
            Derivation::Basic => "basic",
            Derivation::Aggregate => "aggregate",
            Derivation::Filter => "filter",
            Derivation::Window => "window",
            Derivation::Unnest => "unnest",
            Derivation::Union => "union",
            Derivation::Recursive => "recursive",
            Derivation::Rowset => "rowset",
            Derivation::Multiselect => "multiselect",
            Derivation::GroupTo => "group_to",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    SingleRow,
    MultiRow,
}

/// Data type of a concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Array(Box<DataType>),
    Unknown,
}

// ============================================================================
// Lineage
// ============================================================================

/// Scalar function lineage (basic, constant, unnest, group-to, recursive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub op: FunctionOp,
    pub args: Vec<Expr>,
}

/// Aggregate lineage. An empty `by` list aggregates to a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateItem {
    pub op: AggregateOp,
    pub args: Vec<Expr>,
    #[serde(default)]
    pub by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterItem {
    pub content: String,
    pub condition: Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    RowNumber,
    Rank,
    Lag,
    Lead,
    Sum,
    Count,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub concept: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowItem {
    pub kind: WindowKind,
    pub content: String,
    #[serde(default)]
    pub over: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderItem>,
}

/// Union of the values of several key-compatible concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionItem {
    pub concepts: Vec<String>,
}

/// An inner select used by rowset and multiselect lineage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectLineage {
    pub output: Vec<String>,
    #[serde(default)]
    pub hidden: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub having: Option<Condition>,
}

/// A concept exposed by a named rowset (`rowset top <- select ...`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetItem {
    pub rowset: String,
    pub content: String,
    pub select: SelectLineage,
}

/// Declares that `aligned` collects `concepts` across multiselect branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignItem {
    pub aligned: String,
    pub concepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiselectItem {
    pub name: String,
    pub selects: Vec<SelectLineage>,
    pub align: Vec<AlignItem>,
    /// The aligned concept this lineage produces.
    pub aligned: String,
}

impl MultiselectItem {
    /// The aligned concept that collects `address`, if any.
    pub fn merge_concept(&self, address: &str) -> Option<&str> {
        self.align
            .iter()
            .find(|item| item.concepts.iter().any(|c| c == address))
            .map(|item| item.aligned.as_str())
    }
}

/// The expression or derivation producing a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lineage {
    Function(Function),
    Aggregate(AggregateItem),
    Filter(FilterItem),
    Window(WindowItem),
    Union(UnionItem),
    Rowset(RowsetItem),
    Multiselect(MultiselectItem),
}

impl Lineage {
    /// Addresses of the concepts this lineage reads, in first-seen order.
    pub fn concept_arguments(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |address: &String| {
            if !out.contains(address) {
                out.push(address.clone());
            }
        };
        match self {
            Lineage::Function(function) => {
                for arg in &function.args {
                    arg.concept_arguments().iter().for_each(&mut push);
                }
            }
            Lineage::Aggregate(aggregate) => {
                for arg in &aggregate.args {
                    arg.concept_arguments().iter().for_each(&mut push);
                }
                aggregate.by.iter().for_each(&mut push);
            }
            Lineage::Filter(filter) => {
                push(&filter.content);
                filter.condition.concept_arguments().iter().for_each(&mut push);
            }
            Lineage::Window(window) => {
                push(&window.content);
                window.over.iter().for_each(&mut push);
                window.order_by.iter().for_each(|o| push(&o.concept));
            }
            Lineage::Union(union) => union.concepts.iter().for_each(&mut push),
            Lineage::Rowset(rowset) => push(&rowset.content),
            Lineage::Multiselect(multiselect) => {
                if let Some(item) = multiselect
                    .align
                    .iter()
                    .find(|a| a.aligned == multiselect.aligned)
                {
                    item.concepts.iter().for_each(&mut push);
                }
            }
        }
        out
    }

    pub fn derivation(&self) -> Derivation {
        match self {
            Lineage::Function(function) => match function.op {
                FunctionOp::Unnest => Derivation::Unnest,
                FunctionOp::Group => Derivation::GroupTo,
                FunctionOp::RecurseEdge => Derivation::Recursive,
                _ if function
                    .args
                    .iter()
                    .all(|arg| arg.concept_arguments().is_empty()) =>
                {
                    Derivation::Constant
                }
                _ => Derivation::Basic,
            },
            Lineage::Aggregate(_) => Derivation::Aggregate,
            Lineage::Filter(_) => Derivation::Filter,
            Lineage::Window(_) => Derivation::Window,
            Lineage::Union(_) => Derivation::Union,
            Lineage::Rowset(_) => Derivation::Rowset,
            Lineage::Multiselect(_) => Derivation::Multiselect,
        }
    }

    /// Structural equivalence ignoring the produced concept, used to batch
    /// peers that share one physical computation.
    pub fn is_equivalent(&self, other: &Lineage) -> bool {
        match (self, other) {
            (Lineage::Window(a), Lineage::Window(b)) => a.over == b.over && a.order_by == b.order_by,
            (Lineage::Function(a), Lineage::Function(b)) => {
                a.op == b.op
                    && a.args.iter().flat_map(|x| x.concept_arguments()).collect::<Vec<_>>()
                        == b.args.iter().flat_map(|x| x.concept_arguments()).collect::<Vec<_>>()
            }
            _ => self == other,
        }
    }

    /// The literal held by a constant lineage.
    pub fn constant_value(&self) -> Option<&Literal> {
        match self {
            Lineage::Function(Function {
                op: FunctionOp::Constant,
                args,
            }) => match args.as_slice() {
                [Expr::Literal(literal)] => Some(literal),
                _ => None,
            },
            _ => None,
        }
    }
}

// ============================================================================
// Concept
// ============================================================================

/// A named, typed, derivable data attribute.
///
/// Concepts are immutable once declared except for `pseudonyms`, which only
/// ever grows as merges are declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub address: String,
    pub datatype: DataType,
    pub purpose: Purpose,
    pub derivation: Derivation,
    pub granularity: Granularity,
    pub grain: Grain,
    #[serde(default)]
    pub lineage: Option<Lineage>,
    #[serde(default)]
    pub keys: BTreeSet<String>,
    #[serde(default)]
    pub pseudonyms: BTreeSet<String>,
}

impl Concept {
    /// A root key; its default grain is itself.
    pub fn key(address: &str, datatype: DataType) -> Self {
        let address = qualify(address);
        Self {
            grain: Grain::new([address.clone()]),
            address,
            datatype,
            purpose: Purpose::Key,
            derivation: Derivation::Root,
            granularity: Granularity::MultiRow,
            lineage: None,
            keys: BTreeSet::new(),
            pseudonyms: BTreeSet::new(),
        }
    }

    /// A root property; its default grain is its keys.
    pub fn property<I, S>(address: &str, datatype: DataType, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(|k| qualify(k.as_ref())).collect();
        Self {
            address: qualify(address),
            datatype,
            purpose: Purpose::Property,
            derivation: Derivation::Root,
            granularity: Granularity::MultiRow,
            grain: Grain::new(keys.iter().cloned()),
            lineage: None,
            keys,
            pseudonyms: BTreeSet::new(),
        }
    }

    /// A property with a one-to-one relationship to its keys.
    pub fn unique_property<I, S>(address: &str, datatype: DataType, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            purpose: Purpose::UniqueProperty,
            ..Self::property(address, datatype, keys)
        }
    }

    /// A single-row constant.
    pub fn constant(address: &str, datatype: DataType, value: Literal) -> Self {
        Self {
            address: qualify(address),
            datatype,
            purpose: Purpose::Constant,
            derivation: Derivation::Constant,
            granularity: Granularity::SingleRow,
            grain: Grain::abstract_grain(),
            lineage: Some(Lineage::Function(Function {
                op: FunctionOp::Constant,
                args: vec![Expr::Literal(value)],
            })),
            keys: BTreeSet::new(),
            pseudonyms: BTreeSet::new(),
        }
    }

    /// A derived concept with explicitly computed attributes.
    ///
    /// [`Environment::add_derived`](super::Environment::add_derived) computes
    /// purpose, grain and granularity from the lineage's arguments.
    pub fn derived(
        address: &str,
        datatype: DataType,
        purpose: Purpose,
        lineage: Lineage,
        grain: Grain,
        granularity: Granularity,
    ) -> Self {
        Self {
            address: qualify(address),
            datatype,
            purpose,
            derivation: lineage.derivation(),
            granularity,
            grain,
            lineage: Some(lineage),
            keys: BTreeSet::new(),
            pseudonyms: BTreeSet::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.address
            .rsplit_once('.')
            .map(|(ns, _)| ns)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn name(&self) -> &str {
        self.address
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.address)
    }

    pub fn concept_arguments(&self) -> Vec<String> {
        self.lineage
            .as_ref()
            .map(Lineage::concept_arguments)
            .unwrap_or_default()
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.lineage, Some(Lineage::Aggregate(_)))
    }

    pub fn is_single_row(&self) -> bool {
        self.granularity == Granularity::SingleRow
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keys = keys.into_iter().map(|k| qualify(k.as_ref())).collect();
        self
    }

    /// The same concept viewed at a different grain.
    pub fn with_grain(&self, grain: Grain) -> Self {
        Self {
            grain,
            ..self.clone()
        }
    }
}

impl PartialEq for Concept {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Concept {}

impl std::hash::Hash for Concept {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.grain.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_grain_is_itself() {
        let id = Concept::key("id", DataType::Integer);
        assert_eq!(id.address, "local.id");
        assert_eq!(id.grain, Grain::new(["local.id"]));
        assert_eq!(id.namespace(), "local");
        assert_eq!(id.name(), "id");
    }

    #[test]
    fn test_property_grain_is_keys() {
        let name = Concept::property("name", DataType::String, ["customer_id"]);
        assert_eq!(name.grain, Grain::new(["local.customer_id"]));
        assert!(name.keys.contains("local.customer_id"));
    }

    #[test]
    fn test_lineage_derivation() {
        let constant = Lineage::Function(Function {
            op: FunctionOp::Add,
            args: vec![Expr::int(1), Expr::int(2)],
        });
        assert_eq!(constant.derivation(), Derivation::Constant);

        let basic = Lineage::Function(Function {
            op: FunctionOp::Add,
            args: vec![Expr::concept("local.a"), Expr::int(2)],
        });
        assert_eq!(basic.derivation(), Derivation::Basic);

        let unnest = Lineage::Function(Function {
            op: FunctionOp::Unnest,
            args: vec![Expr::concept("local.tags")],
        });
        assert_eq!(unnest.derivation(), Derivation::Unnest);
    }

    #[test]
    fn test_aggregate_arguments_include_by() {
        let lineage = Lineage::Aggregate(AggregateItem {
            op: AggregateOp::Sum,
            args: vec![Expr::concept("local.value")],
            by: vec!["local.cat".to_string()],
        });
        assert_eq!(lineage.concept_arguments(), vec!["local.value", "local.cat"]);
    }

    #[test]
    fn test_constant_value() {
        let c = Concept::constant("threshold", DataType::Integer, Literal::Integer(5));
        assert_eq!(
            c.lineage.as_ref().and_then(Lineage::constant_value),
            Some(&Literal::Integer(5))
        );
        assert!(c.is_single_row());
    }
}

//! Expressions and row conditions over concepts.
//!
//! Expressions reference concepts by address; anything that needs to look
//! through a concept's own lineage takes the [`Environment`] explicitly.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::concept::Lineage;
use super::environment::Environment;

// ============================================================================
// Operators and literals
// ============================================================================

/// Literal value appearing in an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(v) => write!(f, "{}", v),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Literal::Boolean(v) => write!(f, "{}", v),
            Literal::Null => write!(f, "null"),
        }
    }
}

/// Scalar (row-level) function operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
    Upper,
    Lower,
    Coalesce,
    Length,
    /// Wraps a literal into a constant concept.
    Constant,
    /// Expands an array into one row per element.
    Unnest,
    /// Re-states a value at an explicit grain (`group x by a, b`).
    Group,
    /// Transitive closure over a child/parent edge pair.
    RecurseEdge,
}

impl FunctionOp {
    fn infix(self) -> Option<&'static str> {
        match self {
            FunctionOp::Add => Some("+"),
            FunctionOp::Subtract => Some("-"),
            FunctionOp::Multiply => Some("*"),
            FunctionOp::Divide => Some("/"),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FunctionOp::Add => "add",
            FunctionOp::Subtract => "subtract",
            FunctionOp::Multiply => "multiply",
            FunctionOp::Divide => "divide",
            FunctionOp::Concat => "concat",
            FunctionOp::Upper => "upper",
            FunctionOp::Lower => "lower",
            FunctionOp::Coalesce => "coalesce",
            FunctionOp::Length => "length",
            FunctionOp::Constant => "constant",
            FunctionOp::Unnest => "unnest",
            FunctionOp::Group => "group",
            FunctionOp::RecurseEdge => "recurse_edge",
        }
    }
}

/// Aggregate function operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
    ArrayAgg,
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Count => "count",
            AggregateOp::CountDistinct => "count_distinct",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::ArrayAgg => "array_agg",
        };
        write!(f, "{}", name)
    }
}

/// Comparison operators usable in a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Is,
    IsNot,
    Like,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
            ComparisonOp::In => "in",
            ComparisonOp::NotIn => "not in",
            ComparisonOp::Is => "is",
            ComparisonOp::IsNot => "is not",
            ComparisonOp::Like => "like",
        };
        write!(f, "{}", symbol)
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// A scalar or aggregate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Concept(String),
    Literal(Literal),
    Function { op: FunctionOp, args: Vec<Expr> },
    Aggregate { op: AggregateOp, args: Vec<Expr> },
}

impl Expr {
    pub fn concept(address: impl Into<String>) -> Self {
        Expr::Concept(address.into())
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Integer(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(value.into()))
    }

    pub fn function(op: FunctionOp, args: Vec<Expr>) -> Self {
        Expr::Function { op, args }
    }

    /// Concept addresses referenced by this expression, in first-seen order.
    pub fn concept_arguments(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_concepts(&mut out);
        out
    }

    fn collect_concepts(&self, out: &mut Vec<String>) {
        match self {
            Expr::Concept(address) => {
                if !out.contains(address) {
                    out.push(address.clone());
                }
            }
            Expr::Literal(_) => {}
            Expr::Function { args, .. } | Expr::Aggregate { args, .. } => {
                for arg in args {
                    arg.collect_concepts(out);
                }
            }
        }
    }

    /// True if no aggregate is evaluated anywhere in this expression,
    /// including through the lineage of referenced concepts.
    ///
    /// Concepts in `materialized` are treated as already computed columns.
    pub fn is_scalar(&self, env: &Environment, materialized: Option<&BTreeSet<String>>) -> bool {
        let mut seen = BTreeSet::new();
        self.is_scalar_inner(env, materialized, &mut seen)
    }

    fn is_scalar_inner(
        &self,
        env: &Environment,
        materialized: Option<&BTreeSet<String>>,
        seen: &mut BTreeSet<String>,
    ) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Aggregate { .. } => false,
            Expr::Function { args, .. } => args
                .iter()
                .all(|arg| arg.is_scalar_inner(env, materialized, seen)),
            Expr::Concept(address) => {
                if materialized.is_some_and(|m| m.contains(address)) {
                    return true;
                }
                if !seen.insert(address.clone()) {
                    return true;
                }
                match env.concepts.get(address).and_then(|c| c.lineage.as_ref()) {
                    Some(Lineage::Aggregate(_)) => false,
                    Some(Lineage::Function(function)) => function
                        .args
                        .iter()
                        .all(|arg| arg.is_scalar_inner(env, materialized, seen)),
                    _ => true,
                }
            }
        }
    }

    /// Replace every reference to `address` with `literal`. Returns true if
    /// anything was replaced.
    pub fn inline_literal(&mut self, address: &str, literal: &Literal) -> bool {
        match self {
            Expr::Concept(current) if current == address => {
                *self = Expr::Literal(literal.clone());
                true
            }
            Expr::Concept(_) | Expr::Literal(_) => false,
            Expr::Function { args, .. } | Expr::Aggregate { args, .. } => {
                let mut changed = false;
                for arg in args.iter_mut() {
                    changed |= arg.inline_literal(address, literal);
                }
                changed
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Concept(address) => write!(f, "{}", address),
            Expr::Literal(literal) => write!(f, "{}", literal),
            Expr::Function { op, args } => match (op.infix(), args.as_slice()) {
                (Some(symbol), [left, right]) => write!(f, "({} {} {})", left, symbol, right),
                _ => write!(f, "{}({})", op.name(), join_display(args)),
            },
            Expr::Aggregate { op, args } => write!(f, "{}({})", op, join_display(args)),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Conditions
// ============================================================================

/// A boolean row condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        left: Expr,
        op: ComparisonOp,
        right: Expr,
    },
    /// Membership test against the values of another concept, sourced in
    /// its own row context.
    Subselect {
        left: Expr,
        op: ComparisonOp,
        right: String,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn compare(left: Expr, op: ComparisonOp, right: Expr) -> Self {
        Condition::Comparison { left, op, right }
    }

    /// AND two conditions together.
    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    /// AND an optional existing condition with a new one.
    pub fn conjoin(existing: Option<Condition>, new: Condition) -> Condition {
        match existing {
            Some(existing) => existing.and(new),
            None => new,
        }
    }

    /// Concepts that must be present on the row to evaluate this condition.
    pub fn row_arguments(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_row_arguments(&mut out);
        out
    }

    fn collect_row_arguments(&self, out: &mut Vec<String>) {
        match self {
            Condition::Comparison { left, right, .. } => {
                left.collect_concepts(out);
                right.collect_concepts(out);
            }
            Condition::Subselect { left, .. } => left.collect_concepts(out),
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.collect_row_arguments(out);
                r.collect_row_arguments(out);
            }
            Condition::Not(inner) => inner.collect_row_arguments(out),
        }
    }

    /// Concepts sourced independently for membership tests.
    pub fn existence_arguments(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_existence_arguments(&mut out);
        out
    }

    fn collect_existence_arguments(&self, out: &mut Vec<String>) {
        match self {
            Condition::Comparison { .. } => {}
            Condition::Subselect { right, .. } => {
                if !out.contains(right) {
                    out.push(right.clone());
                }
            }
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.collect_existence_arguments(out);
                r.collect_existence_arguments(out);
            }
            Condition::Not(inner) => inner.collect_existence_arguments(out),
        }
    }

    /// All concept addresses referenced, row and existence arguments alike.
    pub fn concept_arguments(&self) -> Vec<String> {
        let mut out = self.row_arguments();
        for existence in self.existence_arguments() {
            if !out.contains(&existence) {
                out.push(existence);
            }
        }
        out
    }

    /// True if the condition can be evaluated row by row, without any
    /// aggregate sub-term.
    pub fn is_scalar(&self, env: &Environment, materialized: Option<&BTreeSet<String>>) -> bool {
        match self {
            Condition::Comparison { left, right, .. } => {
                left.is_scalar(env, materialized) && right.is_scalar(env, materialized)
            }
            Condition::Subselect { .. } => true,
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.is_scalar(env, materialized) && r.is_scalar(env, materialized)
            }
            Condition::Not(inner) => inner.is_scalar(env, materialized),
        }
    }

    /// Split a conjunction into its independent terms.
    pub fn decompose(&self) -> Vec<Condition> {
        match self {
            Condition::And(l, r) => {
                let mut out = l.decompose();
                out.extend(r.decompose());
                out
            }
            other => vec![other.clone()],
        }
    }

    /// Rebuild a conjunction from terms; `None` for an empty list.
    pub fn from_terms(terms: impl IntoIterator<Item = Condition>) -> Option<Condition> {
        terms
            .into_iter()
            .fold(None, |acc, term| Some(Condition::conjoin(acc, term)))
    }

    /// True if `self` equals `parent` or is one of its AND-ed terms.
    pub fn is_child_of(&self, parent: &Condition) -> bool {
        if self == parent {
            return true;
        }
        match parent {
            Condition::And(l, r) => self.is_child_of(l) || self.is_child_of(r),
            _ => false,
        }
    }

    /// Replace every reference to `address` with `literal`.
    pub fn inline_literal(&mut self, address: &str, literal: &Literal) -> bool {
        match self {
            Condition::Comparison { left, right, .. } => {
                let l = left.inline_literal(address, literal);
                let r = right.inline_literal(address, literal);
                l || r
            }
            Condition::Subselect { left, .. } => left.inline_literal(address, literal),
            Condition::And(l, r) | Condition::Or(l, r) => {
                let a = l.inline_literal(address, literal);
                let b = r.inline_literal(address, literal);
                a || b
            }
            Condition::Not(inner) => inner.inline_literal(address, literal),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Comparison { left, op, right } => write!(f, "{} {} {}", left, op, right),
            Condition::Subselect { left, op, right } => {
                write!(f, "{} {} (select {})", left, op, right)
            }
            Condition::And(l, r) => write!(f, "({} and {})", l, r),
            Condition::Or(l, r) => write!(f, "({} or {})", l, r),
            Condition::Not(inner) => write!(f, "not {}", inner),
        }
    }
}

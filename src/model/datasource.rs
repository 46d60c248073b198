//! Physical datasources and their column bindings.

use serde::{Deserialize, Serialize};

use super::concept::qualify;
use super::expr::Condition;
use super::grain::Grain;

/// Binding of one physical column to a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Physical column name.
    pub name: String,
    /// Address of the concept this column provides.
    pub concept: String,
    /// False if only a subset of the concept's values appear here.
    #[serde(default = "default_true")]
    pub is_complete: bool,
    #[serde(default)]
    pub is_nullable: bool,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: &str, concept: &str) -> Self {
        Self {
            name: name.to_string(),
            concept: qualify(concept),
            is_complete: true,
            is_nullable: false,
        }
    }

    pub fn partial(mut self) -> Self {
        self.is_complete = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }
}

/// A named physical relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    pub identifier: String,
    /// Physical address (table name); defaults to the identifier.
    #[serde(default)]
    pub address: Option<String>,
    pub columns: Vec<Column>,
    pub grain: Grain,
    /// Row filter baked into this relation.
    #[serde(default)]
    pub where_clause: Option<Condition>,
    /// Condition under which this relation is complete, for pre-filtered
    /// aggregate extracts.
    #[serde(default)]
    pub non_partial_for: Option<Condition>,
}

impl Datasource {
    pub fn new<I, S>(identifier: &str, columns: Vec<Column>, grain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            identifier: identifier.to_string(),
            address: None,
            columns,
            grain: Grain::new(grain.into_iter().map(|g| qualify(g.as_ref()))),
            where_clause: None,
            non_partial_for: None,
        }
    }

    pub fn with_non_partial_for(mut self, condition: Condition) -> Self {
        self.non_partial_for = Some(condition);
        self
    }

    pub fn physical_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.identifier)
    }

    /// Addresses of every concept bound to a column.
    pub fn output_concepts(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for column in &self.columns {
            if !out.contains(&column.concept) {
                out.push(column.concept.clone());
            }
        }
        out
    }

    pub fn provides(&self, address: &str) -> bool {
        self.columns.iter().any(|c| c.concept == address)
    }

    pub fn partial_concepts(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.is_complete)
            .map(|c| c.concept.clone())
            .collect()
    }

    pub fn nullable_concepts(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_nullable)
            .map(|c| c.concept.clone())
            .collect()
    }

    pub fn column_for(&self, address: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.concept == address)
    }
}

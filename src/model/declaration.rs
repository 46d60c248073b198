//! Serde-friendly environment description.
//!
//! ```json
//! {
//!   "declarations": [
//!     {"kind": "key", "name": "id", "datatype": "integer"},
//!     {"kind": "property", "name": "cat", "datatype": "string", "keys": ["id"]},
//!     {"kind": "datasource", "identifier": "items",
//!      "columns": [{"name": "id", "concept": "local.id"}],
//!      "grain": {"components": ["local.id"]}}
//!   ],
//!   "query": {"select": ["local.cat"]}
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PlanningResult;

use super::concept::{qualify, AlignItem, Concept, DataType, Lineage, SelectLineage};
use super::datasource::Datasource;
use super::environment::Environment;
use super::expr::{Condition, Literal};

fn default_datatype() -> DataType {
    DataType::Unknown
}

/// One declaration, applied in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Declaration {
    Key {
        name: String,
        #[serde(default = "default_datatype")]
        datatype: DataType,
    },
    Property {
        name: String,
        #[serde(default = "default_datatype")]
        datatype: DataType,
        keys: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    Constant {
        name: String,
        #[serde(default = "default_datatype")]
        datatype: DataType,
        value: Literal,
    },
    Derived {
        name: String,
        #[serde(default = "default_datatype")]
        datatype: DataType,
        lineage: Lineage,
    },
    Merge {
        source: String,
        target: String,
    },
    Datasource(Datasource),
    Rowset {
        name: String,
        select: SelectLineage,
    },
    Multiselect {
        name: String,
        selects: Vec<SelectLineage>,
        align: Vec<AlignItem>,
    },
}

/// A query against the declared environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub select: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// Top-level file format: declarations plus an optional query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentFile {
    #[serde(default)]
    pub declarations: Vec<Declaration>,
    #[serde(default)]
    pub query: Option<QuerySpec>,
}

impl EnvironmentFile {
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    /// Apply every declaration to a fresh environment.
    pub fn build(&self) -> PlanningResult<Environment> {
        let mut env = Environment::new();
        for declaration in &self.declarations {
            apply(&mut env, declaration)?;
        }
        Ok(env)
    }
}

fn apply(env: &mut Environment, declaration: &Declaration) -> PlanningResult<()> {
    match declaration {
        Declaration::Key { name, datatype } => {
            env.add_key(name, datatype.clone());
        }
        Declaration::Property {
            name,
            datatype,
            keys,
            unique,
        } => {
            let concept = if *unique {
                Concept::unique_property(name, datatype.clone(), keys)
            } else {
                Concept::property(name, datatype.clone(), keys)
            };
            env.add_concept(concept);
        }
        Declaration::Constant {
            name,
            datatype,
            value,
        } => {
            env.add_constant(name, datatype.clone(), value.clone());
        }
        Declaration::Derived {
            name,
            datatype,
            lineage,
        } => {
            env.add_derived(name, datatype.clone(), lineage.clone())?;
        }
        Declaration::Merge { source, target } => env.merge_concepts(source, target)?,
        Declaration::Datasource(datasource) => {
            let mut datasource = datasource.clone();
            for column in datasource.columns.iter_mut() {
                column.concept = qualify(&column.concept);
            }
            env.add_datasource(datasource)?;
        }
        Declaration::Rowset { name, select } => {
            env.add_rowset(name, select.clone())?;
        }
        Declaration::Multiselect {
            name,
            selects,
            align,
        } => {
            env.add_multiselect(name, selects.clone(), align.clone())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_build() {
        let source = r#"{
            "declarations": [
                {"kind": "key", "name": "id", "datatype": "integer"},
                {"kind": "property", "name": "cat", "datatype": "string", "keys": ["id"]},
                {"kind": "datasource", "identifier": "items",
                 "columns": [
                    {"name": "id", "concept": "id"},
                    {"name": "cat", "concept": "local.cat"}
                 ],
                 "grain": {"components": ["local.id"]}}
            ],
            "query": {"select": ["local.cat"]}
        }"#;
        let file = EnvironmentFile::from_json(source).unwrap();
        let env = file.build().unwrap();
        assert_eq!(env.concepts.len(), 2);
        assert!(env.datasources["items"].provides("local.id"));
        assert_eq!(file.query.unwrap().select, vec!["local.cat"]);
    }
}

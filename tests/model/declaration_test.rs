//! Environment files and settings, loaded the way the binary loads them.

use std::path::Path;

use strata::config::{Settings, SettingsError};
use strata::discovery::plan_query;
use strata::model::{qualify, Derivation, EnvironmentFile, Purpose};
use strata::PlanningError;

const SHOP: &str = r#"{
    "declarations": [
        {"kind": "key", "name": "customer_id", "datatype": "integer"},
        {"kind": "key", "name": "order_id", "datatype": "integer"},
        {"kind": "property", "name": "name", "datatype": "string", "keys": ["customer_id"]},
        {"kind": "property", "name": "order_total", "datatype": "float", "keys": ["order_id"]},
        {"kind": "derived", "name": "revenue", "datatype": "float",
         "lineage": {"aggregate": {
            "op": "sum",
            "args": [{"concept": "local.order_total"}],
            "by": ["local.customer_id"]
         }}},
        {"kind": "datasource", "identifier": "customers",
         "columns": [
            {"name": "id", "concept": "customer_id"},
            {"name": "name", "concept": "name"}
         ],
         "grain": {"components": ["local.customer_id"]}},
        {"kind": "datasource", "identifier": "orders",
         "columns": [
            {"name": "id", "concept": "order_id"},
            {"name": "customer", "concept": "customer_id"},
            {"name": "total", "concept": "order_total"}
         ],
         "grain": {"components": ["local.order_id"]}}
    ],
    "query": {
        "select": ["revenue", "customer_id"],
        "condition": {"comparison": {
            "left": {"concept": "local.order_total"},
            "op": "gt",
            "right": {"literal": {"integer": 10}}
        }}
    }
}"#;

#[test]
fn test_declarations_build_an_environment() {
    let file = EnvironmentFile::from_json(SHOP).unwrap();
    let env = file.build().unwrap();

    let revenue = env.concept("local.revenue").unwrap();
    assert_eq!(revenue.derivation, Derivation::Aggregate);
    assert_eq!(revenue.purpose, Purpose::Metric);
    assert!(revenue.grain.contains("local.customer_id"));
    assert!(env.datasources["orders"].provides("local.order_total"));
    assert_eq!(env.datasources["customers"].column_for("local.name").unwrap().name, "name");
}

#[test]
fn test_declared_query_plans() {
    let file = EnvironmentFile::from_json(SHOP).unwrap();
    let env = file.build().unwrap();
    let query = file.query.unwrap();
    let select: Vec<String> = query.select.iter().map(|s| qualify(s)).collect();
    let planned = plan_query(&env, &select, query.condition.as_ref(), &Default::default()).unwrap();
    let mut outputs = planned.arena.core(planned.root).usable_outputs();
    outputs.sort();
    assert_eq!(outputs, vec!["local.customer_id", "local.revenue"]);
}

#[test]
fn test_lineage_over_undeclared_concept_is_rejected() {
    let source = r#"{
        "declarations": [
            {"kind": "derived", "name": "revenue", "datatype": "float",
             "lineage": {"aggregate": {"op": "sum", "args": [{"concept": "local.missing"}]}}}
        ]
    }"#;
    let file = EnvironmentFile::from_json(source).unwrap();
    let err = file.build().unwrap_err();
    assert_eq!(err, PlanningError::UndefinedConcept("local.missing".to_string()));
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    assert!(EnvironmentFile::from_json(r#"{"declarations": [{"kind": "nope"}]}"#).is_err());
}

#[test]
fn test_partial_settings_fill_defaults() {
    let settings = Settings::from_toml_str(
        r#"
[optimizer]
merge_aggregate = false

[logging]
level = "trace"
"#,
    )
    .unwrap();
    assert!(!settings.optimizer.merge_aggregate);
    assert!(settings.optimizer.predicate_pushdown);
    assert_eq!(settings.planner, Default::default());
    assert_eq!(settings.logging.level, "trace");
}

#[test]
fn test_invalid_settings_are_rejected() {
    let err = Settings::from_toml_str("[optimizer]\nmax_loops = 0\n").unwrap_err();
    assert!(matches!(err, SettingsError::InvalidConfig(_)));

    let err = Settings::from_toml_str("[planner]\nmax_depth = \"deep\"\n").unwrap_err();
    assert!(matches!(err, SettingsError::ParseError(_)));
}

#[test]
fn test_missing_settings_file() {
    let err = Settings::load(Path::new("/nonexistent/strata.toml")).unwrap_err();
    assert!(matches!(err, SettingsError::FileNotFound(_)));
}

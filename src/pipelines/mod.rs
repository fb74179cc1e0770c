//! The project's pipeline registry.

pub mod data_science;
pub mod merge_data;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::core::pipeline::{Pipeline, PipelineError};
use crate::domain::{Data, Table, TableError};

/// Name of the pipeline run when none is requested
pub const DEFAULT_PIPELINE: &str = "__default__";

/// Every registered pipeline by name, plus `__default__` (the sum of all)
pub fn register_pipelines() -> Result<BTreeMap<String, Pipeline>, PipelineError> {
    let merge_data = merge_data::create_pipeline()?;
    let data_science = data_science::create_pipeline()?;
    let default = merge_data.try_add(&data_science)?;

    Ok(BTreeMap::from([
        ("merge_data".to_string(), merge_data),
        ("data_science".to_string(), data_science),
        (DEFAULT_PIPELINE.to_string(), default),
    ]))
}

/// Inputs of a node that consumes only tables
pub(crate) fn take_tables<const N: usize>(inputs: Vec<Data>) -> Result<[Table; N]> {
    let tables = inputs
        .into_iter()
        .map(Data::into_table)
        .collect::<Result<Vec<_>, _>>()?;
    tables
        .try_into()
        .map_err(|t: Vec<Table>| anyhow!("expected {} tables, got {}", N, t.len()))
}

/// Body of a node mapping one table to one table
pub(crate) fn one_table<F>(inputs: Vec<Data>, f: F) -> Result<Vec<Data>>
where
    F: Fn(&Table) -> Result<Table, TableError>,
{
    let [table] = take_tables(inputs)?;
    Ok(vec![f(&table)?.into()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_union_of_all() {
        let pipelines = register_pipelines().unwrap();
        assert_eq!(
            pipelines.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["__default__", "data_science", "merge_data"]
        );

        let default = &pipelines[DEFAULT_PIPELINE];
        assert_eq!(default.len(), 13);
        assert!(!default.inputs().contains("merged_data"));
        assert_eq!(
            default.inputs().into_iter().filter(|i| !i.starts_with("params:")).count(),
            4
        );
    }

    #[test]
    fn test_take_tables_rejects_objects() {
        let err = take_tables::<1>(vec![Data::Object(serde_json::json!(1))]).unwrap_err();
        assert!(err.to_string().contains("expected a table"));
    }
}

//! Cleans the four WGMS source tables and joins them into `merged_data`.

use crate::core::node::Node;
use crate::core::pipeline::{Pipeline, PipelineError};
use crate::domain::{JoinKind, Table, TableError};

use super::{one_table, take_tables};

/// First year kept from the yearly observation tables
pub const FIRST_YEAR: f64 = 2000.0;

const ID: &str = "WGMS_ID";
const YEAR: &str = "YEAR";

/// Value used for unknown glacier classification codes
const UNKNOWN_CODE: f64 = 99.0;

/// Drop duplicate and unpositioned glaciers, fill unknown codes
pub fn load_glacier(glacier: &Table) -> Result<Table, TableError> {
    glacier
        .dedupe_by(&[ID])?
        .drop_nulls(&[ID, "LATITUDE", "LONGITUDE"])?
        .fill_nulls(&[
            ("PRIM_CLASSIFIC", UNKNOWN_CODE),
            ("FORM", UNKNOWN_CODE),
            ("FRONTAL_CHARS", UNKNOWN_CODE),
        ])?
        .select(&[ID, "LATITUDE", "LONGITUDE", "PRIM_CLASSIFIC", "FORM", "FRONTAL_CHARS"])
}

/// Recent rows of a yearly table, accumulated per glacier
fn cumulative(table: &Table, columns: &[&str]) -> Result<Table, TableError> {
    let mut selected = vec![ID, YEAR];
    selected.extend_from_slice(columns);

    let recent = table
        .drop_nulls(&[ID])?
        .filter_at_least(YEAR, FIRST_YEAR)?
        .select(&selected)?;
    recent.running_totals(ID, YEAR)?.fill_all_nulls(0.0)
}

pub fn load_change(change: &Table) -> Result<Table, TableError> {
    cumulative(change, &["AREA_CHANGE", "THICKNESS_CHG", "VOLUME_CHANGE"])
}

pub fn load_mass_balance(mass_balance: &Table) -> Result<Table, TableError> {
    cumulative(mass_balance, &["WINTER_BALANCE", "SUMMER_BALANCE", "ANNUAL_BALANCE"])
}

pub fn load_state(state: &Table) -> Result<Table, TableError> {
    state
        .drop_nulls(&[ID])?
        .filter_at_least(YEAR, FIRST_YEAR)?
        .select(&[
            ID,
            YEAR,
            "AREA",
            "LENGTH",
            "HIGHEST_ELEVATION",
            "MEDIAN_ELEVATION",
            "LOWEST_ELEVATION",
        ])?
        .sort_by(&[YEAR, ID])
}

/// Attach glacier metadata to each change row, then outer-join state and
/// mass balance on (glacier, year)
pub fn merge_data(glacier: &Table, change: &Table, state: &Table, mass_balance: &Table) -> Result<Table, TableError> {
    glacier
        .join(change, &[ID], JoinKind::Right)?
        .join(state, &[ID, YEAR], JoinKind::Outer)?
        .join(mass_balance, &[ID, YEAR], JoinKind::Outer)
}

pub fn create_pipeline() -> Result<Pipeline, PipelineError> {
    Pipeline::new(vec![
        Node::new(
            "load_glacier_node",
            |inputs| one_table(inputs, load_glacier),
            &["glacier"],
            &["loaded_glacier"],
        ),
        Node::new(
            "load_change_node",
            |inputs| one_table(inputs, load_change),
            &["change"],
            &["loaded_change"],
        ),
        Node::new(
            "load_state_node",
            |inputs| one_table(inputs, load_state),
            &["state"],
            &["loaded_state"],
        ),
        Node::new(
            "load_mass_balance_node",
            |inputs| one_table(inputs, load_mass_balance),
            &["mass_balance"],
            &["loaded_mass_balance"],
        ),
        Node::new(
            "merge_data_node",
            |inputs| {
                let [glacier, change, state, mass_balance] = take_tables(inputs)?;
                Ok(vec![merge_data(&glacier, &change, &state, &mass_balance)?.into()])
            },
            &["loaded_glacier", "loaded_change", "loaded_state", "loaded_mass_balance"],
            &["merged_data"],
        ),
    ])
}

//! Feature scaling, categorical encoding, the model input table and the
//! glacier map, instantiated once per modelling namespace.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, AsArray, Float64Array, RecordBatch, RecordBatchOptions, StringArray};
use arrow::compute::kernels::cmp::eq;
use arrow::compute::kernels::numeric::{div, sub};
use arrow::compute::{cast, sort, SortOptions};
use arrow::datatypes::{DataType, Schema};
use serde::{Deserialize, Serialize};

use crate::core::node::Node;
use crate::core::pipeline::{Pipeline, PipelineError};
use crate::domain::{Data, ImageData, Table};

use super::take_tables;

pub const ACTIVE_NAMESPACE: &str = "active_modelling_pipeline";
pub const CANDIDATE_NAMESPACE: &str = "candidate_modelling_pipeline";

const BACKGROUND: [u8; 3] = [16, 16, 32];
const NO_VALUE: [u8; 3] = [128, 128, 128];

/// `model_options` parameters of one modelling namespace
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelOptions {
    /// Numeric columns of `merged_data` to standardise
    pub num_features: Vec<String>,

    /// Categorical columns of `merged_data` to one-hot encode
    #[serde(default)]
    pub cat_features: Vec<String>,

    #[serde(default = "default_map_width")]
    pub map_width: u32,

    #[serde(default = "default_map_height")]
    pub map_height: u32,
}

fn default_map_width() -> u32 {
    360
}

fn default_map_height() -> u32 {
    180
}

impl ModelOptions {
    pub fn from_data(data: &Data) -> Result<Self> {
        let value = data.as_object().context("model_options must be a mapping")?;
        serde_json::from_value(value.clone()).context("Invalid model_options")
    }
}

/// Fitted standardisation of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScale {
    pub name: String,
    pub mean: f64,
    pub scale: f64,
}

/// Fitted standard scaler, saved as an object dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub features: Vec<FeatureScale>,
}

impl StandardScaler {
    /// Fit on the non-null values of each column. A constant column gets
    /// scale 1.
    pub fn fit(table: &Table, features: &[String]) -> Result<Self> {
        let mut fitted = Vec::with_capacity(features.len());
        for name in features {
            let values: Vec<f64> = table.column_f64(name)?.into_iter().flatten().collect();
            if values.is_empty() {
                bail!("Feature '{}' has no numeric values", name);
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            fitted.push(FeatureScale {
                name: name.clone(),
                mean,
                scale: if std > 0.0 { std } else { 1.0 },
            });
        }
        Ok(Self { features: fitted })
    }

    /// Scaled copy of the fitted columns; nulls stay null
    pub fn transform(&self, table: &Table) -> Result<Table> {
        let mut columns: Vec<(String, ArrayRef)> = Vec::with_capacity(self.features.len());
        for feature in &self.features {
            let values = cast(table.column(&feature.name)?.as_ref(), &DataType::Float64)?;
            let centered = sub(&values, &Float64Array::new_scalar(feature.mean))?;
            columns.push((
                feature.name.clone(),
                div(&centered, &Float64Array::new_scalar(feature.scale))?,
            ));
        }
        Ok(Table::from_columns(columns)?)
    }
}

/// Categories seen for one column during fitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCategories {
    pub name: String,
    pub categories: Vec<String>,
}

/// Fitted one-hot encoder, saved as an object dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub features: Vec<FeatureCategories>,
}

impl OneHotEncoder {
    /// Record the distinct non-null values of each column in ascending order
    pub fn fit(table: &Table, features: &[String]) -> Result<Self> {
        let mut fitted = Vec::with_capacity(features.len());
        for name in features {
            let options = SortOptions {
                descending: false,
                nulls_first: false,
            };
            let sorted = sort(table.column(name)?.as_ref(), Some(options))?;
            let labels = cast(&sorted, &DataType::Utf8)?;

            let mut categories: Vec<String> = Vec::new();
            for label in labels.as_string::<i32>().iter().flatten() {
                if categories.last().map(String::as_str) != Some(label) {
                    categories.push(label.to_string());
                }
            }
            fitted.push(FeatureCategories {
                name: name.clone(),
                categories,
            });
        }
        Ok(Self { features: fitted })
    }

    /// One 0/1 column per fitted category, named `<column>_<category>`.
    /// Values not seen during fitting, and nulls, encode as all zeros.
    pub fn transform(&self, table: &Table) -> Result<Table> {
        let mut columns: Vec<(String, ArrayRef)> = Vec::new();
        for feature in &self.features {
            let labels = cast(table.column(&feature.name)?.as_ref(), &DataType::Utf8)?;
            for category in &feature.categories {
                let hits = eq(&labels, &StringArray::new_scalar(category.as_str()))?;
                let indicator: Float64Array = hits
                    .iter()
                    .map(|hit| Some(if hit == Some(true) { 1.0 } else { 0.0 }))
                    .collect();
                columns.push((format!("{}_{}", feature.name, category), Arc::new(indicator)));
            }
        }

        if columns.is_empty() {
            let options = RecordBatchOptions::new().with_row_count(Some(table.len()));
            let batch = RecordBatch::try_new_with_options(Arc::new(Schema::empty()), vec![], &options)?;
            return Ok(Table::new(batch));
        }
        Ok(Table::from_columns(columns)?)
    }
}

pub fn scale_data(merged: &Table, options: &ModelOptions) -> Result<(Table, StandardScaler)> {
    let scaler = StandardScaler::fit(merged, &options.num_features)?;
    let scaled = scaler.transform(merged)?;
    Ok((scaled, scaler))
}

pub fn encode_data(merged: &Table, options: &ModelOptions) -> Result<(Table, OneHotEncoder)> {
    let encoder = OneHotEncoder::fit(merged, &options.cat_features)?;
    let encoded = encoder.transform(merged)?;
    Ok((encoded, encoder))
}

/// Encoded columns followed by scaled columns, row for row
pub fn create_model_data(encoded: &Table, scaled: &Table) -> Result<Table> {
    encoded
        .concat_columns(scaled)
        .context("encoded_data and scaled_data must have the same rows")
}

/// Blue (low) to red (high) over two standard deviations either side
fn heat(z: f64) -> [u8; 3] {
    let t = ((z + 2.0) / 4.0).clamp(0.0, 1.0);
    [(255.0 * t) as u8, 64, (255.0 * (1.0 - t)) as u8]
}

/// Plot each row at its longitude/latitude, colored by its first scaled
/// feature
pub fn visualize_model(merged: &Table, scaled: &Table, options: &ModelOptions) -> Result<ImageData> {
    if merged.len() != scaled.len() {
        bail!(
            "scaled_data has {} rows but merged_data has {}",
            scaled.len(),
            merged.len()
        );
    }

    let latitude = merged.column_f64("LATITUDE")?;
    let longitude = merged.column_f64("LONGITUDE")?;
    let first = match scaled.column_names().first() {
        Some(name) => scaled.column_f64(name)?,
        None => vec![None; scaled.len()],
    };

    let (width, height) = (options.map_width.max(1), options.map_height.max(1));
    let mut image = ImageData::filled(width, height, BACKGROUND);

    for ((lat, lon), z) in latitude.into_iter().zip(longitude).zip(first) {
        let (Some(lat), Some(lon)) = (lat, lon) else {
            continue;
        };
        let x = ((lon + 180.0) / 360.0 * f64::from(width)).floor();
        let y = ((90.0 - lat) / 180.0 * f64::from(height)).floor();
        let x = x.clamp(0.0, f64::from(width - 1)) as u32;
        let y = y.clamp(0.0, f64::from(height - 1)) as u32;
        image.put(x, y, z.map_or(NO_VALUE, heat));
    }

    Ok(image)
}

/// The modelling pipeline before namespacing
fn template() -> Result<Pipeline, PipelineError> {
    Pipeline::new(vec![
        Node::new(
            "scale_data_node",
            |inputs: Vec<Data>| {
                let options = ModelOptions::from_data(inputs.get(1).context("missing model_options")?)?;
                let [merged] = take_tables(inputs.into_iter().take(1).collect())?;
                let (scaled, scaler) = scale_data(&merged, &options)?;
                Ok(vec![scaled.into(), Data::Object(serde_json::to_value(scaler)?)])
            },
            &["merged_data", "params:model_options"],
            &["scaled_data", "scaler"],
        ),
        Node::new(
            "encode_data_node",
            |inputs: Vec<Data>| {
                let options = ModelOptions::from_data(inputs.get(1).context("missing model_options")?)?;
                let [merged] = take_tables(inputs.into_iter().take(1).collect())?;
                let (encoded, encoder) = encode_data(&merged, &options)?;
                Ok(vec![encoded.into(), Data::Object(serde_json::to_value(encoder)?)])
            },
            &["merged_data", "params:model_options"],
            &["encoded_data", "encoder"],
        ),
        Node::new(
            "create_model_data_node",
            |inputs: Vec<Data>| {
                let [encoded, scaled] = take_tables(inputs)?;
                Ok(vec![create_model_data(&encoded, &scaled)?.into()])
            },
            &["encoded_data", "scaled_data"],
            &["model_input_table"],
        ),
        Node::new(
            "visualize_model_node",
            |inputs: Vec<Data>| {
                let options = ModelOptions::from_data(inputs.get(2).context("missing model_options")?)?;
                let [merged, scaled] = take_tables(inputs.into_iter().take(2).collect())?;
                Ok(vec![visualize_model(&merged, &scaled, &options)?.into()])
            },
            &["merged_data", "scaled_data", "params:model_options"],
            &["cluster_map"],
        ),
    ])
}

pub fn create_pipeline() -> Result<Pipeline, PipelineError> {
    let template = template()?;
    let active = template.namespace(ACTIVE_NAMESPACE, &["merged_data"]);
    let candidate = template.namespace(CANDIDATE_NAMESPACE, &["merged_data"]);
    active + candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use serde_json::json;

    fn merged() -> Table {
        Table::from_columns([
            ("WGMS_ID", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
            ("LATITUDE", Arc::new(Float64Array::from(vec![45.0, -45.0, 0.0])) as ArrayRef),
            ("LONGITUDE", Arc::new(Float64Array::from(vec![-90.0, 90.0, 0.0])) as ArrayRef),
            ("AREA", Arc::new(Float64Array::from(vec![Some(1.0), Some(3.0), None])) as ArrayRef),
            ("FORM", Arc::new(Int64Array::from(vec![Some(2), Some(10), None])) as ArrayRef),
        ])
        .unwrap()
    }

    fn options() -> ModelOptions {
        ModelOptions {
            num_features: vec!["AREA".to_string()],
            cat_features: vec!["FORM".to_string()],
            map_width: 36,
            map_height: 18,
        }
    }

    #[test]
    fn test_scaler_ignores_nulls() {
        let (scaled, scaler) = scale_data(&merged(), &options()).unwrap();

        assert_eq!(scaler.features[0].mean, 2.0);
        assert_eq!(scaler.features[0].scale, 1.0);
        assert_eq!(scaled.column_names(), vec!["AREA"]);
        assert_eq!(scaled.column_f64("AREA").unwrap(), vec![Some(-1.0), Some(1.0), None]);
    }

    #[test]
    fn test_constant_feature_gets_unit_scale() {
        let table = Table::from_columns([("X", Arc::new(Int64Array::from(vec![4, 4])) as ArrayRef)]).unwrap();
        let scaler = StandardScaler::fit(&table, &["X".to_string()]).unwrap();
        assert_eq!(scaler.features[0].scale, 1.0);
    }

    #[test]
    fn test_encoder_orders_categories_numerically() {
        let (encoded, encoder) = encode_data(&merged(), &options()).unwrap();

        assert_eq!(encoder.features[0].categories, vec!["2", "10"]);
        assert_eq!(encoded.column_names(), vec!["FORM_2", "FORM_10"]);
        assert_eq!(encoded.column_f64("FORM_2").unwrap(), vec![Some(1.0), Some(0.0), Some(0.0)]);
        assert_eq!(encoded.column_f64("FORM_10").unwrap(), vec![Some(0.0), Some(1.0), Some(0.0)]);
    }

    #[test]
    fn test_encoder_ignores_unknown_categories() {
        let (_, encoder) = encode_data(&merged(), &options()).unwrap();
        let later = Table::from_columns([("FORM", Arc::new(Int64Array::from(vec![10, 7])) as ArrayRef)]).unwrap();

        let encoded = encoder.transform(&later).unwrap();
        assert_eq!(encoded.column_f64("FORM_2").unwrap(), vec![Some(0.0), Some(0.0)]);
        assert_eq!(encoded.column_f64("FORM_10").unwrap(), vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn test_no_categorical_features_keeps_row_count() {
        let options = ModelOptions {
            cat_features: Vec::new(),
            ..options()
        };
        let (encoded, _) = encode_data(&merged(), &options).unwrap();
        assert_eq!((encoded.len(), encoded.num_columns()), (3, 0));
    }

    #[test]
    fn test_model_input_concatenates_columns() {
        let merged = merged();
        let (scaled, _) = scale_data(&merged, &options()).unwrap();
        let (encoded, _) = encode_data(&merged, &options()).unwrap();

        let model_input = create_model_data(&encoded, &scaled).unwrap();
        assert_eq!(model_input.column_names(), vec!["FORM_2", "FORM_10", "AREA"]);
        assert_eq!(model_input.len(), 3);

        let short = merged.filter_at_least("AREA", 2.0).unwrap();
        assert!(create_model_data(&encoded, &short).is_err());
    }

    #[test]
    fn test_map_plots_positions() {
        let merged = merged();
        let (scaled, _) = scale_data(&merged, &options()).unwrap();
        let image = visualize_model(&merged, &scaled, &options()).unwrap();

        assert_eq!((image.width, image.height), (36, 18));
        assert_eq!(image.get(9, 4), Some(heat(-1.0)));
        assert_eq!(image.get(27, 13), Some(heat(1.0)));
        assert_eq!(image.get(18, 9), Some(NO_VALUE));
        assert_eq!(image.get(0, 0), Some(BACKGROUND));
    }

    #[test]
    fn test_options_from_parameters() {
        let data = Data::Object(json!({"num_features": ["AREA", "LENGTH"]}));
        let options = ModelOptions::from_data(&data).unwrap();
        assert_eq!(options.map_width, 360);
        assert!(options.cat_features.is_empty());
        assert!(ModelOptions::from_data(&Data::Object(json!({"n_clusters": 3}))).is_err());
    }

    #[test]
    fn test_namespaced_pipelines_share_merged_data() {
        let pipeline = create_pipeline().unwrap();
        assert_eq!(pipeline.len(), 8);
        assert_eq!(
            pipeline.inputs().into_iter().collect::<Vec<_>>(),
            vec![
                "merged_data",
                "params:active_modelling_pipeline.model_options",
                "params:candidate_modelling_pipeline.model_options",
            ]
        );
        assert!(pipeline.node("active_modelling_pipeline.scale_data_node").is_some());
        assert!(pipeline
            .node("candidate_modelling_pipeline.create_model_data_node")
            .is_some());
        let outputs = pipeline.outputs();
        assert!(outputs.contains("candidate_modelling_pipeline.cluster_map"));
        assert!(outputs.contains("active_modelling_pipeline.model_input_table"));
        assert!(outputs.contains("active_modelling_pipeline.encoder"));
    }
}

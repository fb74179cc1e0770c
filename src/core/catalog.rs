//! The data catalog.
//!
//! Maps logical dataset names to storage backends. Nodes only ever see
//! names; the catalog decides where and how each value is stored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::Data;

use super::datasets::{Dataset, DatasetError, FileDataset, FileFormat, MemoryDataset, Version};
use super::node::{PARAMETERS, PARAMS_PREFIX};
use super::pipeline::Pipeline;

/// Placeholder that turns a catalog key into a pattern
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Errors raised by catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("dataset '{0}' is not registered in the catalog")]
    Unknown(String),

    #[error("failed to load dataset '{name}': {source}")]
    Load {
        name: String,
        #[source]
        source: DatasetError,
    },

    #[error("failed to save dataset '{name}': {source}")]
    Save {
        name: String,
        #[source]
        source: DatasetError,
    },

    #[error("invalid catalog entry '{name}': {message}")]
    Config { name: String, message: String },
}

/// Storage backend type of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Csv,
    Columnar,
    Object,
    Image,
    Memory,
}

/// One catalog entry as written in `catalog.yml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(rename = "type")]
    pub kind: DatasetKind,

    /// File location, relative to the project root unless absolute
    #[serde(default)]
    pub filepath: Option<String>,

    /// Keep every save as a new timestamped version
    #[serde(default)]
    pub versioned: bool,

    /// CSV field delimiter (default `,`)
    #[serde(default)]
    pub delimiter: Option<char>,
}

/// A catalog key containing `{name}`
#[derive(Debug, Clone)]
struct DatasetPattern {
    key: String,
    glob: Pattern,
    prefix_len: usize,
    suffix_len: usize,
    config: DatasetConfig,
}

impl DatasetPattern {
    fn new(key: &str, config: DatasetConfig) -> Result<Self, CatalogError> {
        let (prefix, suffix) = key.split_once(NAME_PLACEHOLDER).ok_or_else(|| CatalogError::Config {
            name: key.to_string(),
            message: "pattern has no {name} placeholder".to_string(),
        })?;
        let glob = Pattern::new(&format!("{}*{}", Pattern::escape(prefix), Pattern::escape(suffix)))
            .map_err(|e| CatalogError::Config {
                name: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            key: key.to_string(),
            glob,
            prefix_len: prefix.len(),
            suffix_len: suffix.len(),
            config,
        })
    }

    /// The `{name}` part of `dataset`, if it matches
    fn capture<'a>(&self, dataset: &'a str) -> Option<&'a str> {
        if dataset.len() <= self.prefix_len + self.suffix_len || !self.glob.matches(dataset) {
            return None;
        }
        Some(&dataset[self.prefix_len..dataset.len() - self.suffix_len])
    }
}

/// Registry of named datasets
#[derive(Debug, Clone, Default)]
pub struct DataCatalog {
    datasets: BTreeMap<String, Arc<dyn Dataset>>,
    patterns: Vec<DatasetPattern>,
    root: PathBuf,
    save_version: Option<String>,
    load_versions: HashMap<String, String>,
}

impl DataCatalog {
    /// Empty catalog rooted at the current directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from configuration entries.
    ///
    /// `save_version` is shared by every versioned dataset saved through this
    /// catalog; `load_versions` pins individual datasets to a stored version.
    pub fn from_config(
        entries: &BTreeMap<String, DatasetConfig>,
        root: &Path,
        save_version: Option<String>,
        load_versions: HashMap<String, String>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self {
            root: root.to_path_buf(),
            save_version,
            load_versions,
            ..Self::default()
        };

        for (name, config) in entries {
            if name.contains(NAME_PLACEHOLDER) {
                catalog.patterns.push(DatasetPattern::new(name, config.clone())?);
            } else {
                let dataset = catalog.build(name, config, None)?;
                catalog.datasets.insert(name.clone(), dataset);
            }
        }

        for pinned in catalog.load_versions.keys() {
            if !catalog.datasets.contains_key(pinned) && catalog.match_pattern(pinned).is_none() {
                return Err(CatalogError::Unknown(pinned.clone()));
            }
        }

        Ok(catalog)
    }

    fn build(
        &self,
        name: &str,
        config: &DatasetConfig,
        captured: Option<&str>,
    ) -> Result<Arc<dyn Dataset>, CatalogError> {
        let format = match config.kind {
            DatasetKind::Memory => return Ok(Arc::new(MemoryDataset::new())),
            DatasetKind::Csv => {
                let delimiter = config.delimiter.unwrap_or(',');
                if !delimiter.is_ascii() {
                    return Err(CatalogError::Config {
                        name: name.to_string(),
                        message: format!("delimiter '{}' is not ASCII", delimiter),
                    });
                }
                FileFormat::Csv {
                    delimiter: delimiter as u8,
                }
            }
            DatasetKind::Columnar => FileFormat::Columnar,
            DatasetKind::Object => FileFormat::Object,
            DatasetKind::Image => FileFormat::Image,
        };

        let raw = config.filepath.as_deref().ok_or_else(|| CatalogError::Config {
            name: name.to_string(),
            message: "file-backed dataset requires a filepath".to_string(),
        })?;
        let raw = match captured {
            Some(value) => raw.replace(NAME_PLACEHOLDER, value),
            None => raw.to_string(),
        };
        let path = PathBuf::from(&raw);
        let path = if path.is_absolute() { path } else { self.root.join(path) };

        let mut dataset = FileDataset::new(path, format);
        if config.versioned {
            dataset = dataset.versioned(Version {
                load: self.load_versions.get(name).cloned(),
                save: self.save_version.clone(),
            });
        }
        Ok(Arc::new(dataset))
    }

    fn match_pattern(&self, name: &str) -> Option<(&DatasetPattern, String)> {
        self.patterns
            .iter()
            .find_map(|p| p.capture(name).map(|c| (p, c.to_string())))
    }

    /// Look up a dataset, materialising pattern matches on demand
    pub fn get(&self, name: &str) -> Result<Arc<dyn Dataset>, CatalogError> {
        if let Some(dataset) = self.datasets.get(name) {
            return Ok(Arc::clone(dataset));
        }
        match self.match_pattern(name) {
            Some((pattern, captured)) => {
                debug!(dataset = name, pattern = %pattern.key, "Resolved dataset from pattern");
                self.build(name, &pattern.config, Some(&captured))
            }
            None => Err(CatalogError::Unknown(name.to_string())),
        }
    }

    /// Whether `name` is declared or matches a pattern
    pub fn contains(&self, name: &str) -> bool {
        self.datasets.contains_key(name) || self.match_pattern(name).is_some()
    }

    /// Register (or replace) a dataset
    pub fn add(&mut self, name: impl Into<String>, dataset: Arc<dyn Dataset>) {
        self.datasets.insert(name.into(), dataset);
    }

    /// Register `parameters` and a `params:<path>` entry for every nested key
    pub fn add_parameters(&mut self, parameters: &Value) {
        self.add(PARAMETERS, Arc::new(MemoryDataset::with_data(Data::Object(parameters.clone()))));

        let mut stack: Vec<(String, &Value)> = Vec::new();
        if let Value::Object(map) = parameters {
            stack.extend(map.iter().map(|(k, v)| (k.clone(), v)));
        }
        while let Some((path, value)) = stack.pop() {
            if let Value::Object(map) = value {
                stack.extend(map.iter().map(|(k, v)| (format!("{}.{}", path, k), v)));
            }
            self.add(
                format!("{}{}", PARAMS_PREFIX, path),
                Arc::new(MemoryDataset::with_data(Data::Object(value.clone()))),
            );
        }
    }

    /// Copy of this catalog in which every dataset the pipeline mentions is
    /// registered; undeclared names not matching a pattern become memory
    /// datasets. Pattern matches are materialised so they are shared.
    pub fn with_defaults(&self, pipeline: &Pipeline) -> Result<DataCatalog, CatalogError> {
        let mut catalog = self.clone();
        for name in pipeline.datasets() {
            if catalog.datasets.contains_key(&name) {
                continue;
            }
            let dataset = match self.match_pattern(&name) {
                Some(_) => self.get(&name)?,
                None => {
                    debug!(dataset = %name, "Using default memory dataset");
                    Arc::new(MemoryDataset::new()) as Arc<dyn Dataset>
                }
            };
            catalog.datasets.insert(name, dataset);
        }
        Ok(catalog)
    }

    pub async fn load(&self, name: &str) -> Result<Data, CatalogError> {
        let dataset = self.get(name)?;
        debug!(dataset = name, kind = %dataset.describe(), "Loading");
        dataset.load().await.map_err(|source| CatalogError::Load {
            name: name.to_string(),
            source,
        })
    }

    pub async fn save(&self, name: &str, data: Data) -> Result<(), CatalogError> {
        let dataset = self.get(name)?;
        debug!(dataset = name, kind = %dataset.describe(), "Saving");
        dataset.save(data).await.map_err(|source| CatalogError::Save {
            name: name.to_string(),
            source,
        })
    }

    pub async fn exists(&self, name: &str) -> Result<bool, CatalogError> {
        let dataset = self.get(name)?;
        dataset.exists().await.map_err(|source| CatalogError::Load {
            name: name.to_string(),
            source,
        })
    }

    pub async fn release(&self, name: &str) -> Result<(), CatalogError> {
        self.get(name)?.release().await;
        Ok(())
    }

    /// Whether `name` is registered as an in-process dataset
    pub fn is_memory(&self, name: &str) -> bool {
        self.datasets.get(name).is_some_and(|d| d.is_memory())
    }

    /// Declared datasets and patterns with their descriptions
    pub fn list(&self) -> Vec<(String, String)> {
        let mut listed: Vec<(String, String)> = self
            .datasets
            .iter()
            .map(|(name, ds)| (name.clone(), ds.describe()))
            .collect();
        listed.extend(
            self.patterns
                .iter()
                .map(|p| (p.key.clone(), format!("pattern: {:?}", p.config.kind).to_lowercase())),
        );
        listed
    }

    pub fn save_version(&self) -> Option<&str> {
        self.save_version.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::Node;
    use serde_json::json;
    use tempfile::TempDir;

    const CATALOG_YAML: &str = r#"
glacier:
  type: csv
  filepath: data/01_raw/glacier.csv
  delimiter: ";"

merged_data:
  type: columnar
  filepath: data/03_primary/merged_data.parquet

"{name}.scaler":
  type: object
  filepath: data/06_models/{name}/scaler.cbor
  versioned: true
"#;

    fn entries() -> BTreeMap<String, DatasetConfig> {
        serde_yaml::from_str(CATALOG_YAML).unwrap()
    }

    #[test]
    fn test_config_parsing() {
        let entries = entries();
        assert_eq!(entries["glacier"].kind, DatasetKind::Csv);
        assert_eq!(entries["glacier"].delimiter, Some(';'));
        assert!(entries["{name}.scaler"].versioned);
    }

    #[tokio::test]
    async fn test_pattern_resolution() {
        let temp = TempDir::new().unwrap();
        let catalog = DataCatalog::from_config(
            &entries(),
            temp.path(),
            Some("2024-01-01T00.00.00.000Z".to_string()),
            HashMap::new(),
        )
        .unwrap();

        assert!(catalog.contains("active.scaler"));
        assert!(!catalog.contains(".scaler"));
        assert!(!catalog.contains("scaled_data"));

        catalog
            .save("active.scaler", Data::Object(json!({"mean": 1.0})))
            .await
            .unwrap();
        assert!(temp
            .path()
            .join("data/06_models/active/scaler.cbor/2024-01-01T00.00.00.000Z/scaler.cbor")
            .is_file());
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let catalog = DataCatalog::new();
        let err = catalog.load("nothing").await.unwrap_err();
        assert!(matches!(err, CatalogError::Unknown(ref n) if n == "nothing"));
    }

    #[test]
    fn test_file_dataset_requires_filepath() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "broken".to_string(),
            DatasetConfig {
                kind: DatasetKind::Csv,
                filepath: None,
                versioned: false,
                delimiter: None,
            },
        );
        let err = DataCatalog::from_config(&entries, Path::new("."), None, HashMap::new()).unwrap_err();
        assert!(matches!(err, CatalogError::Config { .. }));
    }

    #[test]
    fn test_pinned_version_must_be_known() {
        let pins: HashMap<String, String> = [("nope".to_string(), "v1".to_string())].into_iter().collect();
        let err = DataCatalog::from_config(&entries(), Path::new("."), None, pins).unwrap_err();
        assert!(matches!(err, CatalogError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_parameters_are_flattened() {
        let mut catalog = DataCatalog::new();
        catalog.add_parameters(&json!({
            "active": {"model_options": {"n_clusters": 4}},
            "seed": 7
        }));

        assert_eq!(catalog.load("params:seed").await.unwrap(), Data::Object(json!(7)));
        assert_eq!(
            catalog.load("params:active.model_options.n_clusters").await.unwrap(),
            Data::Object(json!(4))
        );
        assert_eq!(
            catalog.load("params:active.model_options").await.unwrap(),
            Data::Object(json!({"n_clusters": 4}))
        );
        assert!(catalog.load("parameters").await.is_ok());
    }

    #[tokio::test]
    async fn test_with_defaults_adds_memory_datasets() {
        let catalog = DataCatalog::from_config(&entries(), Path::new("."), None, HashMap::new()).unwrap();
        let pipeline = Pipeline::new(vec![Node::new(
            "n",
            |inputs| Ok(inputs),
            &["merged_data"],
            &["scaled_data"],
        )])
        .unwrap();

        let full = catalog.with_defaults(&pipeline).unwrap();
        assert!(full.is_memory("scaled_data"));
        assert!(!full.is_memory("merged_data"));
        assert!(!catalog.contains("scaled_data"));
    }
}

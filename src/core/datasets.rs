//! Dataset implementations behind the catalog.
//!
//! File-backed datasets share one layout rule: an unversioned dataset lives
//! at its `filepath`; a versioned one stores each save under
//! `<filepath>/<version>/<file name>` and never overwrites.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::error::ArrowError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::{Data, ImageData, Table};

/// Errors raised by a single dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no data: {0}")]
    Missing(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data at {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    #[error("cannot store {actual} in a {expected} dataset")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("version already exists: {}", .0.display())]
    VersionExists(PathBuf),

    #[error("versioned dataset {} has no save version", .0.display())]
    NoSaveVersion(PathBuf),
}

/// Storage backend for one named dataset
#[async_trait]
pub trait Dataset: Send + Sync + fmt::Debug {
    async fn load(&self) -> Result<Data, DatasetError>;

    async fn save(&self, data: Data) -> Result<(), DatasetError>;

    async fn exists(&self) -> Result<bool, DatasetError>;

    /// Drop any cached value
    async fn release(&self) {}

    /// One-line description for listings
    fn describe(&self) -> String;

    /// Whether the value lives only in this process
    fn is_memory(&self) -> bool {
        false
    }
}

/// Save-version timestamp, e.g. `2024-03-01T09.15.02.417Z`
pub fn generate_version() -> String {
    Utc::now().format("%Y-%m-%dT%H.%M.%S%.3fZ").to_string()
}

// ============================================================================
// Memory
// ============================================================================

/// In-process dataset; the default for names the catalog does not declare
#[derive(Debug, Default)]
pub struct MemoryDataset {
    data: RwLock<Option<Data>>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Data) -> Self {
        Self {
            data: RwLock::new(Some(data)),
        }
    }
}

#[async_trait]
impl Dataset for MemoryDataset {
    async fn load(&self) -> Result<Data, DatasetError> {
        self.data
            .read()
            .await
            .clone()
            .ok_or_else(|| DatasetError::Missing("memory dataset is empty".to_string()))
    }

    async fn save(&self, data: Data) -> Result<(), DatasetError> {
        *self.data.write().await = Some(data);
        Ok(())
    }

    async fn exists(&self) -> Result<bool, DatasetError> {
        Ok(self.data.read().await.is_some())
    }

    async fn release(&self) {
        *self.data.write().await = None;
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn is_memory(&self) -> bool {
        true
    }
}

// ============================================================================
// Files
// ============================================================================

/// On-disk encoding of a file-backed dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Header row plus records; column types are inferred on load
    Csv { delimiter: u8 },
    /// Parquet file
    Columnar,
    /// Any object, CBOR encoded
    Object,
    /// PNG image
    Image,
}

impl FileFormat {
    fn name(&self) -> &'static str {
        match self {
            FileFormat::Csv { .. } => "csv",
            FileFormat::Columnar => "columnar",
            FileFormat::Object => "object",
            FileFormat::Image => "image",
        }
    }
}

/// Version selection for a versioned dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version {
    /// Pinned version to load; latest when unset
    pub load: Option<String>,
    /// Version to write on save
    pub save: Option<String>,
}

/// A dataset stored in a single file
#[derive(Debug)]
pub struct FileDataset {
    filepath: PathBuf,
    format: FileFormat,
    version: Option<Version>,
}

impl FileDataset {
    pub fn new(filepath: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            filepath: filepath.into(),
            format,
            version: None,
        }
    }

    pub fn versioned(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    fn file_name(&self) -> PathBuf {
        self.filepath
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Versions present on disk, oldest first
    pub async fn list_versions(&self) -> Result<Vec<String>, DatasetError> {
        if !self.filepath.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.filepath).await.map_err(|source| DatasetError::Io {
            path: self.filepath.clone(),
            source,
        })?;

        let file_name = self.file_name();
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| DatasetError::Io {
            path: self.filepath.clone(),
            source,
        })? {
            let path = entry.path();
            if path.join(&file_name).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    versions.push(name.to_string());
                }
            }
        }

        // Timestamps sort lexically.
        versions.sort();
        Ok(versions)
    }

    async fn resolve_load_path(&self) -> Result<PathBuf, DatasetError> {
        let Some(version) = &self.version else {
            return Ok(self.filepath.clone());
        };

        let chosen = match &version.load {
            Some(pinned) => pinned.clone(),
            None => self.list_versions().await?.pop().ok_or_else(|| {
                DatasetError::Missing(format!("no versions under {}", self.filepath.display()))
            })?,
        };

        Ok(self.filepath.join(chosen).join(self.file_name()))
    }

    fn resolve_save_path(&self) -> Result<PathBuf, DatasetError> {
        let Some(version) = &self.version else {
            return Ok(self.filepath.clone());
        };

        let save = version
            .save
            .as_ref()
            .ok_or_else(|| DatasetError::NoSaveVersion(self.filepath.clone()))?;
        let path = self.filepath.join(save).join(self.file_name());
        if path.exists() {
            return Err(DatasetError::VersionExists(path));
        }
        Ok(path)
    }

    fn decode(&self, path: &Path, bytes: Vec<u8>) -> Result<Data, DatasetError> {
        let malformed = |message: String| DatasetError::Format {
            path: path.to_path_buf(),
            message,
        };

        match self.format {
            FileFormat::Csv { delimiter } => {
                let table = read_csv(&bytes, delimiter).map_err(|e| malformed(e.to_string()))?;
                Ok(Data::Table(table))
            }
            FileFormat::Columnar => {
                let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
                    .map_err(|e| malformed(e.to_string()))?;
                let schema = builder.schema().clone();
                let reader = builder.build().map_err(|e| malformed(e.to_string()))?;
                let batches = reader
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| malformed(e.to_string()))?;
                let batch = concat_batches(&schema, &batches).map_err(|e| malformed(e.to_string()))?;
                Ok(Data::Table(Table::new(batch)))
            }
            FileFormat::Object => {
                let value: Value = ciborium::from_reader(bytes.as_slice()).map_err(|e| malformed(e.to_string()))?;
                Ok(Data::Object(value))
            }
            FileFormat::Image => {
                let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
                    .map_err(|e| malformed(e.to_string()))?
                    .to_rgb8();
                Ok(Data::Image(ImageData {
                    width: decoded.width(),
                    height: decoded.height(),
                    pixels: decoded.into_raw(),
                }))
            }
        }
    }

    fn encode(&self, path: &Path, data: Data) -> Result<Vec<u8>, DatasetError> {
        let malformed = |message: String| DatasetError::Format {
            path: path.to_path_buf(),
            message,
        };
        let wrong_kind = |data: &Data| DatasetError::WrongKind {
            expected: self.format.name(),
            actual: data.kind(),
        };

        match (self.format, data) {
            (FileFormat::Csv { delimiter }, Data::Table(table)) => {
                let mut writer = WriterBuilder::new()
                    .with_header(true)
                    .with_delimiter(delimiter)
                    .build(Vec::new());
                writer
                    .write(table.batch())
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(writer.into_inner())
            }
            (FileFormat::Columnar, Data::Table(table)) => {
                let mut writer = ArrowWriter::try_new(Vec::new(), table.schema(), None)
                    .map_err(|e| malformed(e.to_string()))?;
                writer
                    .write(table.batch())
                    .map_err(|e| malformed(e.to_string()))?;
                writer.into_inner().map_err(|e| malformed(e.to_string()))
            }
            (FileFormat::Object, Data::Object(value)) => {
                let mut bytes = Vec::new();
                ciborium::into_writer(&value, &mut bytes).map_err(|e| malformed(e.to_string()))?;
                Ok(bytes)
            }
            (FileFormat::Image, Data::Image(img)) => {
                let buffer = image::RgbImage::from_raw(img.width, img.height, img.pixels)
                    .ok_or_else(|| malformed("pixel buffer does not match dimensions".to_string()))?;
                let mut bytes = Cursor::new(Vec::new());
                buffer
                    .write_to(&mut bytes, image::ImageFormat::Png)
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(bytes.into_inner())
            }
            (_, other) => Err(wrong_kind(&other)),
        }
    }
}

/// Parse a delimited file with a header row, inferring column types
fn read_csv(bytes: &[u8], delimiter: u8) -> Result<Table, ArrowError> {
    let format = Format::default().with_header(true).with_delimiter(delimiter);
    let (schema, _) = format.infer_schema(Cursor::new(bytes), None)?;
    let schema = Arc::new(schema);
    let batches = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .build(Cursor::new(bytes))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Table::new(concat_batches(&schema, &batches)?))
}

#[async_trait]
impl Dataset for FileDataset {
    async fn load(&self) -> Result<Data, DatasetError> {
        let path = self.resolve_load_path().await?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::Missing(format!("file not found: {}", path.display())));
            }
            Err(source) => return Err(DatasetError::Io { path, source }),
        };
        self.decode(&path, bytes)
    }

    async fn save(&self, data: Data) -> Result<(), DatasetError> {
        let path = self.resolve_save_path()?;
        let bytes = self.encode(&path, data)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| DatasetError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        fs::write(&path, bytes)
            .await
            .map_err(|source| DatasetError::Io { path, source })
    }

    async fn exists(&self) -> Result<bool, DatasetError> {
        match self.resolve_load_path().await {
            Ok(path) => Ok(path.is_file()),
            Err(DatasetError::Missing(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        let versioned = if self.version.is_some() { ", versioned" } else { "" };
        format!("{} ({}{})", self.format.name(), self.filepath.display(), versioned)
    }
}

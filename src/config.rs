//! Project configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (`--params`, `--address`, `--load-version`)
//! 2. Environment variables (GLACIER_HOME, GLACIER_SCHEDULER_ADDRESS)
//! 3. `conf/<env>/*.yml` where env is `--env`, GLACIER_ENV or `local`
//! 4. `conf/base/*.yml`
//!
//! Project discovery:
//! - Searches the current directory and its parents for `conf/base`
//! - Relative dataset paths resolve against the project root

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::adapters::ClientSettings;
use crate::core::catalog::{DataCatalog, DatasetConfig};

/// Environment every other environment is layered on
pub const BASE_ENV: &str = "base";

/// Environment used when none is given
pub const DEFAULT_ENV: &str = "local";

pub const CONF_DIR: &str = "conf";
pub const CATALOG_FILE: &str = "catalog.yml";
pub const PARAMETERS_FILE: &str = "parameters.yml";
pub const SCHEDULER_FILE: &str = "scheduler.yml";

pub const ENV_VAR: &str = "GLACIER_ENV";
pub const HOME_VAR: &str = "GLACIER_HOME";
pub const ADDRESS_VAR: &str = "GLACIER_SCHEDULER_ADDRESS";

/// Fully merged configuration of one project environment
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// Project root (the directory holding `conf/`)
    pub root: PathBuf,

    /// Active environment
    pub env: String,

    /// Engine state directory (session logs)
    pub home: PathBuf,

    /// Dataset declarations, env entries replacing base entries by name
    pub catalog: BTreeMap<String, DatasetConfig>,

    /// Parameter tree, env deep-merged over base
    pub parameters: Value,

    /// Execution client settings
    pub scheduler: ClientSettings,

    /// Configuration files that were read, in load order
    pub files: Vec<PathBuf>,
}

/// Pick the environment: explicit flag, then GLACIER_ENV, then `local`
pub fn resolve_env(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(ENV_VAR).ok().filter(|e| !e.is_empty()))
        .unwrap_or_else(|| DEFAULT_ENV.to_string())
}

/// Find the project root by searching `start` and its parents for `conf/base`
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        if current.join(CONF_DIR).join(BASE_ENV).is_dir() {
            return Some(current);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Resolve a path that may be relative to `base`; `~/` expands to the user's home
pub fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Recursively merge `overlay` into `base`; non-mapping values are replaced
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Set the dotted `key` in `params` to `raw`, parsed as a YAML scalar
pub fn apply_param_override(params: &mut Value, key: &str, raw: &str) -> Result<()> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        bail!("Invalid parameter key: '{}'", key);
    }

    let value: Value = serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let mut overlay = value;
    for part in key.rsplit('.') {
        let mut map = serde_json::Map::new();
        map.insert(part.to_string(), overlay);
        overlay = Value::Object(map);
    }
    if !params.is_object() {
        *params = Value::Object(serde_json::Map::new());
    }
    merge_values(params, overlay);
    Ok(())
}

/// Split `key<sep>value`, rejecting empty halves
pub fn split_pair(input: &str, sep: char) -> Result<(String, String)> {
    match input.split_once(sep) {
        Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
            Ok((k.trim().to_string(), v.trim().to_string()))
        }
        _ => bail!("Expected '<key>{}<value>', got '{}'", sep, input),
    }
}

fn read_yaml(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(Some(value))
}

impl ProjectConfig {
    /// Discover the project from the current directory and load `env`
    pub fn discover(env: Option<&str>) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let root = find_project_root(&cwd).with_context(|| {
            format!(
                "No project found: neither {} nor any parent contains {}/{}",
                cwd.display(),
                CONF_DIR,
                BASE_ENV
            )
        })?;
        Self::load(&root, env)
    }

    /// Load and merge `conf/base` and `conf/<env>` under `root`
    pub fn load(root: &Path, env: Option<&str>) -> Result<Self> {
        let env = resolve_env(env);
        let conf = root.join(CONF_DIR);
        let base_dir = conf.join(BASE_ENV);
        if !base_dir.is_dir() {
            bail!("Missing base configuration directory: {}", base_dir.display());
        }

        let mut layers = vec![base_dir];
        if env != BASE_ENV {
            let env_dir = conf.join(&env);
            if env_dir.is_dir() {
                layers.push(env_dir);
            } else if env != DEFAULT_ENV {
                bail!("Unknown environment '{}': {} does not exist", env, env_dir.display());
            }
        }

        let mut catalog = BTreeMap::new();
        let mut parameters = Value::Object(serde_json::Map::new());
        let mut scheduler = Value::Object(serde_json::Map::new());
        let mut files = Vec::new();

        for layer in &layers {
            let path = layer.join(CATALOG_FILE);
            if let Some(value) = read_yaml(&path)? {
                let entries: BTreeMap<String, DatasetConfig> = serde_json::from_value(value)
                    .with_context(|| format!("Invalid catalog entry in {}", path.display()))?;
                catalog.extend(entries);
                files.push(path);
            }

            let path = layer.join(PARAMETERS_FILE);
            if let Some(value) = read_yaml(&path)? {
                merge_values(&mut parameters, value);
                files.push(path);
            }

            let path = layer.join(SCHEDULER_FILE);
            if let Some(value) = read_yaml(&path)? {
                merge_values(&mut scheduler, value);
                files.push(path);
            }
        }

        let mut scheduler: ClientSettings =
            serde_json::from_value(scheduler).context("Invalid scheduler configuration")?;
        if let Ok(address) = std::env::var(ADDRESS_VAR) {
            if !address.is_empty() {
                scheduler.address = address;
            }
        }

        let home = match std::env::var(HOME_VAR) {
            Ok(home) if !home.is_empty() => resolve_path(root, &home),
            _ => root.join(".glacier"),
        };

        debug!(root = %root.display(), env = %env, files = files.len(), "Loaded project configuration");

        Ok(Self {
            root: root.to_path_buf(),
            env,
            home,
            catalog,
            parameters,
            scheduler,
            files,
        })
    }

    /// Directory holding one subdirectory per session
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Parameters with command-line overrides applied
    pub fn parameters_with(&self, overrides: &Value) -> Value {
        let mut parameters = self.parameters.clone();
        if overrides.is_object() {
            merge_values(&mut parameters, overrides.clone());
        }
        parameters
    }

    /// Build the data catalog for one run
    pub fn build_catalog(
        &self,
        save_version: &str,
        load_versions: &HashMap<String, String>,
        overrides: &Value,
    ) -> Result<DataCatalog> {
        let mut catalog = DataCatalog::from_config(
            &self.catalog,
            &self.root,
            Some(save_version.to_string()),
            load_versions.clone(),
        )
        .with_context(|| format!("Failed to build catalog for environment '{}'", self.env))?;
        catalog.add_parameters(&self.parameters_with(overrides));
        Ok(catalog)
    }
}

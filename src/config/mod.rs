//! Read-only configuration view consumed by the execution harness.
//!
//! The full merge/interpolation pipeline lives outside this crate. The harness
//! only needs a dotted-key lookup, a homogenized variables map to hand to
//! terraform, and the location of the config root. [`Config`] is the loader
//! used by the binary: it reads `config/atmos.yml` as-is.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "atmos.yml";
const CONFIG_DIR: &str = "config";

/// Read-only key-value view supplied by the configuration subsystem.
pub trait ConfigView: Send + Sync {
    /// Look up a dotted key path such as `atmos.terraform.command`.
    fn value(&self, key: &str) -> Option<&Value>;

    /// Variables handed to terraform, with values reduced to plain JSON.
    fn homogenized_vars(&self) -> Map<String, Value>;

    /// Directory the configuration was loaded from.
    fn root_dir(&self) -> &Path;

    /// The primary config file, when one was found.
    fn config_file(&self) -> Option<&Path>;
}

/// Settings the harness reads from the `atmos` section.
///
/// ```yaml
/// atmos:
///   tmp_root: tmp
///   terraform:
///     command: terraform
///     compat11: false
///   ipc:
///     disable: false
///   filters:
///     disabled: [json_diff]
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_tmp_root")]
    pub tmp_root: String,
    #[serde(default)]
    pub terraform: TerraformSettings,
    #[serde(default)]
    pub ipc: IpcSettings,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(default)]
    pub filters: FilterSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TerraformSettings {
    #[serde(default = "default_terraform_command")]
    pub command: String,
    /// Flatten nested variables for consumers that predate complex types.
    #[serde(default)]
    pub compat11: bool,
    #[serde(default)]
    pub disable_shared_plugins: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct IpcSettings {
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct UiSettings {
    #[serde(default)]
    pub notify: NotifySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifySettings {
    #[serde(default)]
    pub disable: bool,
    /// Command template; `{{title}}`, `{{message}}` and `{{modal}}` are
    /// substituted in each argument.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct FilterSettings {
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_tmp_root() -> String {
    "tmp".to_string()
}

fn default_terraform_command() -> String {
    "terraform".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tmp_root: default_tmp_root(),
            terraform: TerraformSettings::default(),
            ipc: IpcSettings::default(),
            ui: UiSettings::default(),
            filters: FilterSettings::default(),
        }
    }
}

impl Default for TerraformSettings {
    fn default() -> Self {
        Self {
            command: default_terraform_command(),
            compat11: false,
            disable_shared_plugins: false,
        }
    }
}

impl Settings {
    /// Deserialize the `atmos` section of a view, falling back to defaults.
    pub fn from_view(view: &dyn ConfigView) -> Result<Self> {
        match view.value("atmos") {
            Some(section) => {
                serde_json::from_value(section.clone()).context("invalid `atmos` settings")
            }
            None => Ok(Self::default()),
        }
    }
}

/// Configuration loaded from `config/atmos.yml`.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_file: Option<PathBuf>,
    data: Value,
}

impl Config {
    /// Search upward from `start` for `config/atmos.yml` and load it.
    /// An empty configuration rooted at `start` is returned when none exists.
    pub fn load(start: &Path) -> Result<Self> {
        let Some(path) = Self::find_config_file(start) else {
            return Ok(Self::from_value(start, Value::Object(Map::new())));
        };

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let data: Value = if contents.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        };

        // config/atmos.yml -> root is the parent of config/
        let root = path
            .parent()
            .and_then(Path::parent)
            .unwrap_or(start)
            .to_path_buf();

        Ok(Self {
            root,
            config_file: Some(path),
            data,
        })
    }

    /// Build a configuration from an in-memory value.
    pub fn from_value(root: &Path, data: Value) -> Self {
        Self {
            root: root.to_path_buf(),
            config_file: None,
            data,
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

impl ConfigView for Config {
    fn value(&self, key: &str) -> Option<&Value> {
        lookup(&self.data, key)
    }

    fn homogenized_vars(&self) -> Map<String, Value> {
        match homogenize(&self.data) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn root_dir(&self) -> &Path {
        &self.root
    }

    fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }
}

/// Walk a dotted key path through nested objects.
pub fn lookup<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Drop null entries so the variables file only carries concrete values.
fn homogenize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), homogenize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(homogenize).collect()),
        other => other.clone(),
    }
}

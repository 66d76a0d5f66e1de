//! Preparing the terraform working directory before each run.
//!
//! Every run rebuilds the symlinks and generated files from configuration,
//! so edits to recipes or variables take effect without manual cleanup.
//! Terraform's own module and provider caches survive between runs.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::config::{ConfigView, Settings};
use crate::paths::RunPaths;

pub const RECIPES_DIR: &str = "recipes";
pub const VARS_FILE: &str = "atmos.auto.tfvars.json";
pub const BACKEND_FILE: &str = "atmos-backend.tf.json";
pub const DEFAULT_STATE_KEY: &str = "terraform.tfstate";

const SUPPORT_DIRS: &[&str] = &["modules", "templates"];
const CACHE_DIRS: &[&str] = &[".terraform/modules", ".terraform/plugins"];
const TF_EXTENSION: &str = ".tf";

/// Inputs for preparing one working directory.
pub struct Workdir<'a> {
    pub config: &'a dyn ConfigView,
    pub settings: &'a Settings,
    pub paths: &'a RunPaths,
    pub working_group: &'a str,
}

impl Workdir<'_> {
    /// Rebuild links and generated files. Returns the linked recipe files.
    pub fn setup(&self, skip_backend: bool) -> Result<Vec<PathBuf>> {
        let working_dir = &self.paths.working_dir;
        fs::create_dir_all(working_dir)
            .with_context(|| format!("failed to create {}", working_dir.display()))?;

        let removed = clean_links(working_dir, working_dir)?;
        debug!(removed, "cleared stale links");

        self.link_support_dirs()?;
        let recipes = self.link_recipes()?;
        self.write_vars()?;
        self.write_backend(skip_backend)?;
        if !self.settings.terraform.disable_shared_plugins {
            self.link_shared_plugins()?;
        }

        info!(
            working_dir = %working_dir.display(),
            recipes = recipes.len(),
            "working directory ready"
        );
        Ok(recipes)
    }

    fn link_support_dirs(&self) -> Result<()> {
        for name in SUPPORT_DIRS {
            let source = self.paths.root.join(name);
            if source.is_dir() {
                link(&source, &self.paths.working_dir.join(name))?;
            }
        }
        Ok(())
    }

    fn link_recipes(&self) -> Result<Vec<PathBuf>> {
        let key = format!("{RECIPES_DIR}.{}", self.working_group);
        let names: Vec<&str> = match self.config.value(&key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(name)) => vec![name.as_str()],
            _ => Vec::new(),
        };
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let source_dir = self.paths.root.join(RECIPES_DIR);
        let dest_dir = self.paths.working_dir.join(RECIPES_DIR);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;

        let mut linked = Vec::new();
        for name in names {
            let Some(source) = resolve_recipe(&source_dir, name) else {
                error!(recipe = name, dir = %source_dir.display(), "recipe not found");
                continue;
            };
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let dest = dest_dir.join(file_name);
            link(&source, &dest)?;
            linked.push(dest);
        }
        Ok(linked)
    }

    fn write_vars(&self) -> Result<()> {
        let mut vars = self.config.homogenized_vars();
        if self.settings.terraform.compat11 {
            vars = flatten_vars(&vars);
        }
        let path = self.paths.working_dir.join(VARS_FILE);
        let body = serde_json::to_string_pretty(&vars)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    fn write_backend(&self, skip_backend: bool) -> Result<()> {
        let path = self.paths.working_dir.join(BACKEND_FILE);
        let configured = self
            .config
            .value("backend")
            .and_then(Value::as_object)
            .filter(|backend| !backend.is_empty());

        let document = match configured {
            Some(backend) if !skip_backend => backend_document(backend, self.working_group)?,
            _ => {
                remove_if_exists(&path)?;
                return Ok(());
            }
        };

        let body = serde_json::to_string_pretty(&document)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    fn link_shared_plugins(&self) -> Result<()> {
        let cache = self.paths.plugin_cache();
        fs::create_dir_all(&cache)
            .with_context(|| format!("failed to create {}", cache.display()))?;

        let dest = self.paths.working_dir.join(".terraform").join("plugins");
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&dest)? == cache {
                    return Ok(());
                }
                fs::remove_file(&dest)?;
            }
            Ok(_) => {
                debug!(path = %dest.display(), "local plugin directory present, not sharing");
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        link(&cache, &dest)
    }
}

/// Prefer the literal recipe name, then `<name>.tf`.
fn resolve_recipe(dir: &Path, name: &str) -> Option<PathBuf> {
    let literal = dir.join(name);
    if literal.is_file() {
        return Some(literal);
    }
    if name.ends_with(TF_EXTENSION) {
        return None;
    }
    let with_ext = dir.join(format!("{name}{TF_EXTENSION}"));
    with_ext.is_file().then_some(with_ext)
}

fn backend_document(backend: &Map<String, Value>, working_group: &str) -> Result<Value> {
    let mut settings = backend.clone();
    let Some(Value::String(kind)) = settings.remove("type") else {
        bail!("backend configuration requires a string `type`");
    };
    let key = settings
        .get("key")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_STATE_KEY)
        .to_string();
    settings.insert("key".to_string(), Value::String(format!("{working_group}-{key}")));

    Ok(json!({ "terraform": { "backend": { kind: settings } } }))
}

/// Flatten each variable's nested maps into dot-joined keys and its arrays
/// into comma-joined strings. Top-level names are kept.
pub fn flatten_vars(vars: &Map<String, Value>) -> Map<String, Value> {
    vars.iter()
        .map(|(name, value)| {
            let flat = match value {
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (key, nested) in map {
                        flatten_into(key, nested, &mut out);
                    }
                    Value::Object(out)
                }
                Value::Array(items) => Value::String(join_scalars(items)),
                other => other.clone(),
            };
            (name.clone(), flat)
        })
        .collect()
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(&format!("{prefix}.{key}"), nested, out);
            }
        }
        Value::Array(items) => {
            out.insert(prefix.to_string(), Value::String(join_scalars(items)));
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn join_scalars(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Remove symlinks below `dir`, leaving terraform's cache directories alone.
fn clean_links(base: &Path, dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if is_cache_dir(base, &path) {
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove link {}", path.display()))?;
            removed += 1;
        } else if meta.is_dir() {
            removed += clean_links(base, &path)?;
        }
    }
    Ok(removed)
}

fn is_cache_dir(base: &Path, path: &Path) -> bool {
    path.strip_prefix(base)
        .is_ok_and(|rel| CACHE_DIRS.iter().any(|cache| rel == Path::new(cache)))
}

fn link(source: &Path, dest: &Path) -> Result<()> {
    remove_if_exists(dest)?;
    symlink(source, dest).with_context(|| {
        format!("failed to link {} -> {}", dest.display(), source.display())
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: Config,
        settings: Settings,
        paths: RunPaths,
    }

    impl Fixture {
        fn new(data: Value) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let config = Config::from_value(tmp.path(), data);
            let settings = Settings::from_view(&config).unwrap();
            let paths = RunPaths::resolve(tmp.path(), &settings.tmp_root, "main");
            Self {
                _tmp: tmp,
                config,
                settings,
                paths,
            }
        }

        fn root(&self) -> &Path {
            &self.paths.root
        }

        fn setup(&self, skip_backend: bool) -> Vec<PathBuf> {
            Workdir {
                config: &self.config,
                settings: &self.settings,
                paths: &self.paths,
                working_group: "main",
            }
            .setup(skip_backend)
            .unwrap()
        }

        fn read_json(&self, name: &str) -> Value {
            let body = fs::read_to_string(self.paths.working_dir.join(name)).unwrap();
            serde_json::from_str(&body).unwrap()
        }
    }

    #[test]
    fn recipes_prefer_literal_name_then_tf_extension() {
        let fx = Fixture::new(json!({"recipes": {"main": ["network", "dns.tf", "missing", "notes"]}}));
        let recipes = fx.root().join(RECIPES_DIR);
        fs::create_dir_all(&recipes).unwrap();
        fs::write(recipes.join("network.tf"), "# network").unwrap();
        fs::write(recipes.join("dns.tf"), "# dns").unwrap();
        fs::write(recipes.join("notes"), "literal").unwrap();
        fs::write(recipes.join("notes.tf"), "# notes").unwrap();

        let linked = fx.setup(false);
        let dest = fx.paths.working_dir.join(RECIPES_DIR);
        assert_eq!(
            linked,
            vec![dest.join("network.tf"), dest.join("dns.tf"), dest.join("notes")]
        );
        assert_eq!(fs::read_link(dest.join("notes")).unwrap(), recipes.join("notes"));
        assert!(!dest.join("notes.tf").exists());
        assert!(!dest.join("missing.tf").exists());
    }

    #[test]
    fn stale_links_are_removed_but_caches_kept() {
        let fx = Fixture::new(json!({"atmos": {"terraform": {"disable_shared_plugins": true}}}));
        let wd = &fx.paths.working_dir;
        let target = fx.root().join("target.tf");
        fs::write(&target, "").unwrap();
        fs::create_dir_all(wd.join(RECIPES_DIR)).unwrap();
        fs::create_dir_all(wd.join(".terraform/modules")).unwrap();
        symlink(&target, wd.join(RECIPES_DIR).join("old.tf")).unwrap();
        symlink(&target, wd.join(".terraform/modules/cached.tf")).unwrap();
        symlink(fx.root(), wd.join(".terraform/plugins")).unwrap();
        fs::write(wd.join("local.tf"), "").unwrap();

        fx.setup(false);

        assert!(fs::symlink_metadata(wd.join(RECIPES_DIR).join("old.tf")).is_err());
        assert!(fs::symlink_metadata(wd.join(".terraform/modules/cached.tf")).is_ok());
        assert!(fs::symlink_metadata(wd.join(".terraform/plugins")).is_ok());
        assert!(wd.join("local.tf").exists());
    }

    #[test]
    fn support_dirs_are_linked_when_present() {
        let fx = Fixture::new(json!({}));
        fs::create_dir_all(fx.root().join("modules")).unwrap();

        fx.setup(false);

        let wd = &fx.paths.working_dir;
        assert_eq!(fs::read_link(wd.join("modules")).unwrap(), fx.root().join("modules"));
        assert!(fs::symlink_metadata(wd.join("templates")).is_err());
    }

    #[test]
    fn vars_file_holds_homogenized_config() {
        let fx = Fixture::new(json!({"region": "us-east-1", "unset": null, "tags": {"team": "ops"}}));
        fx.setup(false);
        assert_eq!(
            fx.read_json(VARS_FILE),
            json!({"region": "us-east-1", "tags": {"team": "ops"}})
        );
    }

    #[test]
    fn compat11_flattens_nested_vars() {
        let fx = Fixture::new(json!({
            "atmos": {"terraform": {"compat11": true}},
            "zones": ["a", "b"],
        }));
        fx.setup(false);
        let vars = fx.read_json(VARS_FILE);
        assert_eq!(vars["zones"], json!("a,b"));
        assert_eq!(vars["atmos"]["terraform.compat11"], json!(true));
        assert_eq!(vars["atmos"]["tmp_root"], Value::Null);
    }

    #[test]
    fn flatten_joins_keys_and_arrays() {
        let vars = json!({"cfg": {"a": {"b": 1, "c": [1, "x"]}, "d": "e"}, "n": 3});
        let flat = flatten_vars(vars.as_object().unwrap());
        assert_eq!(
            Value::Object(flat),
            json!({"cfg": {"a.b": 1, "a.c": "1,x", "d": "e"}, "n": 3})
        );
    }

    #[test]
    fn backend_key_is_scoped_to_working_group() {
        let fx = Fixture::new(json!({"backend": {"type": "s3", "bucket": "state", "key": "app.tfstate"}}));
        fx.setup(false);
        assert_eq!(
            fx.read_json(BACKEND_FILE),
            json!({"terraform": {"backend": {"s3": {"bucket": "state", "key": "main-app.tfstate"}}}})
        );
    }

    #[test]
    fn backend_key_defaults() {
        let fx = Fixture::new(json!({"backend": {"type": "local"}}));
        fx.setup(false);
        assert_eq!(
            fx.read_json(BACKEND_FILE)["terraform"]["backend"]["local"]["key"],
            json!("main-terraform.tfstate")
        );
    }

    #[test]
    fn skip_backend_removes_file() {
        let fx = Fixture::new(json!({"backend": {"type": "s3"}}));
        fx.setup(false);
        assert!(fx.paths.working_dir.join(BACKEND_FILE).exists());
        fx.setup(true);
        assert!(!fx.paths.working_dir.join(BACKEND_FILE).exists());
    }

    #[test]
    fn backend_without_type_is_an_error() {
        let fx = Fixture::new(json!({"backend": {"bucket": "state"}}));
        let result = Workdir {
            config: &fx.config,
            settings: &fx.settings,
            paths: &fx.paths,
            working_group: "main",
        }
        .setup(false);
        assert!(result.unwrap_err().to_string().contains("type"));
    }

    #[test]
    fn shared_plugin_cache_is_linked() {
        let fx = Fixture::new(json!({}));
        fx.setup(false);
        fx.setup(false);
        let link = fx.paths.working_dir.join(".terraform/plugins");
        assert_eq!(fs::read_link(link).unwrap(), fx.paths.plugin_cache());
        assert!(fx.paths.plugin_cache().is_dir());
    }

    #[test]
    fn shared_plugin_cache_can_be_disabled() {
        let fx = Fixture::new(json!({"atmos": {"terraform": {"disable_shared_plugins": true}}}));
        fx.setup(false);
        assert!(fs::symlink_metadata(fx.paths.working_dir.join(".terraform/plugins")).is_err());
    }
}

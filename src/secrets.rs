//! Credential and secret providers.
//!
//! Both are collaborators owned by other subsystems; the harness only needs
//! their maps. The implementations here cover the binary's defaults and tests.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

/// Prefix terraform uses to pick variables out of the environment.
pub const SECRET_ENV_PREFIX: &str = "TF_VAR_";

/// Supplies the base environment for the child (process env plus credentials).
pub trait CredentialProvider: Send + Sync {
    fn auth_env(&self) -> Result<BTreeMap<String, String>>;
}

/// Supplies secret name → value pairs for the active working group.
pub trait SecretProvider: Send + Sync {
    fn secrets(&self) -> Result<BTreeMap<String, String>>;
}

/// Passes the current process environment through. Variables whose name or
/// value is not UTF-8 are left out.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl CredentialProvider for ProcessEnv {
    fn auth_env(&self) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for (name, value) in std::env::vars_os() {
            match (name.to_str(), value.to_str()) {
                (Some(name), Some(value)) => {
                    env.insert(name.to_string(), value.to_string());
                }
                _ => debug!(
                    name = %name.to_string_lossy(),
                    "skipping non-UTF-8 environment variable"
                ),
            }
        }
        Ok(env)
    }
}

/// A fixed map, used for both credentials and secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticMap(pub BTreeMap<String, String>);

impl StaticMap {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl CredentialProvider for StaticMap {
    fn auth_env(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.0.clone())
    }
}

impl SecretProvider for StaticMap {
    fn secrets(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.0.clone())
    }
}

/// Environment variable name a secret is exposed under.
pub fn secret_env_name(name: &str) -> String {
    format!("{SECRET_ENV_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn secret_names_are_prefixed() {
        assert_eq!(secret_env_name("db_password"), "TF_VAR_db_password");
    }

    #[test]
    fn static_map_serves_both_roles() {
        let map = StaticMap::new([("a", "1"), ("b", "2")]);
        assert_eq!(map.auth_env().unwrap().get("a").map(String::as_str), Some("1"));
        assert_eq!(map.secrets().unwrap().len(), 2);
    }

    #[test]
    #[serial]
    fn process_env_skips_non_utf8_values() {
        let name = "ATMOS_TEST_NON_UTF8";
        // SAFETY: serial test; no other thread reads the environment.
        unsafe { std::env::set_var(name, OsStr::from_bytes(b"\xff\xfe")) };
        let env = ProcessEnv.auth_env();
        unsafe { std::env::remove_var(name) };

        let env = env.unwrap();
        assert!(!env.contains_key(name));
        assert!(env.contains_key("PATH"));
    }

    #[test]
    #[serial]
    fn process_env_includes_path() {
        // PATH is set in any environment that can run the test binary.
        let env = ProcessEnv.auth_env().unwrap();
        assert!(env.contains_key("PATH"));
    }
}

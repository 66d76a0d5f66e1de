use std::path::{Path, PathBuf};

/// Directory name, under the temp root, holding the shared provider cache.
pub const PLUGIN_CACHE_DIR: &str = "terraform_plugins";

/// Working directory name inside a working group's scratch directory.
pub const WORKING_DIR: &str = "tf";

/// Filesystem locations for one working group's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub tmp_root: PathBuf,
    /// Scratch directory for the group; also the IPC socket directory and
    /// the child's `TMPDIR`.
    pub tmp_dir: PathBuf,
    /// Where terraform runs.
    pub working_dir: PathBuf,
}

impl RunPaths {
    /// Lay out `<tmp_root>/<working_group>/tf`, resolving a relative
    /// `tmp_root` against the project root.
    pub fn resolve(root: &Path, tmp_root: &str, working_group: &str) -> Self {
        let tmp_root = if Path::new(tmp_root).is_absolute() {
            PathBuf::from(tmp_root)
        } else {
            root.join(tmp_root)
        };
        let tmp_dir = tmp_root.join(working_group);
        let working_dir = tmp_dir.join(WORKING_DIR);
        Self {
            root: root.to_path_buf(),
            tmp_root,
            tmp_dir,
            working_dir,
        }
    }

    /// Provider cache shared by every working group under the temp root.
    pub fn plugin_cache(&self) -> PathBuf {
        self.tmp_root.join(PLUGIN_CACHE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_tmp_root_is_under_project_root() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RunPaths::resolve(tmp.path(), "tmp", "ops");

        assert_eq!(paths.tmp_root, tmp.path().join("tmp"));
        assert_eq!(paths.tmp_dir, tmp.path().join("tmp").join("ops"));
        assert_eq!(paths.working_dir, tmp.path().join("tmp").join("ops").join("tf"));
        assert_eq!(paths.plugin_cache(), tmp.path().join("tmp").join(PLUGIN_CACHE_DIR));
    }

    #[test]
    fn absolute_tmp_root_is_used_as_is() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let paths = RunPaths::resolve(root.path(), scratch.path().to_str().unwrap(), "main");

        assert_eq!(paths.tmp_root, scratch.path());
        assert_eq!(paths.working_dir, scratch.path().join("main").join("tf"));
    }

    #[test]
    fn groups_share_the_plugin_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let a = RunPaths::resolve(tmp.path(), "tmp", "a");
        let b = RunPaths::resolve(tmp.path(), "tmp", "b");

        assert_ne!(a.working_dir, b.working_dir);
        assert_eq!(a.plugin_cache(), b.plugin_cache());
    }
}

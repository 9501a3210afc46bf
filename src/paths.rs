use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming the root directory for all working directories.
pub const WORK_DIR_ROOT_ENV: &str = "ENGINE_WORK_DIR_ROOT";

/// Per-identity working directory. The engine runs here and its logs live here.
#[derive(Debug, Clone)]
pub struct Paths {
    work_dir: PathBuf,
}

impl Paths {
    /// Resolve (and create) the working directory for `identity`.
    ///
    /// With a root, the directory is `root/identity`. A root that is not a
    /// directory is ignored; an `identity` path that exists but is not a
    /// directory is replaced by a unique temporary directory under `root`.
    /// Without a root, a unique temporary directory is created in the system
    /// temp dir.
    pub fn resolve(root: Option<&Path>, identity: &str) -> io::Result<Self> {
        let Some(root) = root else {
            return Self::temporary(&std::env::temp_dir(), identity);
        };

        let root = std::path::absolute(root)?;
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        if !root.is_dir() {
            tracing::warn!(
                root = %root.display(),
                "working directory root is not a directory, using a temporary directory"
            );
            return Self::temporary(&std::env::temp_dir(), identity);
        }

        let work_dir = root.join(identity);
        if !work_dir.exists() {
            std::fs::create_dir_all(&work_dir)?;
        }
        if !work_dir.is_dir() {
            tracing::warn!(
                path = %work_dir.display(),
                "working directory path is not a directory, using a temporary directory"
            );
            return Self::temporary(&root, identity);
        }

        Ok(Self { work_dir })
    }

    /// Resolve using `ENGINE_WORK_DIR_ROOT` when set, else `configured`.
    pub fn from_env(configured: Option<&Path>, identity: &str) -> io::Result<Self> {
        match std::env::var_os(WORK_DIR_ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::resolve(Some(Path::new(&root)), identity),
            _ => Self::resolve(configured, identity),
        }
    }

    fn temporary(parent: &Path, identity: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{identity}-"))
            .tempdir_in(parent)?;
        // The directory outlives this crate's handle on it.
        let work_dir = dir.keep();
        tracing::debug!(path = %work_dir.display(), "created temporary working directory");
        Ok(Self { work_dir })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { work_dir: base }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log_prefix(module: &str) -> String {
        format!("{module}.log.")
    }

    pub fn log_file(&self, module: &str, index: u64) -> PathBuf {
        self.work_dir.join(format!("{}{index}", Self::log_prefix(module)))
    }
}

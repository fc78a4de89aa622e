//! Import engine configuration.

use ovfimport_shared::errors::{ImportError, ImportResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default home directory.
pub const HOME_ENV: &str = "OVFIMPORT_HOME";

pub const DEFAULT_COPY_BLOCK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Options for an import engine instance.
///
/// All fields have defaults, so a JSON config only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Engine home: database, logs and scratch space live here.
    pub home_dir: PathBuf,
    /// Parent folder for machine folders. Defaults to `<home>/machines`.
    pub machines_dir: Option<PathBuf>,
    /// Block size for image copies and manifest hashing.
    pub copy_block_size: usize,
    /// How often a running disk copy is polled for progress.
    pub poll_interval_ms: u64,
    /// Verify the package manifest when one is present.
    pub verify_manifest: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            machines_dir: None,
            copy_block_size: DEFAULT_COPY_BLOCK_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            verify_manifest: true,
        }
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ovfimport")
}

impl ImportOptions {
    /// Load options from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> ImportResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ImportError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let options: Self = serde_json::from_str(&text).map_err(|e| {
            ImportError::Config(format!("invalid options in {}: {}", path.display(), e))
        })?;
        options.sanitize()
    }

    /// Validate the options, returning them unchanged when usable.
    pub fn sanitize(self) -> ImportResult<Self> {
        if !self.home_dir.is_absolute() {
            return Err(ImportError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if let Some(dir) = &self.machines_dir
            && !dir.is_absolute()
        {
            return Err(ImportError::Config(format!(
                "machines_dir must be absolute path, got: {}",
                dir.display()
            )));
        }
        if self.copy_block_size == 0 {
            return Err(ImportError::Config("copy_block_size must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ImportError::Config("poll_interval_ms must be non-zero".into()));
        }
        Ok(self)
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.machines_dir
            .clone()
            .unwrap_or_else(|| self.home_dir.join("machines"))
    }

    /// Scratch space for unpacked archives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.home_dir.join("tmp")
    }

    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join("db").join("registry.db")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

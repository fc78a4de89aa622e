//! Per-appliance cleanup context.

use tempfile::TempDir;

/// Temporary resources owned by one appliance.
///
/// Unpacked archives are registered here and removed exactly once: on [`ImportSession::close`] or when the session is dropped.
#[derive(Debug, Default)]
pub struct ImportSession {
    scratch_dirs: Vec<TempDir>,
    closed: bool,
}

impl ImportSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a scratch directory.
    pub fn adopt_dir(&mut self, dir: TempDir) {
        tracing::debug!(path = %dir.path().display(), "Session adopted scratch directory");
        self.scratch_dirs.push(dir);
    }

    /// Remove every registered resource. Later calls do nothing.
    ///
    /// Returns the number of resources that could not be removed.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;

        let mut failures = 0;
        for dir in self.scratch_dirs.drain(..) {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                failures += 1;
                tracing::warn!(path = %path.display(), "Failed to remove scratch directory: {}", e);
            }
        }

        tracing::debug!(failures, "Import session closed");
        failures
    }
}

impl Drop for ImportSession {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}

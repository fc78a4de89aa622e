//! OVF/OVA appliance import engine.
//!
//! ```text
//! Appliance::read ──▶ ovf (parse, manifest) ──▶ appliance::interpret ──▶ descriptions
//!                                                                            │ overrides
//! Appliance::import_machines ──▶ import (plan, pipeline tasks) ──▶ MachineRegistry / MediumStore
//!                                        │ failure
//!                                        └──▶ RollbackManager
//! ```
//!
//! Long-running calls hand back a [`Progress`] that can be polled, awaited
//! and cancelled.

pub mod appliance;
pub mod db;
pub mod import;
pub mod options;
pub mod ovf;
pub mod pipeline;
pub mod progress;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use appliance::{
    Appliance, AppliancePhase, ApplianceDescriptor, DescriptionType, DescriptorItem,
    ImportOverrides, VirtualSystemDescription,
};
pub use import::{CreatedArtifact, ImportOrchestrator, ImportReport, RollbackManager};
pub use options::ImportOptions;
pub use ovfimport_shared::errors::{ImportError, ImportResult};
pub use progress::{Progress, ProgressReporter, ProgressState};
pub use registry::{
    FileMediumStore, LocalRegistry, MachineId, MachineRegistry, MediumStore,
};

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install a global `tracing` subscriber writing to `<home>/logs/ovfimport.log`.
///
/// The level comes from `RUST_LOG` (default `info`). Only the first call
/// installs anything; later calls return immediately.
pub fn init_logging_for(home: &Path) -> ImportResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = home.join("logs");
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        ImportError::Config(format!(
            "failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, "ovfimport.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    if LOG_GUARD.set(guard).is_err() {
        // Lost a race with a concurrent first call.
        return Ok(());
    }
    if let Err(e) = installed {
        tracing::debug!("Global subscriber already installed: {}", e);
    } else {
        tracing::info!(logs = %logs_dir.display(), "Logging initialized");
    }
    Ok(())
}

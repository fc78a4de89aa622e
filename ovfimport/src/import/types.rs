//! Types shared by the import pipeline.

use crate::appliance::description::VirtualSystemDescription;
use crate::import::rollback::RollbackReport;
use crate::progress::ProgressReporter;
use crate::registry::{AttachmentSlot, MachineId, MachineRegistry, MediumStore, StorageBus};
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::path::PathBuf;
use std::sync::Arc;

/// Progress writer shared by the tasks of an import.
///
/// Locked briefly, never across an `.await`.
pub type SharedReporter = Arc<parking_lot::Mutex<ProgressReporter>>;

/// A medium created or attached for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumArtifact {
    /// Image written by the import; `None` for an empty drive.
    pub location: Option<PathBuf>,
    /// Set once the medium is attached.
    pub slot: Option<AttachmentSlot>,
}

/// Everything one virtual system's import has created so far, in creation
/// order. This is the exact undo set for that system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedArtifact {
    pub machine_id: MachineId,
    pub system_index: usize,
    pub name: String,
    /// Append-only.
    pub media: Vec<MediumArtifact>,
    pub registered: bool,
}

impl CreatedArtifact {
    pub fn new(machine_id: MachineId, system_index: usize, name: impl Into<String>) -> Self {
        Self {
            machine_id,
            system_index,
            name: name.into(),
            media: Vec::new(),
            registered: false,
        }
    }

    /// Images of attached media, in attach order.
    pub fn attached_medium_locations(&self) -> Vec<PathBuf> {
        self.media
            .iter()
            .filter(|m| m.slot.is_some())
            .filter_map(|m| m.location.clone())
            .collect()
    }

    /// Number of undo steps this artifact implies.
    pub fn undo_steps(&self) -> usize {
        let media: usize = self
            .media
            .iter()
            .map(|m| usize::from(m.slot.is_some()) + usize::from(m.location.is_some()))
            .sum();
        media + usize::from(self.registered) + 1
    }
}

/// Why an import stopped.
#[derive(Debug, Clone)]
pub struct ImportFailure {
    pub system_index: usize,
    /// Task that failed.
    pub task: String,
    pub error: ImportError,
    pub rollback: RollbackReport,
}

/// Outcome of an import batch.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Machines of the systems that completed.
    pub artifacts: Vec<CreatedArtifact>,
    pub failure: Option<ImportFailure>,
}

impl ImportReport {
    pub fn result(&self) -> ImportResult<()> {
        match &self.failure {
            Some(failure) => Err(failure.error.clone()),
            None => Ok(()),
        }
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.artifacts.iter().map(|a| a.machine_id).collect()
    }
}

/// Storage controller as created for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedController {
    pub name: String,
    pub bus: StorageBus,
}

/// Pipeline context of one virtual system.
pub struct ImportContext {
    pub system_index: usize,
    /// Description with overrides applied.
    pub system: VirtualSystemDescription,
    pub registry: Arc<dyn MachineRegistry>,
    pub store: Arc<dyn MediumStore>,
    pub reporter: SharedReporter,
    pub poll_interval: std::time::Duration,
    pub block_size: usize,
    /// Present once the machine shell exists.
    pub artifact: Option<CreatedArtifact>,
}

impl ImportContext {
    pub fn machine_id(&self) -> ImportResult<MachineId> {
        self.artifact
            .as_ref()
            .map(|a| a.machine_id)
            .ok_or_else(|| ImportError::Internal("machine has not been created yet".into()))
    }

    pub fn artifact_mut(&mut self) -> ImportResult<&mut CreatedArtifact> {
        self.artifact
            .as_mut()
            .ok_or_else(|| ImportError::Internal("machine has not been created yet".into()))
    }
}

pub type ImportCtx = Arc<tokio::sync::Mutex<ImportContext>>;

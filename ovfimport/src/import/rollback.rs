//! Best-effort undo of created artifacts.

use super::types::CreatedArtifact;
use crate::registry::{MachineRegistry, MediumStore};
use ovfimport_shared::errors::ImportError;
use std::sync::Arc;

/// Undo steps that failed. Rollback itself never fails.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Steps attempted.
    pub steps: usize,
    /// `Rollback` errors of the steps that failed.
    pub failures: Vec<ImportError>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RollbackManager {
    registry: Arc<dyn MachineRegistry>,
    store: Arc<dyn MediumStore>,
}

impl RollbackManager {
    pub fn new(registry: Arc<dyn MachineRegistry>, store: Arc<dyn MediumStore>) -> Self {
        Self { registry, store }
    }

    /// Undo `artifacts` in strict reverse creation order.
    ///
    /// Per machine: detach and delete each medium (newest first), unregister
    /// if registered, then delete the settings. Every step runs even when an
    /// earlier one failed.
    pub async fn rollback(&self, artifacts: &[CreatedArtifact]) -> RollbackReport {
        let mut report = RollbackReport::default();

        for artifact in artifacts.iter().rev() {
            let id = artifact.machine_id;
            tracing::info!(
                machine_id = %id,
                system = artifact.system_index,
                media = artifact.media.len(),
                "Rolling back machine"
            );

            for medium in artifact.media.iter().rev() {
                if let Some(slot) = &medium.slot {
                    let result = self.registry.detach_medium(&id, slot).await;
                    record(&mut report, result, || format!("detach {} from machine {}", slot, id));
                }
                if let Some(location) = &medium.location {
                    let result = self.store.delete_image(location).await;
                    record(&mut report, result, || format!("delete image {}", location.display()));
                }
            }

            if artifact.registered {
                let result = self.registry.unregister_machine(&id).await;
                record(&mut report, result, || format!("unregister machine {}", id));
            }

            let result = self.registry.delete_machine_settings(&id).await;
            record(&mut report, result, || format!("delete settings of machine {}", id));
        }

        if report.is_clean() {
            tracing::info!(steps = report.steps, "Rollback completed");
        } else {
            tracing::warn!(
                steps = report.steps,
                failures = report.failures.len(),
                "Rollback completed with failures"
            );
        }
        report
    }
}

fn record(
    report: &mut RollbackReport,
    result: Result<(), ImportError>,
    step: impl FnOnce() -> String,
) {
    report.steps += 1;
    if let Err(e) = result {
        let step = step();
        tracing::warn!(step = %step, error = %e, "Rollback step failed");
        report
            .failures
            .push(ImportError::Rollback(format!("{}: {}", step, e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::types::MediumArtifact;
    use crate::registry::AttachmentSlot;
    use crate::test_support::{Call, FakeMediumStore, FakeRegistry};
    use std::path::PathBuf;

    fn slot(port: u32) -> AttachmentSlot {
        AttachmentSlot {
            controller: "SATA Controller".into(),
            port,
            device: 0,
        }
    }

    fn artifact(
        registry: &FakeRegistry,
        index: usize,
        disks: u32,
        registered: bool,
    ) -> CreatedArtifact {
        let name = format!("vm{}", index);
        let id = registry.seed_machine(&name, registered);
        let mut artifact = CreatedArtifact::new(id, index, name);
        for port in 0..disks {
            artifact.media.push(MediumArtifact {
                location: Some(PathBuf::from(format!("/m/vm{}/disk{}.vmdk", index, port))),
                slot: Some(slot(port)),
            });
        }
        artifact.registered = registered;
        artifact
    }

    #[tokio::test]
    async fn test_reverse_order() {
        let registry = Arc::new(FakeRegistry::new());
        let store = Arc::new(FakeMediumStore::new());
        let manager = RollbackManager::new(registry.clone(), store.clone());

        let a = artifact(&registry, 0, 2, true);
        let report = manager.rollback(std::slice::from_ref(&a)).await;
        assert!(report.is_clean());
        assert_eq!(report.steps, a.undo_steps());

        let id = a.machine_id;
        assert_eq!(
            registry.calls(),
            vec![
                Call::DetachMedium(id, slot(1)),
                Call::DetachMedium(id, slot(0)),
                Call::UnregisterMachine(id),
                Call::DeleteMachineSettings(id),
            ]
        );
        assert_eq!(
            store.deleted(),
            vec![
                PathBuf::from("/m/vm0/disk1.vmdk"),
                PathBuf::from("/m/vm0/disk0.vmdk"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_rollback() {
        let registry = Arc::new(FakeRegistry::new());
        registry.fail_on("detach_medium", ImportError::registration("busy"));
        let store = Arc::new(FakeMediumStore::new());
        store.fail_deletes(ImportError::storage("read-only"));
        let manager = RollbackManager::new(registry.clone(), store.clone());

        let report = manager.rollback(&[artifact(&registry, 0, 1, false)]).await;
        assert_eq!(report.failures.len(), 2);
        assert!(
            report
                .failures
                .iter()
                .all(|e| matches!(e, ImportError::Rollback(_)))
        );
        assert!(matches!(
            registry.calls().last(),
            Some(Call::DeleteMachineSettings(_))
        ));
    }
}

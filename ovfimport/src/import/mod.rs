//! Machine creation from an interpreted appliance.
//!
//! Each virtual system becomes one pipeline run:
//!
//! ```text
//! machine ─▶ storage (controllers, disk 1..n) ─▶ devices ─▶ register
//! ```
//!
//! Systems run one after another. Every task records what it created in the
//! system's [`CreatedArtifact`] as soon as it succeeds, so when a task fails
//! the [`RollbackManager`] undoes exactly that system. Earlier systems stay,
//! later ones are not attempted.

pub mod plan;
pub mod rollback;
pub mod tasks;
pub mod types;

pub use plan::{SystemPlan, build_system_plan};
pub use rollback::{RollbackManager, RollbackReport};
pub use types::{
    CreatedArtifact, ImportContext, ImportCtx, ImportFailure, ImportReport, MediumArtifact,
    SharedReporter,
};

use crate::appliance::description::ApplianceDescriptor;
use crate::options::ImportOptions;
use crate::pipeline::PipelineExecutor;
use crate::registry::{MachineRegistry, MediumStore};
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::sync::Arc;
use std::time::Instant;

/// Validated plans for a whole appliance. Nothing has been created yet.
pub struct PreparedImport {
    systems: Vec<SystemPlan>,
}

impl PreparedImport {
    /// Sum of all step weights, the denominator of the import progress.
    pub fn total_weight(&self) -> u64 {
        self.systems.iter().map(|s| s.weight).sum()
    }

    pub fn task_count(&self) -> usize {
        self.systems.iter().map(|s| s.task_count).sum()
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }
}

pub struct ImportOrchestrator {
    registry: Arc<dyn MachineRegistry>,
    store: Arc<dyn MediumStore>,
    options: ImportOptions,
}

impl ImportOrchestrator {
    pub fn new(
        registry: Arc<dyn MachineRegistry>,
        store: Arc<dyn MediumStore>,
        options: ImportOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options,
        }
    }

    /// Plan every system of `descriptor` (overrides already applied).
    ///
    /// Fails with `InvalidArgument` on values that cannot be imported, before
    /// any side effect.
    pub fn prepare(&self, descriptor: &ApplianceDescriptor) -> ImportResult<PreparedImport> {
        if descriptor.systems.is_empty() {
            return Err(ImportError::InvalidArgument(
                "appliance has no virtual systems to import".into(),
            ));
        }

        let systems = descriptor
            .systems
            .iter()
            .enumerate()
            .map(|(index, system)| {
                build_system_plan(index, system, &descriptor.package_dir, &self.options)
            })
            .collect::<ImportResult<Vec<_>>>()?;

        let prepared = PreparedImport { systems };
        tracing::debug!(
            systems = prepared.system_count(),
            tasks = prepared.task_count(),
            weight = prepared.total_weight(),
            "Import planned"
        );
        Ok(prepared)
    }

    /// Run the prepared plans, reporting into `reporter`.
    ///
    /// Never fails as a whole: the report carries the surviving artifacts and
    /// the failure, if any. The reporter is left open for the caller to
    /// complete.
    pub async fn run(&self, prepared: PreparedImport, reporter: SharedReporter) -> ImportReport {
        let start = Instant::now();
        let rollback = RollbackManager::new(self.registry.clone(), self.store.clone());
        let mut report = ImportReport::default();

        reporter
            .lock()
            .set_operation_count(prepared.task_count() as u32);

        for system_plan in prepared.systems {
            let SystemPlan {
                system_index,
                system,
                plan,
                ..
            } = system_plan;
            let name = system.name().to_string();

            tracing::info!(system = system_index, name = %name, "Importing virtual system");

            let ctx: ImportCtx = Arc::new(tokio::sync::Mutex::new(ImportContext {
                system_index,
                system,
                registry: self.registry.clone(),
                store: self.store.clone(),
                reporter: reporter.clone(),
                poll_interval: self.options.poll_interval(),
                block_size: self.options.copy_block_size,
                artifact: None,
            }));

            match PipelineExecutor::execute(plan, ctx.clone()).await {
                Ok(metrics) => {
                    let artifact = ctx.lock().await.artifact.take();
                    let Some(artifact) = artifact else {
                        report.failure = Some(ImportFailure {
                            system_index,
                            task: String::new(),
                            error: ImportError::Internal(format!(
                                "virtual system {} finished without a machine",
                                system_index
                            )),
                            rollback: RollbackReport::default(),
                        });
                        break;
                    };

                    for task in metrics.tasks() {
                        tracing::debug!(
                            system = system_index,
                            task = %task.name,
                            duration_ms = task.duration_ms as u64,
                            "Task timing"
                        );
                    }
                    tracing::info!(
                        system = system_index,
                        machine_id = %artifact.machine_id,
                        name = %name,
                        disks = artifact.attached_medium_locations().len(),
                        duration_ms = metrics.total_duration_ms as u64,
                        slowest_task = metrics.slowest_task().map(|t| t.name.as_str()).unwrap_or_default(),
                        "Virtual system imported"
                    );
                    report.artifacts.push(artifact);
                }
                Err(failure) => {
                    let created: Vec<CreatedArtifact> =
                        ctx.lock().await.artifact.take().into_iter().collect();

                    tracing::warn!(
                        system = system_index,
                        stage = failure.stage,
                        task = %failure.task,
                        error = %failure.error,
                        completed_tasks = failure.metrics.tasks().count(),
                        "Virtual system import failed, rolling back"
                    );

                    let rollback_report = rollback.rollback(&created).await;
                    report.failure = Some(ImportFailure {
                        system_index,
                        task: failure.task,
                        error: failure.error,
                        rollback: rollback_report,
                    });
                    break;
                }
            }
        }

        tracing::info!(
            imported = report.artifacts.len(),
            failed = report.failure.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Import finished"
        );
        report
    }
}

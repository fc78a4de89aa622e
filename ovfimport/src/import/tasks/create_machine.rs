//! Task: create the machine shell.

use super::{log_task_error, task_start};
use crate::import::plan::STEP_WEIGHT;
use crate::import::types::{CreatedArtifact, ImportCtx};
use crate::pipeline::PipelineTask;
use crate::registry::MachineSpec;
use async_trait::async_trait;
use ovfimport_shared::errors::ImportResult;

pub struct CreateMachineTask {
    spec: MachineSpec,
}

impl CreateMachineTask {
    pub fn new(spec: MachineSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl PipelineTask<ImportCtx> for CreateMachineTask {
    async fn run(self: Box<Self>, ctx: ImportCtx) -> ImportResult<()> {
        let task_name = self.name();
        let system_index = task_start(&ctx, task_name, "Creating machine", STEP_WEIGHT).await?;

        let registry = ctx.lock().await.registry.clone();
        let machine_id = registry
            .create_machine(&self.spec)
            .await
            .inspect_err(|e| log_task_error(system_index, task_name, e))?;

        // Recorded immediately so a later failure undoes the shell.
        let mut ctx = ctx.lock().await;
        ctx.artifact = Some(CreatedArtifact::new(
            machine_id,
            system_index,
            self.spec.name.clone(),
        ));
        ctx.reporter.lock().set_operation_percent(100);

        tracing::info!(
            system = system_index,
            machine_id = %machine_id,
            name = %self.spec.name,
            os_type = %self.spec.os_type,
            cpus = self.spec.cpu_count,
            memory_mb = self.spec.memory_mb,
            "Machine shell created"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "create_machine"
    }
}

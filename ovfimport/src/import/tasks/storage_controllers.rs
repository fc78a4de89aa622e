//! Task: add storage controllers in descriptor order.

use super::{log_task_error, task_start};
use crate::import::plan::STEP_WEIGHT;
use crate::import::types::ImportCtx;
use crate::pipeline::PipelineTask;
use crate::registry::ControllerSpec;
use async_trait::async_trait;
use ovfimport_shared::errors::ImportResult;

pub struct StorageControllersTask {
    controllers: Vec<ControllerSpec>,
}

impl StorageControllersTask {
    pub fn new(controllers: Vec<ControllerSpec>) -> Self {
        Self { controllers }
    }
}

#[async_trait]
impl PipelineTask<ImportCtx> for StorageControllersTask {
    async fn run(self: Box<Self>, ctx: ImportCtx) -> ImportResult<()> {
        let task_name = self.name();
        let system_index =
            task_start(&ctx, task_name, "Adding storage controllers", STEP_WEIGHT).await?;

        let (registry, machine_id, reporter) = {
            let ctx = ctx.lock().await;
            (ctx.registry.clone(), ctx.machine_id()?, ctx.reporter.clone())
        };

        let total = self.controllers.len().max(1);
        for (index, controller) in self.controllers.iter().enumerate() {
            reporter
                .lock()
                .checkpoint()
                .inspect_err(|e| log_task_error(system_index, task_name, e))?;
            registry
                .add_storage_controller(&machine_id, controller)
                .await
                .inspect_err(|e| log_task_error(system_index, task_name, e))?;
            reporter
                .lock()
                .set_operation_percent(((index + 1) * 100 / total) as u8);
        }

        tracing::debug!(
            system = system_index,
            machine_id = %machine_id,
            controllers = self.controllers.len(),
            "Storage controllers added"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "storage_controllers"
    }
}

//! Task: register the finished machine.

use super::{log_task_error, task_start};
use crate::import::plan::STEP_WEIGHT;
use crate::import::types::ImportCtx;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use ovfimport_shared::errors::ImportResult;

pub struct RegisterTask;

#[async_trait]
impl PipelineTask<ImportCtx> for RegisterTask {
    async fn run(self: Box<Self>, ctx: ImportCtx) -> ImportResult<()> {
        let task_name = self.name();
        let system_index = task_start(&ctx, task_name, "Registering machine", STEP_WEIGHT).await?;

        let (registry, machine_id) = {
            let ctx = ctx.lock().await;
            (ctx.registry.clone(), ctx.machine_id()?)
        };

        registry
            .register_machine(&machine_id)
            .await
            .inspect_err(|e| log_task_error(system_index, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.artifact_mut()?.registered = true;
        ctx.reporter.lock().set_operation_percent(100);

        tracing::info!(system = system_index, machine_id = %machine_id, "Machine registered");
        Ok(())
    }

    fn name(&self) -> &str {
        "register_machine"
    }
}

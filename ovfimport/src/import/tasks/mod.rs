//! Import pipeline tasks, one per creation step.

mod create_machine;
mod devices;
mod disk_image;
mod register;
mod storage_controllers;

pub use create_machine::CreateMachineTask;
pub use devices::DevicesTask;
pub use disk_image::{DiskImageTask, DiskSource};
pub use register::RegisterTask;
pub use storage_controllers::StorageControllersTask;

use super::types::ImportCtx;
use ovfimport_shared::errors::{ImportError, ImportResult};

/// Checkpoint for cancellation, open the task's progress operation and log
/// its start. Returns the system index.
pub(crate) async fn task_start(
    ctx: &ImportCtx,
    task_name: &str,
    label: &str,
    weight: u64,
) -> ImportResult<usize> {
    let ctx = ctx.lock().await;
    let system_index = ctx.system_index;
    {
        let mut reporter = ctx.reporter.lock();
        reporter
            .checkpoint()
            .inspect_err(|e| log_task_error(system_index, task_name, e))?;
        reporter.begin_operation(format!("{}: {}", ctx.system.name(), label), weight);
    }
    tracing::debug!(system = system_index, task = task_name, weight, "Task starting");
    Ok(system_index)
}

pub(crate) fn log_task_error(system_index: usize, task_name: &str, error: &ImportError) {
    if error.is_cancelled() {
        tracing::info!(system = system_index, task = task_name, "Task cancelled: {}", error);
    } else {
        tracing::error!(system = system_index, task = task_name, "Task failed: {}", error);
    }
}

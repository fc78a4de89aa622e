//! Task: network adapters, USB, sound, floppy and empty DVD drives.

use super::{log_task_error, task_start};
use crate::import::plan::STEP_WEIGHT;
use crate::import::types::{ImportCtx, MediumArtifact};
use crate::pipeline::PipelineTask;
use crate::registry::{AttachmentSlot, DeviceSettings, MediumAttachment, MediumKind};
use async_trait::async_trait;
use ovfimport_shared::errors::ImportResult;

pub struct DevicesTask {
    devices: DeviceSettings,
    dvd_slots: Vec<AttachmentSlot>,
}

impl DevicesTask {
    pub fn new(devices: DeviceSettings, dvd_slots: Vec<AttachmentSlot>) -> Self {
        Self { devices, dvd_slots }
    }
}

#[async_trait]
impl PipelineTask<ImportCtx> for DevicesTask {
    async fn run(self: Box<Self>, ctx: ImportCtx) -> ImportResult<()> {
        let task_name = self.name();
        let system_index = task_start(&ctx, task_name, "Configuring devices", STEP_WEIGHT).await?;

        let (registry, machine_id) = {
            let ctx = ctx.lock().await;
            (ctx.registry.clone(), ctx.machine_id()?)
        };

        if !self.devices.is_empty() {
            registry
                .configure_devices(&machine_id, &self.devices)
                .await
                .inspect_err(|e| log_task_error(system_index, task_name, e))?;
        }

        for slot in &self.dvd_slots {
            registry
                .attach_medium(
                    &machine_id,
                    &MediumAttachment {
                        slot: slot.clone(),
                        kind: MediumKind::Dvd,
                        location: None,
                    },
                )
                .await
                .inspect_err(|e| log_task_error(system_index, task_name, e))?;
            ctx.lock().await.artifact_mut()?.media.push(MediumArtifact {
                location: None,
                slot: Some(slot.clone()),
            });
        }

        ctx.lock().await.reporter.lock().set_operation_percent(100);
        tracing::debug!(
            system = system_index,
            machine_id = %machine_id,
            adapters = self.devices.network_adapters.len(),
            dvd_drives = self.dvd_slots.len(),
            "Devices configured"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "devices"
    }
}

//! Task: copy (or convert) one disk image and attach it.

use super::{log_task_error, task_start};
use crate::import::types::{ImportCtx, MediumArtifact};
use crate::pipeline::PipelineTask;
use crate::registry::file_store::format_name;
use crate::registry::{AttachmentSlot, ImageCopyRequest, MediumAttachment, MediumKind};
use async_trait::async_trait;
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::path::PathBuf;

const TARGET_FORMAT: &str = "vmdk";

/// One disk of a virtual system, resolved at planning time.
#[derive(Debug, Clone)]
pub struct DiskSource {
    /// Index of the disk item in the system description.
    pub item_index: usize,
    pub source: PathBuf,
    pub target: PathBuf,
    /// Format URI declared by the descriptor, may be empty.
    pub format: String,
    pub slot: AttachmentSlot,
}

impl DiskSource {
    fn needs_conversion(&self) -> bool {
        format_name(&self.format).contains("streamoptimized")
    }
}

pub struct DiskImageTask {
    disk: DiskSource,
    weight: u64,
}

impl DiskImageTask {
    pub fn new(disk: DiskSource, weight: u64) -> Self {
        Self { disk, weight }
    }
}

#[async_trait]
impl PipelineTask<ImportCtx> for DiskImageTask {
    async fn run(self: Box<Self>, ctx: ImportCtx) -> ImportResult<()> {
        let task_name = self.name();
        let disk = &self.disk;
        let file_name = disk
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let system_index = task_start(
            &ctx,
            task_name,
            &format!("Importing disk image {}", file_name),
            self.weight,
        )
        .await?;
        let fail = |e: ImportError| {
            log_task_error(system_index, task_name, &e);
            e
        };

        let (registry, store, reporter, poll_interval, block_size, machine_id) = {
            let ctx = ctx.lock().await;
            (
                ctx.registry.clone(),
                ctx.store.clone(),
                ctx.reporter.clone(),
                ctx.poll_interval,
                ctx.block_size,
                ctx.machine_id()?,
            )
        };

        if tokio::fs::try_exists(&disk.target).await.unwrap_or(false) {
            return Err(fail(ImportError::storage(format!(
                "target image {} already exists",
                disk.target.display()
            ))));
        }
        if let Some(parent) = disk.target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                fail(ImportError::storage_with_code(
                    format!("cannot create {}: {}", parent.display(), e),
                    e.raw_os_error().unwrap_or(-1),
                ))
            })?;
        }

        let request = ImageCopyRequest {
            source: disk.source.clone(),
            target: disk.target.clone(),
            source_format: disk.format.clone(),
            target_format: TARGET_FORMAT.to_string(),
            block_size,
        };
        let sub = if disk.needs_conversion() {
            store.convert_image(&request).await
        } else {
            store.copy_image(&request).await
        }
        .map_err(fail)?;

        tracing::debug!(
            system = system_index,
            item = disk.item_index,
            source_path = %disk.source.display(),
            target_path = %disk.target.display(),
            convert = disk.needs_conversion(),
            "Disk image copy started"
        );

        let cancel = reporter.lock().cancellation_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    sub.cancel();
                    let _ = sub.wait_for_completion(None).await;
                    if let Err(e) = store.delete_image(&disk.target).await {
                        tracing::warn!(target_path = %disk.target.display(), error = %e, "Failed to remove partial image");
                    }
                    let err = reporter
                        .lock()
                        .checkpoint()
                        .err()
                        .unwrap_or_else(|| ImportError::Cancelled("disk image copy cancelled".into()));
                    return Err(fail(err));
                }
                done = sub.wait_for_completion(Some(poll_interval)) => {
                    let done = done.map_err(fail)?;
                    reporter.lock().set_operation_percent(sub.percent());
                    if done {
                        break;
                    }
                }
            }
        }

        match sub.result() {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                if let Err(cleanup) = store.delete_image(&disk.target).await {
                    tracing::warn!(
                        target_path = %disk.target.display(),
                        error = %cleanup,
                        "Failed to remove partial image"
                    );
                }
                return Err(fail(e));
            }
            None => {
                return Err(fail(ImportError::Internal(
                    "image copy completed without a result".into(),
                )));
            }
        }

        // The image exists from here on and must be deleted on rollback.
        let medium_index = {
            let mut ctx = ctx.lock().await;
            let artifact = ctx.artifact_mut()?;
            artifact.media.push(MediumArtifact {
                location: Some(disk.target.clone()),
                slot: None,
            });
            artifact.media.len() - 1
        };

        registry
            .attach_medium(
                &machine_id,
                &MediumAttachment {
                    slot: disk.slot.clone(),
                    kind: MediumKind::HardDisk,
                    location: Some(disk.target.clone()),
                },
            )
            .await
            .map_err(fail)?;

        {
            let mut ctx = ctx.lock().await;
            ctx.artifact_mut()?.media[medium_index].slot = Some(disk.slot.clone());
        }
        reporter.lock().set_operation_percent(100);

        tracing::info!(
            system = system_index,
            machine_id = %machine_id,
            target_path = %disk.target.display(),
            slot = %disk.slot,
            "Disk image imported"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "disk_image"
    }
}

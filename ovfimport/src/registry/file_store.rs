//! Raw block-copy medium store.

use std::path::Path;

use async_trait::async_trait;
use ovfimport_shared::errors::{ImportError, ImportResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ImageCopyRequest, MediumStore};
use crate::progress::{Progress, ProgressReporter};

/// Medium store that copies images byte for byte.
///
/// Format conversion is not available; `convert_image` only succeeds when
/// source and target formats are the same.
#[derive(Debug, Clone, Default)]
pub struct FileMediumStore;

impl FileMediumStore {
    pub fn new() -> Self {
        Self
    }

    fn start_copy(&self, request: &ImageCopyRequest) -> Progress {
        let description = format!(
            "Copying {} to {}",
            request.source.display(),
            request.target.display()
        );
        let (progress, mut reporter) = Progress::new(description, 100);
        let request = request.clone();

        tokio::spawn(async move {
            reporter.begin_operation("copy", 100);
            let result = copy_blocks(&request, &mut reporter).await;
            reporter.complete(result);
        });

        progress
    }
}

/// Short format name: the URI fragment or last path segment, lowercased.
pub fn format_name(format: &str) -> String {
    let tail = format
        .rsplit(['#', '/'])
        .next()
        .unwrap_or(format)
        .trim_end_matches(".html");
    tail.to_ascii_lowercase()
}

async fn copy_blocks(request: &ImageCopyRequest, reporter: &mut ProgressReporter) -> ImportResult<()> {
    let mut source = tokio::fs::File::open(&request.source).await.map_err(|e| {
        ImportError::storage_with_code(
            format!("cannot open {}: {}", request.source.display(), e),
            e.raw_os_error().unwrap_or(-1),
        )
    })?;
    let total = source.metadata().await?.len().max(1);

    let mut target = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&request.target)
        .await
        .map_err(|e| {
            ImportError::storage_with_code(
                format!("cannot create {}: {}", request.target.display(), e),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;

    // Only a target created here is removed on failure.
    let result = copy_into(&mut source, &mut target, total, request.block_size, reporter).await;
    drop(target);
    match result {
        Ok(copied) => {
            tracing::debug!(
                source_path = %request.source.display(),
                target_path = %request.target.display(),
                bytes = copied,
                "Image copied"
            );
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = remove_if_exists(&request.target).await {
                tracing::warn!(
                    target_path = %request.target.display(),
                    error = %cleanup,
                    "Failed to remove partial image"
                );
            }
            Err(e)
        }
    }
}

async fn copy_into(
    source: &mut tokio::fs::File,
    target: &mut tokio::fs::File,
    total: u64,
    block_size: usize,
    reporter: &mut ProgressReporter,
) -> ImportResult<u64> {
    let mut buf = vec![0u8; block_size.max(4096)];
    let mut copied: u64 = 0;
    loop {
        reporter.checkpoint()?;
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        target.write_all(&buf[..n]).await?;
        copied += n as u64;
        reporter.set_operation_percent((copied.saturating_mul(100) / total).min(100) as u8);
    }
    target.flush().await?;
    target.sync_all().await?;
    Ok(copied)
}

async fn remove_if_exists(path: &Path) -> ImportResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImportError::storage_with_code(
            format!("failed to delete {}: {}", path.display(), e),
            e.raw_os_error().unwrap_or(-1),
        )),
    }
}

#[async_trait]
impl MediumStore for FileMediumStore {
    async fn copy_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress> {
        if !tokio::fs::try_exists(&request.source).await.unwrap_or(false) {
            return Err(ImportError::storage(format!(
                "source image {} does not exist",
                request.source.display()
            )));
        }
        if tokio::fs::try_exists(&request.target).await.unwrap_or(false) {
            return Err(ImportError::storage(format!(
                "target {} already exists",
                request.target.display()
            )));
        }
        Ok(self.start_copy(request))
    }

    async fn convert_image(&self, request: &ImageCopyRequest) -> ImportResult<Progress> {
        let from = format_name(&request.source_format);
        let to = format_name(&request.target_format);
        if from != to {
            return Err(ImportError::storage(format!(
                "converting {} from '{}' to '{}' requires an external converter",
                request.source.display(),
                from,
                to
            )));
        }
        self.copy_image(request).await
    }

    async fn delete_image(&self, location: &Path) -> ImportResult<()> {
        remove_if_exists(location).await?;
        tracing::debug!(location = %location.display(), "Deleted image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(dir: &Path, block_size: usize) -> ImageCopyRequest {
        ImageCopyRequest {
            source: dir.join("source.vmdk"),
            target: dir.join("target.vmdk"),
            source_format: "http://www.vmware.com/specifications/vmdk.html#sparse".into(),
            target_format: "vmdk#sparse".into(),
            block_size,
        }
    }

    #[tokio::test]
    async fn test_copy_image() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("source.vmdk"), &data).unwrap();

        let store = FileMediumStore::new();
        let progress = store.copy_image(&request(dir.path(), 4096)).await.unwrap();
        assert!(progress.wait_for_completion(None).await.unwrap());
        assert_eq!(progress.result(), Some(Ok(())));
        assert_eq!(progress.percent(), 100);
        assert_eq!(std::fs::read(dir.path().join("target.vmdk")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_existing_target_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.vmdk"), b"src").unwrap();
        std::fs::write(dir.path().join("target.vmdk"), b"keep me").unwrap();

        let err = FileMediumStore::new()
            .copy_image(&request(dir.path(), 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::StorageIo { .. }));
        assert_eq!(std::fs::read(dir.path().join("target.vmdk")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_cancelled_copy_removes_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.vmdk"), vec![1u8; 64 * 1024]).unwrap();

        let progress = FileMediumStore::new()
            .copy_image(&request(dir.path(), 4096))
            .await
            .unwrap();
        // current-thread runtime: the copy task has not been polled yet
        assert!(progress.cancel());
        progress.wait_for_completion(None).await.unwrap();

        assert!(progress.result().unwrap().unwrap_err().is_cancelled());
        assert!(!dir.path().join("target.vmdk").exists());
    }

    #[tokio::test]
    async fn test_convert_requires_same_format() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.vmdk"), b"src").unwrap();
        let mut req = request(dir.path(), 4096);
        req.source_format =
            "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized".into();

        let err = FileMediumStore::new().convert_image(&req).await.unwrap_err();
        assert!(err.to_string().contains("external converter"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("gone.vmdk");
        std::fs::write(&path, b"x").unwrap();
        let store = FileMediumStore::new();
        store.delete_image(&path).await.unwrap();
        store.delete_image(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_format_name() {
        assert_eq!(
            format_name("http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"),
            "streamoptimized"
        );
        assert_eq!(format_name("VMDK"), "vmdk");
    }
}

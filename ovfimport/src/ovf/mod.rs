//! OVF package reading.
//!
//! ```text
//! path ──▶ package (.ovf / .ova) ──▶ reader ──▶ references ──▶ manifest ──▶ OvfEnvelope
//! ```
//!
//! Nothing here has side effects beyond reading, except unpacking an archive
//! into a scratch directory the caller takes ownership of.

pub mod cim;
pub mod manifest;
pub mod package;
pub mod reader;
pub mod types;

pub use manifest::Manifest;
pub use package::PackageSource;
pub use reader::parse_descriptor;
pub use types::OvfEnvelope;

use crate::options::ImportOptions;
use crate::progress::ProgressReporter;
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::path::Path;
use std::time::Instant;
use tempfile::TempDir;

/// Weight of descriptor parsing in a read operation.
pub const PARSE_WEIGHT: u64 = 10;
/// Weight of manifest hashing in a read operation.
pub const MANIFEST_WEIGHT: u64 = 90;

/// Output of a successful read.
#[derive(Debug)]
pub struct PackageContents {
    pub envelope: OvfEnvelope,
    /// Scratch directory holding an unpacked archive, if any.
    pub scratch: Option<TempDir>,
}

/// Read and validate a package, reporting into `reporter`.
///
/// The reporter must have been created with a total weight of
/// `PARSE_WEIGHT + MANIFEST_WEIGHT`.
pub async fn read_package(
    path: &Path,
    options: &ImportOptions,
    reporter: &mut ProgressReporter,
) -> ImportResult<PackageContents> {
    let start = Instant::now();
    reporter.begin_operation("Reading descriptor", PARSE_WEIGHT);

    let package_path = path.to_path_buf();
    let scratch_root = options.scratch_dir();
    let source = tokio::task::spawn_blocking(move || {
        package::open_package(&package_path, &scratch_root)
    })
    .await
    .map_err(|e| ImportError::Internal(format!("package task failed: {}", e)))??;

    reporter.checkpoint()?;

    let xml = tokio::fs::read_to_string(&source.descriptor_path)
        .await
        .map_err(|e| {
            ImportError::Format(format!(
                "cannot read descriptor {}: {}",
                source.descriptor_path.display(),
                e
            ))
        })?;
    let envelope = parse_descriptor(&xml, &source.descriptor_path)?;
    package::check_references(&envelope)?;
    reporter.set_operation_percent(100);
    reporter.checkpoint()?;

    reporter.begin_operation("Verifying manifest", MANIFEST_WEIGHT);
    let manifest_path = Manifest::path_for(&envelope.descriptor_path);
    if options.verify_manifest && manifest_path.is_file() {
        let text = tokio::fs::read_to_string(&manifest_path).await?;
        let manifest = Manifest::parse(&text)?;
        let required: Vec<String> = envelope.references.iter().map(|f| f.href.clone()).collect();
        let cancel = reporter.cancellation_token();

        manifest
            .verify(
                &envelope.package_dir,
                &required,
                options.copy_block_size,
                &cancel,
                |hashed, total| {
                    let percent = (hashed.saturating_mul(100) / total.max(1)).min(100) as u8;
                    reporter.set_operation_percent(percent);
                },
            )
            .await?;

        tracing::info!(
            manifest = %manifest_path.display(),
            entries = manifest.entries.len(),
            "Manifest verified"
        );
    } else {
        tracing::debug!(
            manifest = %manifest_path.display(),
            "No manifest to verify"
        );
    }
    reporter.set_operation_percent(100);

    tracing::info!(
        package = %path.display(),
        systems = envelope.systems.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Package read"
    );

    Ok(PackageContents {
        envelope,
        scratch: source.scratch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Progress;
    use crate::test_support::fixtures;

    fn options(home: &Path) -> ImportOptions {
        ImportOptions {
            home_dir: home.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_package_with_manifest() {
        let home = tempfile::tempdir().unwrap();
        let package = fixtures::write_package(home.path(), &fixtures::two_system_ovf(), true);

        let (progress, mut reporter) = Progress::new("read", PARSE_WEIGHT + MANIFEST_WEIGHT);
        let contents = read_package(&package, &options(home.path()), &mut reporter)
            .await
            .unwrap();
        reporter.complete(Ok(()));

        assert_eq!(contents.envelope.systems.len(), 2);
        assert!(contents.scratch.is_none());
        assert_eq!(progress.percent(), 100);
    }

    #[tokio::test]
    async fn test_tampered_disk_fails_manifest() {
        let home = tempfile::tempdir().unwrap();
        let package = fixtures::write_package(home.path(), &fixtures::two_system_ovf(), true);
        std::fs::write(package.with_file_name("web-disk1.vmdk"), b"tampered").unwrap();

        let (_progress, mut reporter) = Progress::new("read", PARSE_WEIGHT + MANIFEST_WEIGHT);
        let err = read_package(&package, &options(home.path()), &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::ManifestMismatch(_)));
    }

    #[tokio::test]
    async fn test_missing_referenced_file() {
        let home = tempfile::tempdir().unwrap();
        let package = fixtures::write_package(home.path(), &fixtures::two_system_ovf(), false);
        std::fs::remove_file(package.with_file_name("db-disk1.vmdk")).unwrap();

        let (_progress, mut reporter) = Progress::new("read", PARSE_WEIGHT + MANIFEST_WEIGHT);
        let err = read_package(&package, &options(home.path()), &mut reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingFile(_)));
    }

    #[tokio::test]
    async fn test_manifest_skipped_when_disabled() {
        let home = tempfile::tempdir().unwrap();
        let package = fixtures::write_package(home.path(), &fixtures::two_system_ovf(), true);
        std::fs::write(package.with_file_name("web-disk1.vmdk"), b"tampered").unwrap();

        let mut opts = options(home.path());
        opts.verify_manifest = false;
        let (_progress, mut reporter) = Progress::new("read", PARSE_WEIGHT + MANIFEST_WEIGHT);
        read_package(&package, &opts, &mut reporter).await.unwrap();
        reporter.complete(Ok(()));
    }

    #[tokio::test]
    async fn test_read_ova_archive() {
        let home = tempfile::tempdir().unwrap();
        let ova = fixtures::write_ova(home.path(), &fixtures::two_system_ovf());

        let (_progress, mut reporter) = Progress::new("read", PARSE_WEIGHT + MANIFEST_WEIGHT);
        let contents = read_package(&ova, &options(home.path()), &mut reporter)
            .await
            .unwrap();
        reporter.complete(Ok(()));

        let scratch = contents.scratch.as_ref().unwrap();
        assert!(scratch.path().starts_with(home.path().join("tmp")));
        assert_eq!(contents.envelope.package_dir, scratch.path());
    }
}

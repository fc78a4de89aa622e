//! Package location: a bare `.ovf` descriptor or an `.ova` tar archive.

use super::manifest::is_plain_relative;
use super::types::OvfEnvelope;
use ovfimport_shared::errors::{ImportError, ImportResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A located descriptor, plus the scratch directory an archive was
/// unpacked into. The caller owns the scratch directory.
#[derive(Debug)]
pub struct PackageSource {
    pub descriptor_path: PathBuf,
    pub scratch: Option<TempDir>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    Descriptor,
    Archive,
}

fn package_kind(path: &Path) -> ImportResult<PackageKind> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("ovf") => Ok(PackageKind::Descriptor),
        Some("ova") => Ok(PackageKind::Archive),
        _ => Err(ImportError::Format(format!(
            "{} is neither an .ovf descriptor nor an .ova archive",
            path.display()
        ))),
    }
}

/// Locate the descriptor for `path`, unpacking archives under `scratch_root`.
///
/// Blocking; run it on the blocking pool.
pub fn open_package(path: &Path, scratch_root: &Path) -> ImportResult<PackageSource> {
    if !path.is_file() {
        return Err(ImportError::MissingFile(format!(
            "package {} does not exist",
            path.display()
        )));
    }

    match package_kind(path)? {
        PackageKind::Descriptor => Ok(PackageSource {
            descriptor_path: std::path::absolute(path)?,
            scratch: None,
        }),
        PackageKind::Archive => extract_archive(path, scratch_root),
    }
}

fn extract_archive(path: &Path, scratch_root: &Path) -> ImportResult<PackageSource> {
    std::fs::create_dir_all(scratch_root)?;
    let scratch = tempfile::Builder::new()
        .prefix("ova-")
        .tempdir_in(scratch_root)?;

    let mut archive = tar::Archive::new(File::open(path)?);
    let mut descriptor: Option<PathBuf> = None;

    let entries = archive
        .entries()
        .map_err(|e| ImportError::Format(format!("{} is not a tar archive: {}", path.display(), e)))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| ImportError::Format(format!("corrupt archive entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| ImportError::Format(format!("invalid archive entry name: {}", e)))?
            .into_owned();
        let name = entry_path.to_string_lossy().to_string();

        if !is_plain_relative(&name) {
            return Err(ImportError::Format(format!(
                "archive entry '{}' escapes the package directory",
                name
            )));
        }

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        if !kind.is_file() {
            return Err(ImportError::Format(format!(
                "archive entry '{}' is not a regular file",
                name
            )));
        }

        let target = scratch.path().join(&entry_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;

        if descriptor.is_none() && package_kind(&entry_path).ok() == Some(PackageKind::Descriptor) {
            descriptor = Some(target);
        }
    }

    let descriptor_path = descriptor.ok_or_else(|| {
        ImportError::Format(format!("{} contains no .ovf descriptor", path.display()))
    })?;

    tracing::debug!(
        archive = %path.display(),
        scratch = %scratch.path().display(),
        "Extracted OVA archive"
    );

    Ok(PackageSource {
        descriptor_path,
        scratch: Some(scratch),
    })
}

/// Every `References/File` must exist next to the descriptor.
pub fn check_references(envelope: &OvfEnvelope) -> ImportResult<()> {
    for file in &envelope.references {
        if !is_plain_relative(&file.href) {
            return Err(ImportError::Format(format!(
                "file reference '{}' ({}) is not a relative path inside the package",
                file.id, file.href
            )));
        }
        let path = envelope.package_dir.join(&file.href);
        if !path.is_file() {
            return Err(ImportError::MissingFile(format!(
                "'{}' referenced as '{}' not found in {}",
                file.href,
                file.id,
                envelope.package_dir.display()
            )));
        }
    }
    Ok(())
}

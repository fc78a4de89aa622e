//! OVF manifest (`.mf`) parsing and verification.
//!
//! A manifest line looks like `SHA256(disk1.vmdk)= 3a7bd3e2...`. Files are
//! hashed block by block on the blocking pool. The cancellation token is
//! checked between blocks, and every block's size is sent back so progress
//! follows the bytes hashed.

use ovfimport_shared::errors::{ImportError, ImportResult};
use sha2::Digest;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub algorithm: DigestAlgorithm,
    pub file_name: String,
    /// Lowercase hex digest.
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Manifest path for a descriptor: same directory, same stem, `.mf`.
    pub fn path_for(descriptor_path: &Path) -> PathBuf {
        descriptor_path.with_extension("mf")
    }

    pub fn parse(text: &str) -> ImportResult<Self> {
        let mut entries = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let malformed =
                || ImportError::Format(format!("manifest line {}: malformed entry '{}'", index + 1, line));

            let open = line.find('(').ok_or_else(malformed)?;
            let close = line.rfind(")=").ok_or_else(malformed)?;
            if close <= open {
                return Err(malformed());
            }

            let algorithm = DigestAlgorithm::parse(&line[..open]).ok_or_else(|| {
                ImportError::Format(format!(
                    "manifest line {}: unsupported digest '{}'",
                    index + 1,
                    &line[..open]
                ))
            })?;
            let file_name = line[open + 1..close].trim().to_string();
            let digest = line[close + 2..].trim().to_ascii_lowercase();

            if file_name.is_empty()
                || !is_plain_relative(&file_name)
                || digest.len() != algorithm.hex_len()
                || hex::decode(&digest).is_err()
            {
                return Err(malformed());
            }

            entries.push(ManifestEntry {
                algorithm,
                file_name,
                digest,
            });
        }

        Ok(Self { entries })
    }

    pub fn entry(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    /// Verify every entry against the files in `package_dir`.
    ///
    /// Each name in `required` must be listed. `on_bytes` is called with
    /// `(hashed, total)` after every block, where `total` is the size of all
    /// listed files.
    pub async fn verify(
        &self,
        package_dir: &Path,
        required: &[String],
        block_size: usize,
        cancel: &CancellationToken,
        mut on_bytes: impl FnMut(u64, u64),
    ) -> ImportResult<()> {
        for name in required {
            if self.entry(name).is_none() {
                return Err(ImportError::ManifestMismatch(format!(
                    "'{}' is referenced by the descriptor but not listed in the manifest",
                    name
                )));
            }
        }

        let mut total: u64 = 0;
        for entry in &self.entries {
            let path = package_dir.join(&entry.file_name);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => total += meta.len(),
                _ => {
                    return Err(ImportError::MissingFile(format!(
                        "'{}' is listed in the manifest but does not exist",
                        entry.file_name
                    )));
                }
            }
        }

        let mut hashed: u64 = 0;
        for entry in &self.entries {
            let path = package_dir.join(&entry.file_name);
            let algorithm = entry.algorithm;
            let token = cancel.clone();
            let (block_tx, mut block_rx) = mpsc::unbounded_channel();
            let task = tokio::task::spawn_blocking(move || {
                hash_file(&path, algorithm, block_size, &token, &block_tx)
            });

            // Closes when the hashing thread drops its sender.
            while let Some(bytes) = block_rx.recv().await {
                hashed += bytes;
                on_bytes(hashed, total);
            }
            let actual = task
                .await
                .map_err(|e| ImportError::Internal(format!("digest task failed: {}", e)))??;

            if actual != entry.digest {
                tracing::warn!(
                    file = %entry.file_name,
                    expected = %entry.digest,
                    actual = %actual,
                    "Manifest digest mismatch"
                );
                return Err(ImportError::ManifestMismatch(format!(
                    "digest of '{}' does not match the manifest",
                    entry.file_name
                )));
            }

            tracing::debug!(file = %entry.file_name, "Manifest digest verified");
        }

        Ok(())
    }
}

fn hash_file(
    path: &Path,
    algorithm: DigestAlgorithm,
    block_size: usize,
    cancel: &CancellationToken,
    blocks: &mpsc::UnboundedSender<u64>,
) -> ImportResult<String> {
    match algorithm {
        DigestAlgorithm::Sha1 => hash_with::<sha1::Sha1>(path, block_size, cancel, blocks),
        DigestAlgorithm::Sha256 => hash_with::<sha2::Sha256>(path, block_size, cancel, blocks),
        DigestAlgorithm::Sha512 => hash_with::<sha2::Sha512>(path, block_size, cancel, blocks),
    }
}

fn hash_with<D: Digest>(
    path: &Path,
    block_size: usize,
    cancel: &CancellationToken,
    blocks: &mpsc::UnboundedSender<u64>,
) -> ImportResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; block_size.max(4096)];

    loop {
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled(format!(
                "manifest verification of {}",
                path.display()
            )));
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        // The receiver is gone only when verification was abandoned.
        let _ = blocks.send(n as u64);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// True for a relative path without `..` or root components.
pub(crate) fn is_plain_relative(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

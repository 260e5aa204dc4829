use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::ZipArchive;

use crate::errors::ValidationError;
use crate::validation::UploadPolicy;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Totals gathered from the central directory without inflating anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    index: usize,
    /// Normalized path relative to the extraction directory.
    pub path: PathBuf,
    pub size: u64,
}

/// The file entries of an archive that passed inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePlan {
    pub entries: Vec<ArchiveEntry>,
    pub summary: ArchiveSummary,
}

fn corrupt(e: impl std::fmt::Display) -> ValidationError {
    ValidationError::CorruptArchive(e.to_string())
}

/// Relative path of an entry inside the extraction directory. Any `..`
/// segment, absolute path or drive prefix is rejected outright. Returns
/// `None` for entries that name the directory itself.
fn normalize_entry(name: &str) -> Result<Option<PathBuf>, ValidationError> {
    let traversal = || ValidationError::PathTraversal {
        entry: name.to_string(),
    };

    if name.contains('\0') || name.starts_with('/') || name.starts_with('\\') {
        return Err(traversal());
    }
    let bytes = name.as_bytes();
    if bytes.len() > 1 && bytes[1] == b':' {
        return Err(traversal());
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(traversal()),
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().collect()))
}

/// Check an archive's structure and declared sizes. Reads only the central
/// directory; nothing is inflated and nothing is written.
pub fn inspect_archive(bytes: &[u8], policy: &UploadPolicy) -> Result<ArchivePlan, ValidationError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut compressed: u64 = 0;
    let mut uncompressed: u64 = 0;

    for index in 0..archive.len() {
        let file = archive.by_index_raw(index).map_err(corrupt)?;
        let name = file.name().to_string();

        let path = normalize_entry(&name)?;
        if file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(ValidationError::PathTraversal { entry: name });
        }

        compressed = compressed.saturating_add(file.compressed_size());
        uncompressed = uncompressed.saturating_add(file.size());

        let Some(path) = path else { continue };
        if file.is_dir() {
            continue;
        }
        if !seen.insert(path.clone()) {
            return Err(corrupt(format!("duplicate entry '{}'", name)));
        }
        entries.push(ArchiveEntry {
            index,
            path,
            size: file.size(),
        });
    }

    if compressed == 0 {
        if uncompressed > 0 {
            return Err(ValidationError::ArchiveBomb {
                ratio: f64::INFINITY,
                limit: policy.max_compression_ratio,
            });
        }
    } else {
        let ratio = uncompressed as f64 / compressed as f64;
        if ratio > policy.max_compression_ratio as f64 {
            return Err(ValidationError::ArchiveBomb {
                ratio,
                limit: policy.max_compression_ratio,
            });
        }
    }

    if uncompressed > policy.max_archive_size {
        return Err(ValidationError::ArchiveTooLarge {
            size: uncompressed,
            limit: policy.max_archive_size,
        });
    }

    let summary = ArchiveSummary {
        files: entries.len(),
        compressed_bytes: compressed,
        uncompressed_bytes: uncompressed,
    };
    Ok(ArchivePlan { entries, summary })
}

/// Inflate the planned entries under `dest`, streaming each one to disk.
///
/// `dest` must be scratch space: an entry that inflates to anything other
/// than its declared size fails the whole unpack with `CorruptArchive`,
/// and the caller discards whatever was written. Blocking.
pub fn unpack_archive(bytes: &[u8], plan: &ArchivePlan, dest: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;
    for entry in &plan.entries {
        let target = dest.join(&entry.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = archive.by_index(entry.index).map_err(corrupt)?;
        let mut reader = file.take(entry.size.saturating_add(1));
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("Failed to stage '{}'", entry.path.display()))?;
        let written = std::io::copy(&mut reader, &mut out).map_err(corrupt)?;
        if written != entry.size {
            return Err(corrupt(format!(
                "entry '{}' inflated to {} bytes but declares {}",
                entry.path.display(),
                written,
                entry.size
            ))
            .into());
        }
    }
    Ok(plan.entries.len())
}

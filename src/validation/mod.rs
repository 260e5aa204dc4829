//! Upload safety checks. Nothing is written under a job directory until an
//! upload has passed every check in this module.

pub mod archive;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use axum::body::Bytes;

use crate::errors::{PipelineError, ValidationError};
use crate::models::{JobId, PipelineConfig};
use crate::storage::JobLayout;

pub use archive::{inspect_archive, unpack_archive, ArchiveEntry, ArchivePlan, ArchiveSummary};

const DANGEROUS_PATTERNS: [&str; 9] = ["..", "~", "$", "`", "|", ";", "&", "\n", "\r"];
const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_file_size: u64,
    pub max_archive_size: u64,
    pub max_compression_ratio: u64,
    /// Lower-case, without the leading dot.
    pub allowed_extensions: BTreeSet<String>,
}

impl UploadPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_file_size: config.max_upload_size,
            max_archive_size: config.max_archive_size,
            max_compression_ratio: config.max_compression_ratio,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Byte limit for an upload with this (already validated) name.
    pub fn limit_for(&self, name: &str) -> u64 {
        if is_archive_name(name) {
            self.max_archive_size
        } else {
            self.max_file_size
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_archive_name(name: &str) -> bool {
    extension_of(name).as_deref() == Some(ARCHIVE_EXTENSION)
}

/// Reduce a client-supplied name to its final component and check it.
/// Returns the name the upload will be stored under.
pub fn validate_file_name(raw: &str, policy: &UploadPolicy) -> Result<String, ValidationError> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let invalid = |reason: &str| ValidationError::InvalidFileName {
        name: raw.to_string(),
        reason: reason.to_string(),
    };

    if name.contains('\0') {
        return Err(invalid("contains a null byte"));
    }
    if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| name.contains(**p)) {
        return Err(invalid(&format!(
            "contains dangerous pattern {:?}",
            pattern
        )));
    }
    if name.is_empty() || name == "." {
        return Err(invalid("empty name"));
    }

    match extension_of(name) {
        Some(ext) if policy.allowed_extensions.contains(&ext) => Ok(name.to_string()),
        ext => Err(ValidationError::DisallowedExtension {
            name: name.to_string(),
            extension: ext.unwrap_or_default(),
        }),
    }
}

/// Reject an upload by its announced length, before any body is read.
pub fn check_declared_size(
    name: &str,
    size: u64,
    policy: &UploadPolicy,
) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError::EmptyFile {
            name: name.to_string(),
        });
    }
    let limit = policy.limit_for(name);
    if size > limit {
        return Err(ValidationError::FileTooLarge {
            name: name.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}

/// An upload that passed validation and is ready to be written. The body
/// is shared, not copied.
#[derive(Debug)]
pub enum ValidatedUpload {
    File {
        name: String,
        contents: Bytes,
    },
    Archive {
        name: String,
        dir_name: String,
        contents: Bytes,
        plan: ArchivePlan,
    },
}

impl ValidatedUpload {
    pub fn name(&self) -> &str {
        match self {
            ValidatedUpload::File { name, .. } | ValidatedUpload::Archive { name, .. } => name,
        }
    }

    /// Bytes this upload occupies once written.
    pub fn disk_bytes(&self) -> u64 {
        match self {
            ValidatedUpload::File { contents, .. } => contents.len() as u64,
            ValidatedUpload::Archive { plan, .. } => plan.summary.uncompressed_bytes,
        }
    }
}

/// Run every check on an upload held in memory. Archives are inspected
/// from their central directory; nothing is inflated or written here.
pub fn validate_upload(
    raw_name: &str,
    contents: Bytes,
    policy: &UploadPolicy,
) -> Result<ValidatedUpload, ValidationError> {
    let name = validate_file_name(raw_name, policy)?;
    check_declared_size(&name, contents.len() as u64, policy)?;

    if !is_archive_name(&name) {
        return Ok(ValidatedUpload::File { name, contents });
    }

    let plan = inspect_archive(&contents, policy)?;
    if plan.entries.is_empty() {
        return Err(ValidationError::EmptyFile { name });
    }
    let dir_name = name[..name.len() - ARCHIVE_EXTENSION.len() - 1].to_string();
    Ok(ValidatedUpload::Archive {
        name,
        dir_name,
        contents,
        plan,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AcceptedUpload {
    pub name: String,
    /// Path relative to the job's uploads directory.
    pub stored_as: String,
    pub files: usize,
    pub bytes: u64,
}

/// Write a validated upload into the job's uploads directory.
///
/// Content is assembled in a scratch directory beside the job roots and
/// renamed into place, so a failed write leaves the job untouched. An
/// existing upload with the same name is replaced.
pub async fn accept_upload(
    layout: &JobLayout,
    job_id: &JobId,
    upload: ValidatedUpload,
) -> Result<AcceptedUpload> {
    let job_dir = layout.job_dir(job_id);
    if !tokio::fs::try_exists(&job_dir).await.unwrap_or(false) {
        return Err(PipelineError::NotFound(format!("Job '{}' not found", job_id)).into());
    }

    let staging = layout.staging_dir();
    tokio::fs::create_dir_all(&staging)
        .await
        .context("Failed to create staging directory")?;

    let result = stage_and_commit(&staging, &layout.uploads_dir(job_id), upload).await;
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", staging.display(), e);
        }
    }
    let accepted = result?;

    tracing::info!(
        "Accepted upload '{}' for job {} ({} files, {} bytes)",
        accepted.name,
        job_id,
        accepted.files,
        accepted.bytes
    );
    Ok(accepted)
}

async fn stage_and_commit(
    staging: &Path,
    uploads: &Path,
    upload: ValidatedUpload,
) -> Result<AcceptedUpload> {
    let bytes = upload.disk_bytes();
    let (name, stored_as, files) = match upload {
        ValidatedUpload::File { name, contents } => {
            tokio::fs::write(staging.join(&name), &contents)
                .await
                .with_context(|| format!("Failed to stage '{}'", name))?;
            (name.clone(), name, 1)
        }
        ValidatedUpload::Archive {
            name,
            dir_name,
            contents,
            plan,
        } => {
            let root = staging.join(&dir_name);
            let files = tokio::task::spawn_blocking(move || unpack_archive(&contents, &plan, &root))
                .await
                .context("Archive unpack panicked")??;
            (name, dir_name, files)
        }
    };

    tokio::fs::create_dir_all(uploads)
        .await
        .context("Failed to create uploads directory")?;
    let target = uploads.join(&stored_as);
    match tokio::fs::symlink_metadata(&target).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await?,
        Ok(_) => tokio::fs::remove_file(&target).await?,
        Err(_) => {}
    }
    tokio::fs::rename(staging.join(&stored_as), &target)
        .await
        .with_context(|| format!("Failed to move '{}' into uploads", stored_as))?;

    Ok(AcceptedUpload {
        name,
        stored_as,
        files,
        bytes,
    })
}

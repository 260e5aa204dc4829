use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::models::{JobId, Stage};

pub const STAGING_PREFIX: &str = ".staging-";
pub const TRASH_PREFIX: &str = ".trash-";

/// On-disk layout of the job storage root:
///
/// ```text
/// <root>/<job_id>/uploads/...
/// <root>/<job_id>/<stage>/status.json
/// <root>/<job_id>/<stage>/tool.log
/// <root>/<job_id>/<stage>/output/...
/// <root>/.staging-<uuid>/        upload being validated
/// <root>/.trash-<job_id>-<uuid>/ job being deleted
/// ```
///
/// The job directory is the unit of deletion. Scratch directories start with
/// a dot, which no job id can, so they never show up as jobs.
#[derive(Debug, Clone)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    pub fn uploads_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("uploads")
    }

    pub fn stage_dir(&self, job_id: &JobId, stage: Stage) -> PathBuf {
        self.job_dir(job_id).join(stage.dir_name())
    }

    pub fn status_file(&self, job_id: &JobId, stage: Stage) -> PathBuf {
        self.stage_dir(job_id, stage).join("status.json")
    }

    pub fn output_dir(&self, job_id: &JobId, stage: Stage) -> PathBuf {
        self.stage_dir(job_id, stage).join("output")
    }

    pub fn tool_log(&self, job_id: &JobId, stage: Stage) -> PathBuf {
        self.stage_dir(job_id, stage).join("tool.log")
    }

    /// Directory a stage reads from: the previous stage's output, or the
    /// uploads for the first stage.
    pub fn input_dir(&self, job_id: &JobId, stage: Stage) -> PathBuf {
        match stage.previous() {
            Some(prev) => self.output_dir(job_id, prev),
            None => self.uploads_dir(job_id),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root
            .join(format!("{}{}", STAGING_PREFIX, Uuid::now_v7().simple()))
    }

    pub fn trash_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!(
            "{}{}-{}",
            TRASH_PREFIX,
            job_id,
            Uuid::now_v7().simple()
        ))
    }

    /// Job ids with a directory under the root. Scratch and stray entries are skipped.
    pub fn list_job_ids(&self) -> std::io::Result<Vec<JobId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| JobId::parse(n).ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
fn is_scratch_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(id: &str) -> JobId {
        JobId::parse(id).expect("job id")
    }

    #[test]
    fn test_paths_are_scoped_to_job() {
        let layout = JobLayout::new("/data/jobs");
        let id = job("abc123");
        assert_eq!(layout.job_dir(&id), PathBuf::from("/data/jobs/abc123"));
        assert_eq!(
            layout.status_file(&id, Stage::DetectPockets),
            PathBuf::from("/data/jobs/abc123/detect_pockets/status.json")
        );
        assert_eq!(
            layout.output_dir(&id, Stage::Docking),
            PathBuf::from("/data/jobs/abc123/docking/output")
        );
    }

    #[test]
    fn test_input_dir_chains_stages() {
        let layout = JobLayout::new("/data/jobs");
        let id = job("abc123");
        assert_eq!(
            layout.input_dir(&id, Stage::ExtractFrames),
            layout.uploads_dir(&id)
        );
        assert_eq!(
            layout.input_dir(&id, Stage::ClusterPockets),
            layout.output_dir(&id, Stage::DetectPockets)
        );
    }

    #[test]
    fn test_scratch_dirs_are_recognised() {
        let layout = JobLayout::new("/data/jobs");
        let staging = layout.staging_dir();
        let trash = layout.trash_dir(&job("abc123"));
        for dir in [staging, trash] {
            let name = dir.file_name().and_then(|n| n.to_str()).expect("name");
            assert!(is_scratch_name(name), "{} should be scratch", name);
            assert!(JobId::parse(name).is_err());
        }
    }

    #[test]
    fn test_list_job_ids_skips_scratch_and_files() {
        let tmp = TempDir::new().expect("create temp dir");
        let layout = JobLayout::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("job-b")).expect("mkdir");
        std::fs::create_dir_all(tmp.path().join("job-a")).expect("mkdir");
        std::fs::create_dir_all(layout.staging_dir()).expect("mkdir");
        std::fs::write(tmp.path().join("stray.txt"), b"x").expect("write");

        let ids = layout.list_job_ids().expect("list");
        assert_eq!(ids, vec![job("job-a"), job("job-b")]);
    }

    #[test]
    fn test_list_job_ids_missing_root_is_empty() {
        let tmp = TempDir::new().expect("create temp dir");
        let layout = JobLayout::new(tmp.path().join("nope"));
        assert!(layout.list_job_ids().expect("list").is_empty());
    }
}

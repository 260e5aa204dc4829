use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;

const MAX_JOB_ID_LEN: usize = 64;

/// Opaque job identifier. Doubles as the job's directory name, so only
/// characters that are safe as a single path component are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn mint() -> Self {
        JobId(Uuid::now_v7().simple().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        if s.is_empty() || s.len() > MAX_JOB_ID_LEN {
            return Err(PipelineError::InvalidRequest(format!(
                "job_id must be 1 to {} characters",
                MAX_JOB_ID_LEN
            )));
        }
        if !s.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(PipelineError::InvalidRequest(format!(
                "job_id '{}' must start with a letter or digit",
                s
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PipelineError::InvalidRequest(format!(
                "job_id '{}' may only contain letters, digits, '-' and '_'",
                s
            )));
        }
        Ok(JobId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        JobId::parse(&s)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_ids_are_unique_and_valid() {
        let a = JobId::mint();
        let b = JobId::mint();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(JobId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_parse_accepts_plain_ids() {
        for id in ["abc123", "job-1", "run_2024_01", "A"] {
            assert!(JobId::parse(id).is_ok(), "{} should parse", id);
        }
    }

    #[test]
    fn test_parse_rejects_path_like_ids() {
        for id in ["", "..", ".hidden", "a/b", "a\\b", "-lead", "x y", "job$1"] {
            assert!(JobId::parse(id).is_err(), "{:?} should be rejected", id);
        }
    }

    #[test]
    fn test_parse_rejects_overlong() {
        let id = "a".repeat(65);
        assert!(JobId::parse(&id).is_err());
        assert!(JobId::parse(&id[..64]).is_ok());
    }

    #[test]
    fn test_serde_validates_on_deserialize() {
        let id: JobId = serde_json::from_str("\"abc123\"").expect("deserialize");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"abc123\"");
        assert!(serde_json::from_str::<JobId>("\"../etc\"").is_err());
    }
}

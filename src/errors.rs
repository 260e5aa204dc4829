use thiserror::Error;

/// Reasons an upload is refused before anything reaches the job directory.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("File '{name}' is {size} bytes, exceeding the limit of {limit} bytes")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("File '{name}' is empty")]
    EmptyFile { name: String },

    #[error("Invalid file name '{name}': {reason}")]
    InvalidFileName { name: String, reason: String },

    #[error("File extension '{extension}' is not allowed (file '{name}')")]
    DisallowedExtension { name: String, extension: String },

    #[error("Archive entry '{entry}' escapes the extraction directory")]
    PathTraversal { entry: String },

    #[error("Archive compression ratio {ratio:.1}:1 exceeds the limit of {limit}:1")]
    ArchiveBomb { ratio: f64, limit: u64 },

    #[error("Archive expands to {size} bytes, exceeding the limit of {limit} bytes")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("Invalid or corrupted archive: {0}")]
    CorruptArchive(String),
}

impl ValidationError {
    /// Stable reason code reported to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::FileTooLarge { .. } => "file_too_large",
            ValidationError::EmptyFile { .. } => "empty_file",
            ValidationError::InvalidFileName { .. } => "invalid_file_name",
            ValidationError::DisallowedExtension { .. } => "disallowed_extension",
            ValidationError::PathTraversal { .. } => "path_traversal",
            ValidationError::ArchiveBomb { .. } => "archive_bomb",
            ValidationError::ArchiveTooLarge { .. } => "archive_too_large",
            ValidationError::CorruptArchive(_) => "corrupt_archive",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevpoolError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workspace error for job {job_id}: {reason}")]
    Workspace { job_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RevpoolError {
    pub fn workspace(job_id: &str, reason: impl Into<String>) -> Self {
        Self::Workspace {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Fatal errors abort the whole run before any job is dispatched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, RevpoolError>;

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Registry fault: {0}")]
    RegistryFault(String),

    #[error("Job registry is shut down")]
    RegistryClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn fault<E: std::fmt::Display>(e: E) -> Self {
        Self::RegistryFault(e.to_string())
    }
}

/// Rejection of a job request at `create()`; no job is recorded
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Job has no tasks")]
    EmptyJob,

    #[error("Invalid path: {path} escapes {root}")]
    OutsideSandbox { path: PathBuf, root: PathBuf },

    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid file name: {path}")]
    InvalidName { path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

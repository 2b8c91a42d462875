use crate::descriptor::TaskDescriptor;
use thiserror::Error;

/// Failure of a single transform call
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Rejected(String),
}

impl TransformError {
    pub fn rejected<E: std::fmt::Display>(e: E) -> Self {
        Self::Rejected(e.to_string())
    }
}

/// Per-task computation driven by the batch executor.
///
/// Implementations are called concurrently from worker threads, always with
/// disjoint outputs, and must never write to `input` or `gradient`.
/// The `Ok` string becomes the task's progress message.
pub trait Transform: Send + Sync {
    fn apply(&self, task: &TaskDescriptor) -> Result<String, TransformError>;
}

/// Closure adapter for [`Transform`]
pub struct FnTransform<F>(F);

impl<F> FnTransform<F>
where
    F: Fn(&TaskDescriptor) -> Result<String, TransformError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&TaskDescriptor) -> Result<String, TransformError> + Send + Sync,
{
    fn apply(&self, task: &TaskDescriptor) -> Result<String, TransformError> {
        (self.0)(task)
    }
}

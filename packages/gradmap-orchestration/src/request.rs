//! Job requests and their validation
//!
//! Requests name files relative to the configured sandbox roots. Every
//! reference is canonicalized and must stay under its root; absolute paths,
//! `..` segments and symlinks pointing elsewhere are all rejected the same
//! way.

use crate::config::EngineConfig;
use crate::error::ValidationError;
use gradmap_core::{output_file_name, OutputFormat, Quality, TaskDescriptor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One requested mapping, relative to the sandbox roots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Input image, relative to `input_root`
    pub image_name: String,
    /// Gradient image, relative to `gradient_root`
    pub gradient_path: String,
}

impl TaskSpec {
    pub fn new(image_name: impl Into<String>, gradient_path: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            gradient_path: gradient_path.into(),
        }
    }
}

/// Settings shared by every task of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub output_format: OutputFormat,
    pub quality: Quality,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Overrides the configured worker count for this job
    pub parallelism: Option<usize>,
}

/// Validated tasks plus the outputs they are expected to produce
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub tasks: Vec<TaskDescriptor>,
    pub outputs: Vec<PathBuf>,
}

fn io_error(path: &Path, source: std::io::Error) -> ValidationError {
    ValidationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve `relative` under `root`, refusing anything that lands outside it
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, ValidationError> {
    let root = root.canonicalize().map_err(|e| io_error(root, e))?;
    let candidate = root.join(relative);

    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::NotFound {
                path: PathBuf::from(relative),
            })
        }
        Err(e) => return Err(io_error(&candidate, e)),
    };

    if !resolved.starts_with(&root) {
        return Err(ValidationError::OutsideSandbox {
            path: PathBuf::from(relative),
            root,
        });
    }
    if !resolved.is_file() {
        return Err(ValidationError::InvalidName {
            path: PathBuf::from(relative),
        });
    }
    Ok(resolved)
}

/// Turn a request into task descriptors; fails on the first bad reference.
///
/// Creates `output_root` when missing.
pub fn prepare(
    config: &EngineConfig,
    specs: &[TaskSpec],
    options: &JobOptions,
) -> Result<PreparedJob, ValidationError> {
    if specs.is_empty() {
        return Err(ValidationError::EmptyJob);
    }

    let mut tasks = Vec::with_capacity(specs.len());
    let mut outputs = Vec::with_capacity(specs.len());

    for spec in specs {
        let input = resolve_within(&config.input_root, &spec.image_name)
            .inspect_err(|e| warn!("Rejected input reference: {}", e))?;
        let gradient = resolve_within(&config.gradient_root, &spec.gradient_path)
            .inspect_err(|e| warn!("Rejected gradient reference: {}", e))?;

        let name = output_file_name(
            Path::new(&spec.image_name),
            Path::new(&spec.gradient_path),
            options.prefix.as_deref(),
            options.suffix.as_deref(),
            options.output_format,
        );
        let output = config.output_root.join(name);

        outputs.push(output.clone());
        tasks.push(TaskDescriptor::new(
            input,
            gradient,
            output,
            options.quality,
            options.output_format,
        ));
    }

    std::fs::create_dir_all(&config.output_root).map_err(|e| io_error(&config.output_root, e))?;

    Ok(PreparedJob { tasks, outputs })
}

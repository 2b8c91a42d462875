use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Output encoding for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

#[derive(Debug, Error)]
#[error("Unknown output format '{0}'. Valid formats: png, jpeg, webp")]
pub struct UnknownFormat(pub String);

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        }
    }

    /// File extension written for this format
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Whether the encoder honors [`Quality`]
    pub fn is_lossy(&self) -> bool {
        matches!(self, OutputFormat::Jpeg)
    }
}

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid quality {0}: expected 1..=100")]
pub struct QualityError(pub u8);

/// Encoder quality, always within `1..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 100;

    pub fn new(value: u8) -> Result<Self, QualityError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(QualityError(value))
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(95)
    }
}

impl TryFrom<u8> for Quality {
    type Error = QualityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work: map `gradient` over `input`, write `output`.
///
/// Descriptors are built once when a job is created and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    input: PathBuf,
    gradient: PathBuf,
    output: PathBuf,
    quality: Quality,
    format: OutputFormat,
}

impl TaskDescriptor {
    pub fn new(
        input: impl Into<PathBuf>,
        gradient: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        quality: Quality,
        format: OutputFormat,
    ) -> Self {
        Self {
            input: input.into(),
            gradient: gradient.into(),
            output: output.into(),
            quality,
            format,
        }
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn gradient(&self) -> &Path {
        &self.gradient
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Input file name for log lines and per-task messages
    pub fn input_name(&self) -> String {
        display_name(&self.input)
    }

    pub fn output_name(&self) -> String {
        display_name(&self.output)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

//! Error types for the PCA engine

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Read,
    Estimator,
    EigenDecomposition,
    Reconstruction,
    Write,
    PostProcess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Estimator => "estimator",
            Stage::EigenDecomposition => "eigen-decomposition",
            Stage::Reconstruction => "reconstruction",
            Stage::Write => "write",
            Stage::PostProcess => "post-process",
        };
        f.write_str(name)
    }
}

/// Coarse classification of a [`PcaError`], independent of the stage it surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputMismatch,
    MissingNodata,
    SingularInput,
    Io,
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum PcaError {
    #[error("input mismatch: {0}")]
    InputMismatch(String),

    #[error("no nodata value set on band 1 of {0}")]
    MissingNodata(String),

    #[error("singular input: {0}")]
    SingularInput(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("raster error on {}: {message}", path.display())]
    Raster { path: PathBuf, message: String },

    #[error("invalid argument: {name} = {value} ({reason})")]
    InvalidArgument {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{stage} stage failed in {unit}: {source}")]
    Stage {
        stage: Stage,
        unit: String,
        #[source]
        source: Box<PcaError>,
    },
}

impl PcaError {
    pub fn invalid_argument(
        name: &'static str,
        value: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        PcaError::InvalidArgument {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PcaError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn raster(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        PcaError::Raster {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Classification of the root cause, looking through stage wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PcaError::InputMismatch(_) => ErrorKind::InputMismatch,
            PcaError::MissingNodata(_) => ErrorKind::MissingNodata,
            PcaError::SingularInput(_) => ErrorKind::SingularInput,
            PcaError::Io { .. } | PcaError::Raster { .. } => ErrorKind::Io,
            PcaError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            PcaError::Stage { source, .. } => source.kind(),
        }
    }

    /// Outermost stage this error was attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PcaError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Name of the unit of work that failed, if the error went through the scheduler.
    pub fn unit(&self) -> Option<&str> {
        match self {
            PcaError::Stage { unit, .. } => Some(unit.as_str()),
            _ => None,
        }
    }

    pub(crate) fn in_stage(self, stage: Stage, unit: impl Into<String>) -> Self {
        match self {
            // keep the innermost attribution
            already @ PcaError::Stage { .. } => already,
            other => PcaError::Stage {
                stage,
                unit: unit.into(),
                source: Box::new(other),
            },
        }
    }
}

/// Attaches a [`Stage`] to a failing result.
pub trait StageContext<T> {
    fn stage(self, stage: Stage, unit: impl Into<String>) -> Result<T>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: Stage, unit: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.in_stage(stage, unit))
    }
}

pub type Result<T> = std::result::Result<T, PcaError>;

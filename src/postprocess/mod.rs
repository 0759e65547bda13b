//! Post-write hooks run on each output file, such as overview building.
//!
//! A failing hook never changes the outcome of a run; the components are
//! already on disk by the time hooks start.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use log::info;

use crate::error::{PcaError, Result, Stage};
use crate::scheduler::{TaskScheduler, Unit};

pub trait PostProcessor: Send + Sync {
    fn process(&self, path: &Path) -> anyhow::Result<()>;
}

/// Builds overviews with GDAL's `gdaladdo`.
#[derive(Debug, Clone)]
pub struct Gdaladdo {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for Gdaladdo {
    fn default() -> Self {
        Gdaladdo {
            program: PathBuf::from("gdaladdo"),
            args: ["-q", "--config", "BIGTIFF_OVERVIEW", "YES"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Gdaladdo {
    /// Runs `program` with `args` followed by the file path.
    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Gdaladdo {
            program: program.into(),
            args,
        }
    }
}

impl PostProcessor for Gdaladdo {
    fn process(&self, path: &Path) -> anyhow::Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .status()
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !status.success() {
            bail!("{} exited with {}", self.program.display(), status);
        }
        Ok(())
    }
}

/// Runs `processor` on every path on a dedicated pool of `workers` threads.
///
/// Returns the number of files the processor failed on.
pub fn run_post_processing(
    processor: &dyn PostProcessor,
    paths: &[PathBuf],
    workers: usize,
) -> Result<usize> {
    if workers == 0 {
        return Err(PcaError::invalid_argument(
            "overview_workers",
            workers,
            "must be positive",
        ));
    }
    let scheduler = TaskScheduler::new(workers)?;
    let units: Vec<Unit> = paths.iter().cloned().map(Unit::File).collect();
    let failed = scheduler.run_best_effort(Stage::PostProcess, &units, |unit| match unit {
        Unit::File(path) => processor
            .process(path)
            .with_context(|| format!("post-processing {}", path.display())),
        other => bail!("unexpected unit {other}"),
    });
    info!(
        "post-processed {} of {} files",
        paths.len() - failed,
        paths.len()
    );
    Ok(failed)
}

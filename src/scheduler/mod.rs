//! # Task scheduling
//!
//! Every stage of a run is a fan-out of independent [`Unit`]s over one bounded
//! rayon pool. [`TaskScheduler::run`] returns only once every unit of the
//! stage has finished, so consecutive calls form the dependency barriers of
//! the pipeline (means before the matrix, the matrix before reconstruction).

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{PcaError, Result, Stage, StageContext};

/// A unit of work in the run's task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// One band of the stack, 0-based.
    Band(usize),
    /// One cell of the upper triangle of the estimator matrix.
    Pair(usize, usize),
    /// One output component, 0-based.
    Component(usize),
    /// Post-processing of one written file.
    File(PathBuf),
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Band(b) => write!(f, "band {}", b + 1),
            Unit::Pair(i, j) => write!(f, "pair ({}, {})", i + 1, j + 1),
            Unit::Component(k) => write!(f, "component {}", k + 1),
            Unit::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

pub struct TaskScheduler {
    pool: ThreadPool,
    workers: usize,
}

impl TaskScheduler {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(PcaError::invalid_argument("threads", workers, "must be positive"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("pca-worker-{i}"))
            .build()
            .map_err(|e| PcaError::invalid_argument("threads", workers, e.to_string()))?;
        Ok(TaskScheduler { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `units` concurrently and returns their results in unit order.
    ///
    /// Scheduling stops at the first failure, which is returned tagged with
    /// `stage` and the failing unit.
    pub fn run<T, F>(&self, stage: Stage, units: &[Unit], f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Unit) -> Result<T> + Sync,
    {
        let start = Instant::now();
        let results = self.pool.install(|| {
            units
                .par_iter()
                .map(|unit| -> Result<T> {
                    let unit_start = Instant::now();
                    let out = f(unit).stage(stage, unit.to_string())?;
                    debug!("{stage}: {unit} done in {:?}", unit_start.elapsed());
                    Ok(out)
                })
                .collect::<Result<Vec<T>>>()
        })?;
        debug!(
            "{stage}: {} units on {} workers in {:?}",
            units.len(),
            self.workers,
            start.elapsed()
        );
        Ok(results)
    }

    /// Runs every unit to completion, logging failures instead of returning them.
    ///
    /// Returns the number of failed units.
    pub fn run_best_effort<F>(&self, stage: Stage, units: &[Unit], f: F) -> usize
    where
        F: Fn(&Unit) -> anyhow::Result<()> + Sync,
    {
        self.pool.install(|| {
            units
                .par_iter()
                .filter(|unit| match f(unit) {
                    Ok(()) => false,
                    Err(e) => {
                        warn!("{stage}: {unit} failed: {e:#}");
                        true
                    }
                })
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_preserves_unit_order() {
        let scheduler = TaskScheduler::new(4).unwrap();
        let units: Vec<Unit> = (0..32).map(Unit::Band).collect();
        let out = scheduler
            .run(Stage::Estimator, &units, |unit| match unit {
                Unit::Band(b) => Ok(b * 10),
                _ => unreachable!(),
            })
            .unwrap();
        assert_eq!(out, (0..32).map(|b| b * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_reports_failing_unit() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let units: Vec<Unit> = (0..3).map(Unit::Component).collect();
        let err = scheduler
            .run(Stage::Reconstruction, &units, |unit| match unit {
                Unit::Component(1) => Err(PcaError::raster("b.tif", "short read")),
                _ => Ok(()),
            })
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Reconstruction));
        assert_eq!(err.unit(), Some("component 2"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_best_effort_counts_failures() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let calls = AtomicUsize::new(0);
        let units = vec![
            Unit::File(PathBuf::from("pc_1.tif")),
            Unit::File(PathBuf::from("pc_2.tif")),
            Unit::File(PathBuf::from("pc_3.tif")),
        ];
        let failed = scheduler.run_best_effort(Stage::PostProcess, &units, |unit| {
            calls.fetch_add(1, Ordering::SeqCst);
            match unit {
                Unit::File(p) if p.ends_with("pc_2.tif") => anyhow::bail!("no gdaladdo"),
                _ => Ok(()),
            }
        });
        assert_eq!(failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert_eq!(
            TaskScheduler::new(0).err().map(|e| e.kind()),
            Some(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_unit_display_is_one_based() {
        assert_eq!(Unit::Band(0).to_string(), "band 1");
        assert_eq!(Unit::Pair(0, 2).to_string(), "pair (1, 3)");
        assert_eq!(Unit::Component(4).to_string(), "component 5");
    }
}

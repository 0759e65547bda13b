//! # PCA runs
//!
//! [`PcaEngine`] wires the stages together:
//!
//! 1. stack the bands of A (and B) and check their dimensions,
//! 2. build the nodata mask,
//! 3. stream the band means, then (once all are known) the estimator matrix,
//! 4. factor the matrix and keep the leading eigenvectors,
//! 5. reconstruct and write each component,
//! 6. optionally run a post-processor on every written file.
//!
//! Nothing is written before step 5. A failure in any step ends the run and
//! is reported with the stage it happened in.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{check_nodata, Estimator, NodataPolicy, PcaConfig};
use crate::error::{PcaError, Result, Stage, StageContext};
use crate::mask::{BandStack, NodataMask};
use crate::pca::EigenBasis;
use crate::postprocess::{run_post_processing, Gdaladdo, PostProcessor};
use crate::raster::{GeoTiffSource, RasterSource};
use crate::reconstruction::{reconstruct_all, ComponentSink, GeoTiffDirectory, WrittenComponent};
use crate::scheduler::TaskScheduler;
use crate::statistics::{self, BandStatistics};

pub const REPORT_FILE_NAME: &str = "pca_stats.json";

pub struct PcaEngine {
    config: PcaConfig,
    scheduler: TaskScheduler,
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct PcaOutcome {
    pub nodata: Option<f64>,
    pub band_count: usize,
    pub statistics: BandStatistics,
    pub basis: EigenBasis,
    pub components: Vec<WrittenComponent>,
    /// Files the post-processor failed on; these do not fail the run.
    pub post_process_failures: usize,
}

/// Serializable summary of a run, written next to the components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaReport {
    pub estimator: Estimator,
    pub band_count: usize,
    pub valid_pixels: usize,
    #[serde(with = "crate::config::nodata_serde::option")]
    pub nodata: Option<f64>,
    pub means: Vec<f64>,
    pub matrix: Vec<Vec<f64>>,
    pub eigenvalues: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub eigenvectors: Vec<Vec<f64>>,
    pub outputs: Vec<PathBuf>,
}

impl PcaOutcome {
    pub fn report(&self) -> PcaReport {
        PcaReport {
            estimator: self.statistics.estimator,
            band_count: self.band_count,
            valid_pixels: self.statistics.valid_pixels,
            nodata: self.nodata,
            means: self.statistics.means.to_vec(),
            matrix: self
                .statistics
                .matrix
                .rows()
                .into_iter()
                .map(|r| r.to_vec())
                .collect(),
            eigenvalues: self.basis.eigenvalues().to_vec(),
            explained_variance_ratio: self.basis.explained_variance_ratio().to_vec(),
            eigenvectors: self
                .basis
                .components()
                .rows()
                .into_iter()
                .map(|r| r.to_vec())
                .collect(),
            outputs: self.paths(),
        }
    }

    /// Paths of the written components, in component order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.components
            .iter()
            .filter_map(|c| c.path.clone())
            .collect()
    }
}

pub fn write_report(path: impl AsRef<Path>, report: &PcaReport) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| PcaError::io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .map_err(|e| PcaError::io(path, e.into()))
}

/// Nodata value in effect for a run.
pub fn resolve_nodata(policy: NodataPolicy, a: &dyn RasterSource) -> Result<Option<f64>> {
    let nodata = match policy {
        NodataPolicy::Disabled => None,
        NodataPolicy::Value(v) => Some(v),
        NodataPolicy::FromSource => a.nodata(),
        NodataPolicy::RequireFromSource => Some(
            a.nodata()
                .ok_or_else(|| PcaError::MissingNodata(a.name().to_string()))?,
        ),
    };
    if let Some(v) = nodata {
        check_nodata(v)?;
    }
    Ok(nodata)
}

impl PcaEngine {
    pub fn new(config: PcaConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = TaskScheduler::new(config.threads)?;
        Ok(PcaEngine { config, scheduler })
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    /// Runs the analysis on in-process sources and hands components to `sink`.
    pub fn run(
        &self,
        a: &dyn RasterSource,
        b: Option<&dyn RasterSource>,
        sink: &dyn ComponentSink,
    ) -> Result<PcaOutcome> {
        let start = Instant::now();
        let config = &self.config;

        let stack = BandStack::new(a, b).stage(Stage::Read, "inputs")?;
        let band_count = stack.band_count();
        config.validate_components(band_count)?;
        let nodata = resolve_nodata(config.nodata, a).stage(Stage::Read, a.name())?;

        let dims = stack.dimensions();
        info!(
            "PCA of {} bands ({}x{}), {} estimator, {} components, nodata {:?}, {} workers",
            band_count,
            dims.width,
            dims.height,
            config.estimator,
            config.n_components,
            nodata,
            self.scheduler.workers()
        );

        let mask = NodataMask::build(&stack, nodata, config.block_size, &self.scheduler)?;
        let statistics = statistics::estimate(
            &stack,
            &mask,
            config.estimator,
            config.block_size,
            &self.scheduler,
        )?;

        let basis = EigenBasis::decompose(&statistics.matrix, config.n_components)
            .stage(Stage::EigenDecomposition, "estimator matrix")?;
        info!(
            "leading eigenvalues {:?}",
            basis.eigenvalues().iter().take(config.n_components).collect::<Vec<_>>()
        );

        let components = reconstruct_all(
            &stack,
            &statistics.means,
            &basis,
            &mask,
            config.block_size,
            sink,
            &self.scheduler,
        )?;

        info!("PCA finished in {:?}", start.elapsed());
        Ok(PcaOutcome {
            nodata,
            band_count,
            statistics,
            basis,
            components,
            post_process_failures: 0,
        })
    }

    /// Runs on GeoTIFF inputs and writes `pc_<n>.tif` plus a JSON report into
    /// the configured output directory.
    ///
    /// Overviews are built with `gdaladdo` when the config asks for them.
    pub fn run_files(&self, a: impl AsRef<Path>, b: Option<&Path>) -> Result<PcaOutcome> {
        let overviews = Gdaladdo::default();
        let processor: Option<&dyn PostProcessor> = if self.config.build_overviews {
            Some(&overviews)
        } else {
            None
        };
        self.run_files_with(a, b, processor)
    }

    /// Like [`run_files`](Self::run_files) with an explicit post-processor.
    pub fn run_files_with(
        &self,
        a: impl AsRef<Path>,
        b: Option<&Path>,
        processor: Option<&dyn PostProcessor>,
    ) -> Result<PcaOutcome> {
        let a_path = a.as_ref();
        let sink = GeoTiffDirectory::new(&self.config.out_dir)
            .stage(Stage::Write, self.config.out_dir.display().to_string())?;
        let source_a =
            GeoTiffSource::open(a_path).stage(Stage::Read, a_path.display().to_string())?;
        let source_b = b
            .map(|p| GeoTiffSource::open(p).stage(Stage::Read, p.display().to_string()))
            .transpose()?;

        let mut outcome = self.run(
            &source_a,
            source_b.as_ref().map(|s| s as &dyn RasterSource),
            &sink,
        )?;

        let report_path = sink.dir().join(REPORT_FILE_NAME);
        write_report(&report_path, &outcome.report()).stage(Stage::Write, REPORT_FILE_NAME)?;

        if let Some(processor) = processor {
            let paths = outcome.paths();
            let failed = match run_post_processing(processor, &paths, self.config.overview_workers)
            {
                Ok(failed) => failed,
                Err(e) => {
                    warn!("post-processing did not start: {e}");
                    paths.len()
                }
            };
            if failed > 0 {
                warn!("post-processing failed on {failed} files; components are unaffected");
            }
            outcome.post_process_failures = failed;
        }
        Ok(outcome)
    }
}

//! # Component reconstruction
//!
//! Each principal component is rebuilt over the full pixel grid as
//! `Σ_j v_k[j] * (band_j - mean_j)`. The stack is re-read one row block at a
//! time; a component holds its `f32` output grid plus one block of raw values
//! and one block-sized `f64` accumulator, regardless of the band count. Pixels
//! excluded by the nodata mask are written as 0.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use parking_lot::Mutex;

use crate::error::{PcaError, Result, Stage, StageContext};
use crate::mask::{BandStack, NodataMask};
use crate::pca::EigenBasis;
use crate::raster::{write_band, GeoTransform, Projection};
use crate::scheduler::{TaskScheduler, Unit};

/// One finished principal component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRaster {
    /// 1-based component number.
    pub index: usize,
    pub data: Array2<f32>,
    pub geo_transform: Option<GeoTransform>,
    pub projection: Option<Projection>,
    /// 0 when masking was in effect.
    pub nodata: Option<f64>,
}

impl ComponentRaster {
    pub fn file_name(&self) -> String {
        format!("pc_{}.tif", self.index)
    }
}

/// Destination for finished components.
///
/// Components are handed over concurrently, one call per component.
pub trait ComponentSink: Send + Sync {
    /// Stores `component`, returning the file it was written to, if any.
    fn write(&self, component: &ComponentRaster) -> Result<Option<PathBuf>>;
}

/// Writes `pc_<n>.tif` files into an existing directory.
#[derive(Debug, Clone)]
pub struct GeoTiffDirectory {
    dir: PathBuf,
}

impl GeoTiffDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = fs::metadata(&dir).map_err(|e| PcaError::io(&dir, e))?;
        if !meta.is_dir() {
            return Err(PcaError::invalid_argument(
                "out_dir",
                dir.display(),
                "not a directory",
            ));
        }
        if meta.permissions().readonly() {
            return Err(PcaError::invalid_argument(
                "out_dir",
                dir.display(),
                "directory is read-only",
            ));
        }
        Ok(GeoTiffDirectory { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ComponentSink for GeoTiffDirectory {
    fn write(&self, component: &ComponentRaster) -> Result<Option<PathBuf>> {
        let path = self.dir.join(component.file_name());
        write_band(
            &path,
            component.data.view(),
            component.geo_transform,
            component.projection.as_ref(),
            component.nodata,
        )?;
        debug!("wrote {}", path.display());
        Ok(Some(path))
    }
}

/// Keeps components in memory, keyed by component number.
#[derive(Debug, Default)]
pub struct MemorySink {
    components: Mutex<BTreeMap<usize, ComponentRaster>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<ComponentRaster> {
        self.components.lock().get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }

    pub fn into_components(self) -> Vec<ComponentRaster> {
        self.components.into_inner().into_values().collect()
    }
}

impl ComponentSink for MemorySink {
    fn write(&self, component: &ComponentRaster) -> Result<Option<PathBuf>> {
        self.components
            .lock()
            .insert(component.index, component.clone());
        Ok(None)
    }
}

/// Rebuilds component `k` (0-based) over every pixel of the stack.
pub fn reconstruct_component(
    stack: &BandStack<'_>,
    means: &Array1<f64>,
    eigenvector: ArrayView1<'_, f64>,
    mask: &NodataMask,
    block_size: usize,
) -> Result<Array2<f32>> {
    let dims = stack.dimensions();
    let mut values = vec![0.0f32; dims.pixels()];
    let mut acc = Vec::new();

    for block in stack.row_blocks(block_size) {
        let pixels = block.pixels(dims.width);
        acc.clear();
        acc.resize(pixels.len(), 0.0f64);
        for band in 0..stack.band_count() {
            let weight = eigenvector[band];
            let mean = means[band];
            let raw = stack.read_block(band, block)?;
            for (a, &v) in acc.iter_mut().zip(&raw) {
                *a += weight * (v as f64 - mean);
            }
        }
        let invalid = mask.window(block, dims.width);
        for ((out, &v), &bad) in values[pixels].iter_mut().zip(&acc).zip(invalid) {
            *out = if bad { 0.0 } else { v as f32 };
        }
    }

    Array2::from_shape_vec((dims.height, dims.width), values)
        .map_err(|e| PcaError::InputMismatch(format!("cannot reshape component: {e}")))
}

/// A component that was handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenComponent {
    pub index: usize,
    pub path: Option<PathBuf>,
}

/// Reconstructs and writes every retained component, one unit per component.
pub fn reconstruct_all(
    stack: &BandStack<'_>,
    means: &Array1<f64>,
    basis: &EigenBasis,
    mask: &NodataMask,
    block_size: usize,
    sink: &dyn ComponentSink,
    scheduler: &TaskScheduler,
) -> Result<Vec<WrittenComponent>> {
    let start = Instant::now();
    let primary = stack.primary();
    let geo_transform = primary.geo_transform();
    let projection = primary.projection().cloned();
    let nodata = mask.is_active().then_some(0.0);

    let units: Vec<Unit> = (0..basis.n_components()).map(Unit::Component).collect();
    let written = scheduler.run(Stage::Reconstruction, &units, |unit| {
        let Unit::Component(k) = *unit else {
            unreachable!("reconstruction units are components")
        };
        let data = reconstruct_component(stack, means, basis.component(k), mask, block_size)?;
        let component = ComponentRaster {
            index: k + 1,
            data,
            geo_transform,
            projection: projection.clone(),
            nodata,
        };
        let path = sink.write(&component).stage(Stage::Write, unit.to_string())?;
        Ok(WrittenComponent { index: k + 1, path })
    })?;

    info!(
        "reconstructed {} components in {:?}",
        written.len(),
        start.elapsed()
    );
    Ok(written)
}

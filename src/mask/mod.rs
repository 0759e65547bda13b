//! # Band stacking and nodata masking
//!
//! Bands of source A and (optionally) source B are concatenated into a
//! [`BandStack`]. A single [`NodataMask`] marks every pixel where any band
//! holds the nodata value; statistics only ever see the pixels it leaves valid.
//!
//! Bands are never held whole by these stages. Every pass walks the grid in
//! [`RowBlock`]s, so a worker holds one block of one band (two for a band
//! pair) at a time.

use std::ops::Range;

use log::debug;
use parking_lot::Mutex;

use crate::error::{PcaError, Result, Stage};
use crate::raster::{Dimensions, RasterSource};
use crate::scheduler::{TaskScheduler, Unit};

/// Bands of one or two sources, A's bands first.
pub struct BandStack<'a> {
    sources: Vec<&'a dyn RasterSource>,
    // (source index, band within source)
    bands: Vec<(usize, usize)>,
    dimensions: Dimensions,
}

impl<'a> BandStack<'a> {
    pub fn new(a: &'a dyn RasterSource, b: Option<&'a dyn RasterSource>) -> Result<Self> {
        let dimensions = a.dimensions();
        let mut sources = vec![a];

        if let Some(b) = b {
            if b.dimensions() != dimensions {
                return Err(PcaError::InputMismatch(format!(
                    "{} is {}x{} but {} is {}x{}",
                    a.name(),
                    dimensions.width,
                    dimensions.height,
                    b.name(),
                    b.dimensions().width,
                    b.dimensions().height
                )));
            }
            sources.push(b);
        }

        let bands: Vec<(usize, usize)> = sources
            .iter()
            .enumerate()
            .flat_map(|(s, source)| (0..source.band_count()).map(move |band| (s, band)))
            .collect();

        if bands.is_empty() {
            return Err(PcaError::InputMismatch(format!("{} has no bands", a.name())));
        }
        if dimensions.pixels() == 0 {
            return Err(PcaError::InputMismatch(format!("{} has no pixels", a.name())));
        }

        Ok(BandStack {
            sources,
            bands,
            dimensions,
        })
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// The source whose metadata outputs inherit.
    pub fn primary(&self) -> &'a dyn RasterSource {
        self.sources[0]
    }

    /// Reads stacked band `band` through a fresh handle on its source.
    pub fn read_band(&self, band: usize) -> Result<Vec<f32>> {
        let &(source, index) = self.bands.get(band).ok_or_else(|| {
            PcaError::invalid_argument(
                "band",
                band + 1,
                format!("stack has {} bands", self.bands.len()),
            )
        })?;
        self.sources[source].read_band(index)
    }

    /// Reads rows `block` of stacked band `band`.
    pub fn read_block(&self, band: usize, block: RowBlock) -> Result<Vec<f32>> {
        let &(source, index) = self.bands.get(band).ok_or_else(|| {
            PcaError::invalid_argument(
                "band",
                band + 1,
                format!("stack has {} bands", self.bands.len()),
            )
        })?;
        self.sources[source].read_rows(index, block.first_row, block.rows)
    }

    /// Splits the grid into runs of whole rows of about `block_size` pixels.
    ///
    /// A block is never less than one row, so rows wider than `block_size`
    /// make one block each.
    pub fn row_blocks(&self, block_size: usize) -> Vec<RowBlock> {
        let Dimensions { width, height } = self.dimensions;
        let rows_per_block = (block_size / width.max(1)).max(1);
        (0..height)
            .step_by(rows_per_block)
            .map(|first_row| RowBlock {
                first_row,
                rows: rows_per_block.min(height - first_row),
            })
            .collect()
    }

    pub fn band_units(&self) -> Vec<Unit> {
        (0..self.band_count()).map(Unit::Band).collect()
    }
}

/// A run of whole rows; the unit of every chunked read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBlock {
    pub first_row: usize,
    pub rows: usize,
}

impl RowBlock {
    /// Flat pixel indices covered by the block in a grid `width` wide.
    pub fn pixels(&self, width: usize) -> Range<usize> {
        self.first_row * width..(self.first_row + self.rows) * width
    }
}

#[inline]
fn is_nodata(value: f32, nodata: f32) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata
    }
}

/// Pixels excluded from the analysis: `true` where any band equals nodata.
#[derive(Debug, Clone, PartialEq)]
pub struct NodataMask {
    invalid: Vec<bool>,
    nodata: Option<f64>,
    valid_count: usize,
}

impl NodataMask {
    /// A mask that excludes nothing.
    pub fn none(pixels: usize) -> Self {
        NodataMask {
            invalid: vec![false; pixels],
            nodata: None,
            valid_count: pixels,
        }
    }

    /// Reads every band once, block by block, and ORs the per-band nodata
    /// matches.
    pub fn build(
        stack: &BandStack<'_>,
        nodata: Option<f64>,
        block_size: usize,
        scheduler: &TaskScheduler,
    ) -> Result<Self> {
        let dims = stack.dimensions();
        let pixels = dims.pixels();
        let Some(nodata) = nodata else {
            return Ok(NodataMask::none(pixels));
        };
        let sentinel = nodata as f32;
        let blocks = stack.row_blocks(block_size);

        let invalid = Mutex::new(vec![false; pixels]);
        scheduler.run(Stage::Read, &stack.band_units(), |unit| {
            let Unit::Band(band) = *unit else {
                unreachable!("mask units are bands")
            };
            for &block in &blocks {
                let values = stack.read_block(band, block)?;
                let mut invalid = invalid.lock();
                for (acc, &v) in invalid[block.pixels(dims.width)].iter_mut().zip(&values) {
                    *acc |= is_nodata(v, sentinel);
                }
            }
            Ok(())
        })?;

        let invalid = invalid.into_inner();
        let valid_count = invalid.iter().filter(|&&x| !x).count();
        debug!(
            "nodata {} masks {} of {} pixels",
            nodata,
            pixels - valid_count,
            pixels
        );

        Ok(NodataMask {
            invalid,
            nodata: Some(nodata),
            valid_count,
        })
    }

    pub fn from_invalid(invalid: Vec<bool>, nodata: Option<f64>) -> Self {
        let valid_count = invalid.iter().filter(|&&x| !x).count();
        NodataMask {
            invalid,
            nodata,
            valid_count,
        }
    }

    pub fn is_invalid(&self, pixel: usize) -> bool {
        self.invalid[pixel]
    }

    pub fn invalid(&self) -> &[bool] {
        &self.invalid
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Whether a nodata value was in effect for this run.
    pub fn is_active(&self) -> bool {
        self.nodata.is_some()
    }

    pub fn len(&self) -> usize {
        self.invalid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.valid_count
    }

    /// Mask entries for the pixels of `block`.
    pub fn window(&self, block: RowBlock, width: usize) -> &[bool] {
        &self.invalid[block.pixels(width)]
    }
}

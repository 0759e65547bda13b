//! # Raster sources
//!
//! The engine reads bands through [`RasterSource`]. Each call to
//! [`RasterSource::read_band`] is an independent read, so several workers can
//! pull bands from the same source at once without sharing a cursor.

use serde::{Deserialize, Serialize};

use crate::error::{PcaError, Result};

pub mod geotiff;

pub use geotiff::{write_band, GeoTiffSource};

/// Pixel dimensions of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: usize,
    pub height: usize,
}

impl Dimensions {
    pub fn new(width: usize, height: usize) -> Self {
        Dimensions { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }
}

/// Affine georeferencing in GDAL coefficient order:
/// `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform without rotation.
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform([origin_x, pixel_width, 0.0, origin_y, 0.0, pixel_height])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }
}

/// Projection metadata carried through untouched.
///
/// These are the raw GeoTIFF key directory and its parameter tables. The
/// engine never interprets them; outputs get a verbatim copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Projection {
    pub geo_keys: Vec<u16>,
    pub double_params: Vec<f64>,
    pub ascii_params: Option<String>,
}

impl Projection {
    pub fn is_empty(&self) -> bool {
        self.geo_keys.is_empty()
    }
}

pub trait RasterSource: Send + Sync {
    /// Identifier used in logs and errors, typically the path.
    fn name(&self) -> &str;

    fn dimensions(&self) -> Dimensions;

    fn band_count(&self) -> usize;

    fn geo_transform(&self) -> Option<GeoTransform>;

    fn projection(&self) -> Option<&Projection>;

    /// Nodata sentinel of the first band.
    fn nodata(&self) -> Option<f64>;

    /// Reads band `band` (0-based) as a row-major `width * height` vector.
    fn read_band(&self, band: usize) -> Result<Vec<f32>>;

    /// Reads `rows` whole rows of band `band` starting at `first_row`.
    ///
    /// The default decodes the full band; sources that can decode part of a
    /// band should override it.
    fn read_rows(&self, band: usize, first_row: usize, rows: usize) -> Result<Vec<f32>> {
        let width = self.dimensions().width;
        check_row_window(self.name(), self.dimensions(), first_row, rows)?;
        let mut values = self.read_band(band)?;
        values.truncate((first_row + rows) * width);
        values.drain(..first_row * width);
        Ok(values)
    }
}

pub(crate) fn check_row_window(
    name: &str,
    dimensions: Dimensions,
    first_row: usize,
    rows: usize,
) -> Result<()> {
    if rows == 0 || first_row + rows > dimensions.height {
        return Err(PcaError::raster(
            name,
            format!(
                "rows {}..{} outside image of {} rows",
                first_row,
                first_row + rows,
                dimensions.height
            ),
        ));
    }
    Ok(())
}

/// Raster held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    name: String,
    dimensions: Dimensions,
    bands: Vec<Vec<f32>>,
    geo_transform: Option<GeoTransform>,
    projection: Option<Projection>,
    nodata: Option<f64>,
}

impl MemoryRaster {
    pub fn new(
        name: impl Into<String>,
        dimensions: Dimensions,
        bands: Vec<Vec<f32>>,
    ) -> Result<Self> {
        let name = name.into();
        if bands.is_empty() {
            return Err(PcaError::InputMismatch(format!("{name} has no bands")));
        }
        for (i, band) in bands.iter().enumerate() {
            if band.len() != dimensions.pixels() {
                return Err(PcaError::InputMismatch(format!(
                    "{name} band {} has {} pixels, expected {}x{}",
                    i + 1,
                    band.len(),
                    dimensions.width,
                    dimensions.height
                )));
            }
        }
        Ok(MemoryRaster {
            name,
            dimensions,
            bands,
            geo_transform: None,
            projection: None,
            nodata: None,
        })
    }

    pub fn with_geo_transform(mut self, geo_transform: GeoTransform) -> Self {
        self.geo_transform = Some(geo_transform);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }
}

impl RasterSource for MemoryRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.geo_transform
    }

    fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn read_band(&self, band: usize) -> Result<Vec<f32>> {
        self.band(band).map(<[f32]>::to_vec)
    }

    fn read_rows(&self, band: usize, first_row: usize, rows: usize) -> Result<Vec<f32>> {
        check_row_window(&self.name, self.dimensions, first_row, rows)?;
        let width = self.dimensions.width;
        let values = self.band(band)?;
        Ok(values[first_row * width..(first_row + rows) * width].to_vec())
    }
}

impl MemoryRaster {
    fn band(&self, band: usize) -> Result<&[f32]> {
        self.bands.get(band).map(Vec::as_slice).ok_or_else(|| {
            PcaError::raster(
                &self.name,
                format!("band {} out of range ({} bands)", band + 1, self.bands.len()),
            )
        })
    }
}

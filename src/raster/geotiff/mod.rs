//! GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Bands are taken from every full-resolution IFD of the file. An IFD with
//! several samples per pixel (chunky layout) contributes one band per sample.
//! Reduced-resolution IFDs (overviews) are skipped.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::ArrayView2;
use num_traits::ToPrimitive;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::{TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::error::{PcaError, Result};
use crate::raster::{check_row_window, Dimensions, GeoTransform, Projection, RasterSource};

/// Outputs above this many bytes are written as BigTIFF.
const BIGTIFF_THRESHOLD: u64 = 3_500_000_000;

// GeoKeyDirectory with only GTRasterTypeGeoKey = RasterPixelIsArea
const MINIMAL_GEO_KEYS: [u16; 8] = [1, 1, 0, 1, 1025, 0, 1, 1];

#[derive(Debug, Clone, Copy)]
struct BandLocation {
    ifd: usize,
    sample: usize,
    samples: usize,
}

/// Lazily read GeoTIFF. Only metadata is kept; every band read reopens the file.
#[derive(Debug, Clone)]
pub struct GeoTiffSource {
    path: PathBuf,
    name: String,
    dimensions: Dimensions,
    bands: Vec<BandLocation>,
    geo_transform: Option<GeoTransform>,
    projection: Option<Projection>,
    nodata: Option<f64>,
}

impl GeoTiffSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;
        let tiff_err = |e: tiff::TiffError| PcaError::raster(&path, e);

        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let dimensions = Dimensions::new(width as usize, height as usize);
        let geo_transform = read_geo_transform(&mut decoder);
        let projection = read_projection(&mut decoder);
        let nodata = read_nodata(&mut decoder);

        let mut bands = Vec::new();
        let mut ifd = 0;
        loop {
            let subfile = decoder
                .find_tag(Tag::NewSubfileType)
                .map_err(tiff_err)?
                .map(|v| v.into_u32())
                .transpose()
                .map_err(tiff_err)?
                .unwrap_or(0);
            let (w, h) = decoder.dimensions().map_err(tiff_err)?;
            let full_resolution = subfile & 1 == 0;

            if full_resolution && (w as usize, h as usize) == (dimensions.width, dimensions.height) {
                let samples = decoder
                    .find_tag(Tag::SamplesPerPixel)
                    .map_err(tiff_err)?
                    .map(|v| v.into_u32())
                    .transpose()
                    .map_err(tiff_err)?
                    .unwrap_or(1) as usize;
                let planar = decoder
                    .find_tag(Tag::PlanarConfiguration)
                    .map_err(tiff_err)?
                    .map(|v| v.into_u32())
                    .transpose()
                    .map_err(tiff_err)?
                    .unwrap_or(1);
                if samples > 1 && planar != 1 {
                    return Err(PcaError::raster(
                        &path,
                        "band-separate (planar) sample layout is not supported",
                    ));
                }
                bands.extend((0..samples).map(|sample| BandLocation {
                    ifd,
                    sample,
                    samples,
                }));
            } else if full_resolution {
                return Err(PcaError::InputMismatch(format!(
                    "{}: image {} is {}x{}, expected {}x{}",
                    path.display(),
                    ifd + 1,
                    w,
                    h,
                    dimensions.width,
                    dimensions.height
                )));
            }

            if !decoder.more_images() {
                break;
            }
            decoder.next_image().map_err(tiff_err)?;
            ifd += 1;
        }

        debug!(
            "opened {} ({}x{}, {} bands, nodata {:?})",
            path.display(),
            dimensions.width,
            dimensions.height,
            bands.len(),
            nodata
        );

        Ok(GeoTiffSource {
            name: path.display().to_string(),
            path,
            dimensions,
            bands,
            geo_transform,
            projection,
            nodata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RasterSource for GeoTiffSource {
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
        let location = self.location(band)?;
        let tiff_err = |e: tiff::TiffError| PcaError::raster(&self.path, e);

        let mut decoder = self.decoder_at(location)?;
        let image = decoder.read_image().map_err(tiff_err)?;
        let values = extract_sample(image, location.sample, location.samples)
            .ok_or_else(|| PcaError::raster(&self.path, "unsupported sample format"))?;

        if values.len() != self.dimensions.pixels() {
            return Err(PcaError::raster(
                &self.path,
                format!(
                    "band {} decoded to {} pixels, expected {}",
                    band + 1,
                    values.len(),
                    self.dimensions.pixels()
                ),
            ));
        }
        Ok(values)
    }

    /// Decodes only the strips covering the window. Tiled images fall back to
    /// a full band decode.
    fn read_rows(&self, band: usize, first_row: usize, rows: usize) -> Result<Vec<f32>> {
        check_row_window(&self.name, self.dimensions, first_row, rows)?;
        let location = self.location(band)?;
        let tiff_err = |e: tiff::TiffError| PcaError::raster(&self.path, e);
        let Dimensions { width, height } = self.dimensions;

        let mut decoder = self.decoder_at(location)?;
        if decoder.find_tag(Tag::TileWidth).map_err(tiff_err)?.is_some() {
            let mut values = self.read_band(band)?;
            values.truncate((first_row + rows) * width);
            values.drain(..first_row * width);
            return Ok(values);
        }

        let rows_per_strip = decoder
            .find_tag(Tag::RowsPerStrip)
            .map_err(tiff_err)?
            .map(|v| v.into_u32())
            .transpose()
            .map_err(tiff_err)?
            .map_or(height, |r| r as usize)
            .clamp(1, height);

        let last_row = first_row + rows;
        let mut values = Vec::with_capacity(rows * width);
        for strip in first_row / rows_per_strip..=(last_row - 1) / rows_per_strip {
            let strip_start = strip * rows_per_strip;
            let strip_rows = rows_per_strip.min(height - strip_start);
            let chunk = decoder.read_chunk(strip as u32).map_err(tiff_err)?;
            let decoded = extract_sample(chunk, location.sample, location.samples)
                .ok_or_else(|| PcaError::raster(&self.path, "unsupported sample format"))?;
            if decoded.len() < strip_rows * width {
                return Err(PcaError::raster(
                    &self.path,
                    format!(
                        "strip {} of band {} decoded to {} pixels, expected {}",
                        strip,
                        band + 1,
                        decoded.len(),
                        strip_rows * width
                    ),
                ));
            }
            let lo = first_row.max(strip_start) - strip_start;
            let hi = last_row.min(strip_start + strip_rows) - strip_start;
            values.extend_from_slice(&decoded[lo * width..hi * width]);
        }
        Ok(values)
    }
}

impl GeoTiffSource {
    fn location(&self, band: usize) -> Result<BandLocation> {
        self.bands.get(band).copied().ok_or_else(|| {
            PcaError::raster(
                &self.path,
                format!("band {} out of range ({} bands)", band + 1, self.bands.len()),
            )
        })
    }

    /// Fresh decoder positioned on the band's IFD.
    fn decoder_at(&self, location: BandLocation) -> Result<Decoder<BufReader<File>>> {
        let mut decoder = open_decoder(&self.path)?;
        for _ in 0..location.ifd {
            decoder
                .next_image()
                .map_err(|e| PcaError::raster(&self.path, e))?;
        }
        Ok(decoder)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| PcaError::io(path, e))?;
    let decoder = Decoder::new(BufReader::new(file)).map_err(|e| PcaError::raster(path, e))?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

fn sample_to_f32<T: ToPrimitive + Copy>(buf: &[T], sample: usize, samples: usize) -> Vec<f32> {
    buf.iter()
        .skip(sample)
        .step_by(samples)
        .map(|v| v.to_f32().unwrap_or(f32::NAN))
        .collect()
}

fn extract_sample(image: DecodingResult, sample: usize, samples: usize) -> Option<Vec<f32>> {
    let values = match image {
        DecodingResult::U8(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::U16(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::U32(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::U64(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::I8(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::I16(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::I32(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::I64(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::F32(buf) if samples == 1 => buf,
        DecodingResult::F32(buf) => sample_to_f32(&buf, sample, samples),
        DecodingResult::F64(buf) => sample_to_f32(&buf, sample, samples),
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(values)
}

fn read_geo_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(Tag::ModelTransformationTag) {
        if m.len() >= 8 {
            return Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }

    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }
    // tiepoint: [I, J, K, X, Y, Z]
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]))
}

fn read_projection<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<Projection> {
    let geo_keys = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .ok()
        .flatten()?
        .into_u32_vec()
        .ok()?
        .into_iter()
        .map(u16::try_from)
        .collect::<std::result::Result<Vec<u16>, _>>()
        .ok()?;
    let double_params = decoder
        .get_tag_f64_vec(Tag::GeoDoubleParamsTag)
        .unwrap_or_default();
    let ascii_params = decoder
        .find_tag(Tag::GeoAsciiParamsTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())
        .map(|s| s.trim_end_matches('\0').to_string());

    Some(Projection {
        geo_keys,
        double_params,
        ascii_params,
    })
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder
        .find_tag(Tag::GdalNodata)
        .ok()
        .flatten()?
        .into_string()
        .ok()?;
    text.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .parse::<f64>()
        .ok()
}

/// Writes one 32-bit float band as a GeoTIFF.
///
/// Georeferencing and projection tags are copied as given. `nodata` is stored
/// in the GDAL_NODATA tag.
pub fn write_band(
    path: impl AsRef<Path>,
    data: ArrayView2<f32>,
    geo_transform: Option<GeoTransform>,
    projection: Option<&Projection>,
    nodata: Option<f64>,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| PcaError::io(path, e))?;
    let writer = BufWriter::new(file);
    let bytes = (data.len() as u64) * 4;

    if bytes > BIGTIFF_THRESHOLD {
        let encoder = TiffEncoder::new_big(writer).map_err(|e| PcaError::raster(path, e))?;
        encode_band(encoder, path, data, geo_transform, projection, nodata)
    } else {
        let encoder = TiffEncoder::new(writer).map_err(|e| PcaError::raster(path, e))?;
        encode_band(encoder, path, data, geo_transform, projection, nodata)
    }
}

fn encode_band<W: Write + Seek, K: TiffKind>(
    mut encoder: TiffEncoder<W, K>,
    path: &Path,
    data: ArrayView2<f32>,
    geo_transform: Option<GeoTransform>,
    projection: Option<&Projection>,
    nodata: Option<f64>,
) -> Result<()> {
    let tiff_err = |e: tiff::TiffError| PcaError::raster(path, e);
    let (rows, cols) = data.dim();
    let pixels: Vec<f32> = data.iter().copied().collect();

    let mut image = encoder
        .new_image::<Gray32Float>(cols as u32, rows as u32)
        .map_err(tiff_err)?;

    if let Some(gt) = geo_transform {
        let [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height] = gt.0;
        if gt.is_north_up() {
            let scale = [pixel_width, -pixel_height, 0.0];
            let tiepoint = [0.0, 0.0, 0.0, origin_x, origin_y, 0.0];
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &scale[..])
                .map_err(tiff_err)?;
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
                .map_err(tiff_err)?;
        } else {
            let transform = [
                pixel_width, row_rotation, 0.0, origin_x,
                col_rotation, pixel_height, 0.0, origin_y,
                0.0, 0.0, 0.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ];
            image
                .encoder()
                .write_tag(Tag::ModelTransformationTag, &transform[..])
                .map_err(tiff_err)?;
        }
    }

    match projection.filter(|p| !p.is_empty()) {
        Some(projection) => {
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, projection.geo_keys.as_slice())
                .map_err(tiff_err)?;
            if !projection.double_params.is_empty() {
                image
                    .encoder()
                    .write_tag(Tag::GeoDoubleParamsTag, projection.double_params.as_slice())
                    .map_err(tiff_err)?;
            }
            if let Some(ascii) = &projection.ascii_params {
                image
                    .encoder()
                    .write_tag(Tag::GeoAsciiParamsTag, ascii.as_str())
                    .map_err(tiff_err)?;
            }
        }
        None if geo_transform.is_some() => {
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &MINIMAL_GEO_KEYS[..])
                .map_err(tiff_err)?;
        }
        None => {}
    }

    if let Some(nodata) = nodata {
        let text = nodata.to_string();
        image
            .encoder()
            .write_tag(Tag::GdalNodata, text.as_str())
            .map_err(tiff_err)?;
    }

    image.write_data(&pixels).map_err(tiff_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use tiff::encoder::colortype::RGB32Float;

    fn projection() -> Projection {
        Projection {
            geo_keys: vec![
                1, 1, 0, 3, //
                1024, 0, 1, 1, //
                1025, 0, 1, 1, //
                3072, 0, 1, 32618,
            ],
            double_params: vec![],
            ascii_params: Some("WGS 84 / UTM zone 18N|".to_string()),
        }
    }

    fn write_pages(path: &Path, pages: &[Vec<f32>], width: u32, height: u32, nodata: &str) {
        let file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        for page in pages {
            let mut image = encoder.new_image::<Gray32Float>(width, height).unwrap();
            image
                .encoder()
                .write_tag(Tag::GdalNodata, nodata)
                .unwrap();
            image.write_data(page).unwrap();
        }
    }

    #[test]
    fn test_write_band_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pc_1.tif");
        let data = array![[1.5f32, -2.0, 0.0], [4.25, 5.0, 6.0]];
        let gt = GeoTransform::new(440_720.0, 3_751_320.0, 60.0, -60.0);

        write_band(&path, data.view(), Some(gt), Some(&projection()), Some(0.0)).unwrap();

        let source = GeoTiffSource::open(&path).unwrap();
        assert_eq!(source.dimensions(), Dimensions::new(3, 2));
        assert_eq!(source.band_count(), 1);
        assert_eq!(source.nodata(), Some(0.0));
        assert_eq!(source.projection(), Some(&projection()));
        let read_gt = source.geo_transform().unwrap();
        for (a, b) in read_gt.0.iter().zip(gt.0.iter()) {
            assert_relative_eq!(a, b);
        }
        assert_eq!(
            source.read_band(0).unwrap(),
            vec![1.5, -2.0, 0.0, 4.25, 5.0, 6.0]
        );
    }

    #[test]
    fn test_rotated_transform_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.tif");
        let gt = GeoTransform([100.0, 10.0, 0.5, 200.0, 0.25, -10.0]);
        let data = array![[1.0f32, 2.0], [3.0, 4.0]];

        write_band(&path, data.view(), Some(gt), None, None).unwrap();

        let source = GeoTiffSource::open(&path).unwrap();
        assert_eq!(source.geo_transform(), Some(gt));
        assert_eq!(source.nodata(), None);
    }

    #[test]
    fn test_multi_page_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.tif");
        let pages = vec![vec![1.0, 2.0, 3.0, 4.0], vec![10.0, 20.0, 30.0, 40.0]];
        write_pages(&path, &pages, 2, 2, "-9999");

        let source = GeoTiffSource::open(&path).unwrap();
        assert_eq!(source.band_count(), 2);
        assert_eq!(source.nodata(), Some(-9999.0));
        assert_eq!(source.read_band(1).unwrap(), pages[1]);
        assert_eq!(source.read_band(0).unwrap(), pages[0]);
        assert!(source.read_band(2).is_err());
    }

    #[test]
    fn test_chunky_samples_are_deinterleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        // two pixels, three samples each
        encoder
            .write_image::<RGB32Float>(2, 1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        drop(encoder);

        let source = GeoTiffSource::open(&path).unwrap();
        assert_eq!(source.band_count(), 3);
        assert_eq!(source.read_band(0).unwrap(), vec![1.0, 4.0]);
        assert_eq!(source.read_band(1).unwrap(), vec![2.0, 5.0]);
        assert_eq!(source.read_band(2).unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_row_window_spans_strips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tall.tif");
        // over 1 MB, so more than one strip at the encoder's default strip size
        let data = Array2::from_shape_fn((300, 1024), |(r, c)| (r * 1024 + c) as f32);
        write_band(&path, data.view(), None, None, None).unwrap();

        let source = GeoTiffSource::open(&path).unwrap();
        let whole = source.read_band(0).unwrap();
        for (first_row, rows) in [(0, 1), (5, 40), (17, 200), (299, 1), (0, 300)] {
            let window = source.read_rows(0, first_row, rows).unwrap();
            assert_eq!(window.as_slice(), &whole[first_row * 1024..(first_row + rows) * 1024]);
        }
        assert!(source.read_rows(0, 290, 20).is_err());
    }

    #[test]
    fn test_row_window_deinterleaves_chunky_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb_rows.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        let pixels: Vec<f32> = (0..2 * 3 * 3).map(|v| v as f32).collect();
        encoder.write_image::<RGB32Float>(2, 3, &pixels).unwrap();
        drop(encoder);

        let source = GeoTiffSource::open(&path).unwrap();
        // row 1 holds pixels 2 and 3
        assert_eq!(source.read_rows(1, 1, 1).unwrap(), vec![7.0, 10.0]);
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let err = GeoTiffSource::open("/nonexistent/stack.tif").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}

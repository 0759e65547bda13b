pub mod config;
pub mod engine;
pub mod error;
pub mod mask;
pub mod pca;
pub mod postprocess;
pub mod raster;
pub mod reconstruction;
pub mod scheduler;
pub mod statistics;

pub use config::{Estimator, NodataPolicy, PcaConfig};
pub use engine::{PcaEngine, PcaOutcome, PcaReport};
pub use error::{ErrorKind, PcaError, Result, Stage};
pub use pca::EigenBasis;
pub use postprocess::{Gdaladdo, PostProcessor};
pub use raster::{Dimensions, GeoTiffSource, GeoTransform, MemoryRaster, Projection, RasterSource};
pub use reconstruction::{ComponentRaster, ComponentSink, GeoTiffDirectory, MemorySink};

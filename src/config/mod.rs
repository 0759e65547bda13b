//! # Run configuration
//!
//! A single [`PcaConfig`] describes one PCA run. It is validated once by
//! [`PcaConfig::validate`] and then passed by reference to every stage.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PcaError, Result};

/// Default number of pixels reduced per block (a 1000 × 1000 chunk).
pub const DEFAULT_BLOCK_SIZE: usize = 1_000_000;

/// Default worker count for the overview pool.
pub const DEFAULT_OVERVIEW_WORKERS: usize = 2;

/// Band-by-band matrix the eigen-decomposition runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Estimator {
    /// Pearson correlation. Diagonal is exactly 1.
    #[default]
    Correlation,
    /// Population covariance: co-moments divided by `n`, the number of valid pixels.
    Covariance,
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::Correlation => f.write_str("correlation"),
            Estimator::Covariance => f.write_str("covariance"),
        }
    }
}

impl FromStr for Estimator {
    type Err = PcaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correlation" => Ok(Estimator::Correlation),
            "covariance" => Ok(Estimator::Covariance),
            _ => Err(PcaError::invalid_argument(
                "estimator",
                s,
                "expected `correlation` or `covariance`",
            )),
        }
    }
}

/// Where the nodata sentinel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodataPolicy {
    /// Never mask.
    Disabled,
    /// Use this value.
    Value(#[serde(with = "nodata_serde")] f64),
    /// Read band 1 of source A; no masking when it carries none.
    #[default]
    FromSource,
    /// Read band 1 of source A; fail when it carries none.
    RequireFromSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaConfig {
    pub estimator: Estimator,
    pub n_components: usize,
    pub nodata: NodataPolicy,
    pub block_size: usize,
    pub threads: usize,
    pub out_dir: PathBuf,
    pub build_overviews: bool,
    pub overview_workers: usize,
}

impl PcaConfig {
    pub fn new(n_components: usize) -> Self {
        PcaConfig {
            estimator: Estimator::default(),
            n_components,
            nodata: NodataPolicy::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            threads: default_threads(),
            out_dir: PathBuf::from("."),
            build_overviews: false,
            overview_workers: DEFAULT_OVERVIEW_WORKERS,
        }
    }

    pub fn estimator(mut self, estimator: Estimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn nodata(mut self, nodata: NodataPolicy) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    pub fn build_overviews(mut self, build_overviews: bool) -> Self {
        self.build_overviews = build_overviews;
        self
    }

    pub fn overview_workers(mut self, workers: usize) -> Self {
        self.overview_workers = workers;
        self
    }

    /// Checks everything that does not depend on the inputs.
    ///
    /// The upper bound of `n_components` needs the band count and is checked
    /// once the sources are open.
    pub fn validate(&self) -> Result<()> {
        if self.n_components == 0 {
            return Err(PcaError::invalid_argument(
                "n_components",
                self.n_components,
                "at least one component is required",
            ));
        }
        if self.block_size == 0 {
            return Err(PcaError::invalid_argument(
                "block_size",
                self.block_size,
                "must be positive",
            ));
        }
        if self.threads == 0 {
            return Err(PcaError::invalid_argument(
                "threads",
                self.threads,
                "must be positive",
            ));
        }
        if self.overview_workers == 0 {
            return Err(PcaError::invalid_argument(
                "overview_workers",
                self.overview_workers,
                "must be positive",
            ));
        }
        if let NodataPolicy::Value(v) = self.nodata {
            check_nodata(v)?;
        }
        Ok(())
    }

    /// Checks `n_components` against the number of stacked bands.
    pub fn validate_components(&self, band_count: usize) -> Result<()> {
        if self.n_components == 0 || self.n_components > band_count {
            return Err(PcaError::invalid_argument(
                "n_components",
                self.n_components,
                format!("must be between 1 and the band count ({band_count})"),
            ));
        }
        Ok(())
    }
}

/// Rejects nodata values that do not survive the cast to the `f32` pixel type.
///
/// NaN is allowed and matches NaN pixels.
pub fn check_nodata(v: f64) -> Result<()> {
    if v.is_infinite() || v.abs() > f32::MAX as f64 {
        return Err(PcaError::invalid_argument(
            "nodata",
            v,
            "must be NaN or within the f32 range",
        ));
    }
    Ok(())
}

/// Serde adapter for nodata values; NaN is written as the string `"nan"`
/// since JSON has no NaN literal.
pub(crate) mod nodata_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn to_repr(v: f64) -> Repr {
        if v.is_nan() {
            Repr::Text("nan".to_string())
        } else {
            Repr::Number(v)
        }
    }

    fn from_repr<E: Error>(repr: Repr) -> Result<f64, E> {
        match repr {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("invalid nodata value `{s}`"))),
        }
    }

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        to_repr(*v).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        from_repr(Repr::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
            v.map(to_repr).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(from_repr)
                .transpose()
        }
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

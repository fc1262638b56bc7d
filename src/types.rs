use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Reflectance value type used throughout the pipeline
pub type Reflectance = f32;

/// 2D reflectance raster (rows x cols)
pub type Raster = Array2<Reflectance>;

/// Continuous per-pixel cloud optical thickness estimate; `NaN` marks invalid pixels
pub type PredictionMap = Array2<f32>;

/// Boolean per-pixel mask
pub type BinaryMask = Array2<bool>;

/// Raster shape as (rows, cols)
pub type Shape = (usize, usize);

fn band_name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^[A-Z0-9]+$").expect("static band name pattern"))
}

/// Spectral band identifier (e.g. `B02`, `B8A`, `SCL`)
///
/// Names are upper-cased on construction so `b8a` and `B8A` refer to the
/// same band. Cloning is a reference count bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BandName(Arc<str>);

impl BandName {
    pub fn parse(name: &str) -> CloudResult<Self> {
        let upper = name.trim().to_uppercase();
        if !band_name_pattern().is_match(&upper) {
            return Err(CloudError::InvalidConfiguration(format!(
                "Invalid band name: '{}'",
                name
            )));
        }
        Ok(Self(Arc::from(upper)))
    }

    /// Built-in upper-case band identifier, not re-validated
    pub(crate) fn known(name: &'static str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BandName {
    type Error = CloudError;

    fn try_from(value: String) -> CloudResult<Self> {
        Self::parse(&value)
    }
}

impl From<BandName> for String {
    fn from(value: BandName) -> Self {
        value.0.to_string()
    }
}

/// Parse a list of band names, failing on the first invalid entry
pub fn band_names(names: &[&str]) -> CloudResult<Vec<BandName>> {
    names.iter().map(|name| BandName::parse(name)).collect()
}

/// Single spectral band at its native resolution
#[derive(Debug, Clone)]
pub struct Band {
    pub name: BandName,
    pub data: Raster,
}

impl Band {
    pub fn new(name: BandName, data: Raster) -> Self {
        Self { name, data }
    }

    pub fn shape(&self) -> Shape {
        self.data.dim()
    }
}

/// Bands covering one geographic extent, possibly at different resolutions
#[derive(Debug, Clone, Default)]
pub struct BandSet {
    bands: Vec<Band>,
    index: HashMap<BandName, usize>,
}

impl BandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a band; names must be unique within the set
    pub fn insert(&mut self, band: Band) -> CloudResult<()> {
        if self.index.contains_key(&band.name) {
            return Err(CloudError::InvalidConfiguration(format!(
                "Duplicate band '{}' in band set",
                band.name
            )));
        }
        self.index.insert(band.name.clone(), self.bands.len());
        self.bands.push(band);
        Ok(())
    }

    pub fn from_bands(bands: Vec<Band>) -> CloudResult<Self> {
        let mut set = Self::new();
        for band in bands {
            set.insert(band)?;
        }
        Ok(set)
    }

    pub fn get(&self, name: &BandName) -> Option<&Band> {
        self.index.get(name).map(|&i| &self.bands[i])
    }

    pub fn contains(&self, name: &BandName) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Band> {
        self.bands.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &BandName> {
        self.bands.iter().map(|b| &b.name)
    }
}

/// Aligned multi-band stack (channel x rows x cols)
///
/// Channel order matches the band list the product was assembled from.
#[derive(Debug, Clone)]
pub struct Product {
    bands: Vec<BandName>,
    data: Array3<Reflectance>,
}

impl Product {
    pub fn new(bands: Vec<BandName>, data: Array3<Reflectance>) -> CloudResult<Self> {
        if bands.len() != data.dim().0 {
            return Err(CloudError::ShapeMismatch(format!(
                "{} band names for {} channels",
                bands.len(),
                data.dim().0
            )));
        }
        Ok(Self { bands, data })
    }

    pub fn bands(&self) -> &[BandName] {
        &self.bands
    }

    pub fn data(&self) -> &Array3<Reflectance> {
        &self.data
    }

    pub fn into_data(self) -> Array3<Reflectance> {
        self.data
    }

    pub fn channels(&self) -> usize {
        self.bands.len()
    }

    /// Spatial shape shared by every channel
    pub fn shape(&self) -> Shape {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn channel_index(&self, name: &BandName) -> Option<usize> {
        self.bands.iter().position(|b| b == name)
    }

    /// Reorder or subset channels by name
    pub fn select(&self, names: &[BandName]) -> CloudResult<Product> {
        let indices = names
            .iter()
            .map(|name| {
                self.channel_index(name)
                    .ok_or_else(|| CloudError::MissingBand(name.to_string()))
            })
            .collect::<CloudResult<Vec<_>>>()?;
        let data = self.data.select(ndarray::Axis(0), &indices);
        Product::new(names.to_vec(), data)
    }

    /// Drop the first `count` channels
    pub fn drop_leading(&self, count: usize) -> Product {
        let count = count.min(self.channels());
        Product {
            bands: self.bands[count..].to_vec(),
            data: self.data.slice(ndarray::s![count.., .., ..]).to_owned(),
        }
    }
}

/// Direction used to reconcile bands of differing resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingMode {
    /// Interpolate every band up to the largest requested shape
    Upsize,
    /// Pool every band down to the smallest requested shape
    Downsize,
}

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResampleKernel {
    Nearest,
    Box,
    Bilinear,
    Lanczos3,
}

impl Default for ResampleKernel {
    fn default() -> Self {
        ResampleKernel::Lanczos3
    }
}

/// How CPU work inside a request is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Sequential,
    /// Bands and ensemble members are processed on the rayon pool
    Parallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Parallel
    }
}

impl ExecutionMode {
    pub(crate) fn is_parallel(self) -> bool {
        cfg!(feature = "parallel") && self == ExecutionMode::Parallel
    }
}

/// Sentinel-2 processing level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Top-of-atmosphere reflectance
    L1C,
    /// Bottom-of-atmosphere reflectance
    L2A,
}

impl Collection {
    /// Collection identifier used by the imagery service
    pub fn collection_id(&self) -> &'static str {
        match self {
            Collection::L1C => "s2_msi_l1c",
            Collection::L2A => "s2_msi_l2a",
        }
    }

    pub fn parse(value: &str) -> CloudResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "l1c" | "s2_msi_l1c" => Ok(Collection::L1C),
            "l2a" | "s2_msi_l2a" => Ok(Collection::L2A),
            _ => Err(CloudError::InvalidConfiguration(format!(
                "Unknown collection: '{}'",
                value
            ))),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::L1C => write!(f, "l1c"),
            Collection::L2A => write!(f, "l2a"),
        }
    }
}

/// Geographic box in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub west: f64,
    pub east: f64,
    pub south: f64,
    pub north: f64,
}

impl GeoBox {
    pub fn new(west: f64, east: f64, south: f64, north: f64) -> CloudResult<Self> {
        let area = Self { west, east, south, north };
        area.validate()?;
        Ok(area)
    }

    pub fn validate(&self) -> CloudResult<()> {
        let coords = [self.west, self.east, self.south, self.north];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(CloudError::InvalidConfiguration(
                "Geometry box coordinates must be finite".to_string(),
            ));
        }
        if self.west < -180.0 || self.east > 180.0 || self.south < -90.0 || self.north > 90.0 {
            return Err(CloudError::InvalidConfiguration(format!(
                "Geometry box out of range: {:?}",
                self
            )));
        }
        if self.west >= self.east || self.south >= self.north {
            return Err(CloudError::InvalidConfiguration(format!(
                "Degenerate geometry box: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Scalar cloud-cover outcome for one request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudDecision {
    /// Percentage of pixels flagged as thick or thin cloud
    pub cloud_fraction: f64,
    pub is_cloudy: bool,
}

/// Error types for cloud detection
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Missing band: {0}")]
    MissingBand(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No data found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Band acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cloud detection operations
pub type CloudResult<T> = Result<T, CloudError>;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Floating-point sample type used for every corrected grid
pub type Real = f64;

/// 2D raw digital-number grid (rows x columns)
pub type RawGrid = Array2<u16>;

/// 2D floating-point grid (rows x columns)
pub type RealImage = Array2<Real>;

/// The only sensor bit depth the radiometric pipeline accepts
pub const SUPPORTED_BIT_DEPTH: u32 = 16;

/// One band of one capture, straight from the sensor
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub data: RawGrid,
    pub bits_per_pixel: u32,
}

impl RawImage {
    pub fn new(data: RawGrid, bits_per_pixel: u32) -> Self {
        Self { data, bits_per_pixel }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Fails unless the declared depth is the supported 16 bits
    pub fn validate_bit_depth(&self) -> CalResult<()> {
        check_bit_depth(self.bits_per_pixel)
    }

    /// Full-scale DN value, `2^bits_per_pixel`
    pub fn max_dn(&self) -> Real {
        (2.0 as Real).powi(self.bits_per_pixel as i32)
    }
}

pub(crate) fn check_bit_depth(bits_per_pixel: u32) -> CalResult<()> {
    if bits_per_pixel != SUPPORTED_BIT_DEPTH {
        return Err(CalError::UnsupportedBitDepth(bits_per_pixel));
    }
    Ok(())
}

/// Per-band radiometric calibration constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiometricCoefficients {
    /// Sensitivity: DN to radiance scale
    pub a1: Real,
    /// Row-gradient term scaled by exposure
    pub a2: Real,
    /// Row-gradient term independent of exposure
    pub a3: Real,
}

impl RadiometricCoefficients {
    pub fn from_slice(values: &[Real]) -> CalResult<Self> {
        match values {
            [a1, a2, a3] => Ok(Self { a1: *a1, a2: *a2, a3: *a3 }),
            _ => Err(CalError::Metadata(format!(
                "Expected 3 radiometric coefficients, got {}",
                values.len()
            ))),
        }
    }
}

/// Radial vignette model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VignetteParams {
    /// Center (x = column, y = row) in pixels
    pub center: (Real, Real),
    /// Coefficients of r^1, r^2, ... in the order the camera stores them
    pub polynomial: Vec<Real>,
}

/// Brown-Conrady lens distortion in the camera's native `[k1, k2, k3, p1, p2]` order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionParameters {
    pub k1: Real,
    pub k2: Real,
    pub k3: Real,
    pub p1: Real,
    pub p2: Real,
}

impl DistortionParameters {
    pub fn none() -> Self {
        Self { k1: 0.0, k2: 0.0, k3: 0.0, p1: 0.0, p2: 0.0 }
    }

    /// Build from the native ordering `[k1, k2, k3, p1, p2]`
    pub fn from_native(values: &[Real]) -> CalResult<Self> {
        match values {
            [k1, k2, k3, p1, p2] => Ok(Self { k1: *k1, k2: *k2, k3: *k3, p1: *p1, p2: *p2 }),
            _ => Err(CalError::Metadata(format!(
                "Expected 5 distortion parameters, got {}",
                values.len()
            ))),
        }
    }

    /// Canonical ordering `[k1, k2, p1, p2, k3]`
    pub fn canonical(&self) -> [Real; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_identity(&self) -> bool {
        self.canonical().iter().all(|&c| c == 0.0)
    }
}

/// Pinhole camera description in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraGeometry {
    pub focal_length_mm: Real,
    /// Focal-plane resolution (x, y) in pixels per millimetre
    pub focal_plane_resolution_px_per_mm: (Real, Real),
    /// Principal point (x, y) in millimetres
    pub principal_point_mm: (Real, Real),
    pub distortion: DistortionParameters,
}

impl CameraGeometry {
    /// Principal point rescaled to pixels
    pub fn principal_point_px(&self) -> (Real, Real) {
        let (rx, ry) = self.focal_plane_resolution_px_per_mm;
        (self.principal_point_mm.0 * rx, self.principal_point_mm.1 * ry)
    }

    /// Focal length (fx, fy) in pixels
    pub fn focal_length_px(&self) -> (Real, Real) {
        let (rx, ry) = self.focal_plane_resolution_px_per_mm;
        (self.focal_length_mm * rx, self.focal_length_mm * ry)
    }
}

/// Downwelling light sensor attitude, earth-fixed, radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DlsPose {
    pub yaw: Real,
    pub pitch: Real,
    pub roll: Real,
}

/// WGS-84 position, signed decimal degrees and metres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: Real,
    pub longitude: Real,
    /// Absent when the image carries no altitude tag
    pub altitude: Option<Real>,
}

/// Identifies one band of one capture
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageIdentity {
    pub band_index: u32,
    pub capture_id: String,
}

impl ImageIdentity {
    pub fn new(band_index: u32, capture_id: impl Into<String>) -> Self {
        Self {
            band_index,
            capture_id: capture_id.into(),
        }
    }

    /// Ordering of bands within a capture; only the band index takes part
    pub fn compare_band_order(&self, other: &ImageIdentity) -> Ordering {
        self.band_index.cmp(&other.band_index)
    }

    /// Same band of the same capture
    pub fn same_image(&self, other: &ImageIdentity) -> bool {
        self.band_index == other.band_index && self.capture_id == other.capture_id
    }
}

impl std::fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.capture_id, self.band_index)
    }
}

/// Everything the pipeline needs to know about one image, read-only to the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    pub identity: ImageIdentity,
    pub band_name: String,
    pub flight_id: Option<String>,

    // Sensor response
    pub black_level: Real,
    pub gain: Real,
    /// Exposure time in seconds
    pub exposure_time: Real,
    pub bits_per_pixel: u32,
    pub radiometric: RadiometricCoefficients,
    pub vignette: VignetteParams,

    // Geometry
    pub geometry: CameraGeometry,
    /// (width, height) in pixels
    pub image_size: (usize, usize),

    // Acquisition context
    pub irradiance: Option<Real>,
    pub dls_pose: Option<DlsPose>,
    pub position: Option<GeoPosition>,
    pub utc_time: Option<DateTime<Utc>>,
    pub center_wavelength: Option<Real>,
    pub bandwidth: Option<Real>,
}

/// Error types for radiometric processing
#[derive(Debug, thiserror::Error)]
pub enum CalError {
    #[error("Camera firmware does not support radiometric calibration: {0}")]
    UnsupportedCalibration(String),

    #[error("Unsupported pixel bit depth: {0} bits (only 16 is supported)")]
    UnsupportedBitDepth(u32),

    #[error("Missing calibration input: {0}")]
    MissingCalibrationInput(String),

    #[error("Degenerate calibration: {0}")]
    DegenerateCalibration(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

/// Result type for calibration operations
pub type CalResult<T> = Result<T, CalError>;

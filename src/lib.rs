//! radcal: radiometric calibration for multispectral camera imagery
//!
//! Converts raw 16-bit digital numbers into radiance and reflectance,
//! correcting for vignetting, row-timing gradients, black level, gain and
//! exposure, with optional lens undistortion. Reflectance comes either from
//! a measured irradiance (downwelling light sensor or reference panel) or
//! from an empirical per-band panel factor.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    CalError, CalResult, CalibrationParameters, CameraGeometry, DistortionParameters, DlsPose,
    GeoPosition, ImageIdentity, RadiometricCoefficients, RawGrid, RawImage, Real, RealImage,
    VignetteParams,
};

pub use io::{MetadataProvider, PixelSource, TagMetadata, TiffPixelSource};

pub use crate::core::{
    BandImage, Capture, FlightCalibrationConfig, FlightCalibrator, LensUndistorter,
    PanelCalibrator, RadiometricConverter, ReflectanceConverter, ReflectanceStrategy,
    VignetteModel,
};

//! Core radiometric processing modules

pub mod vignette;
pub mod radiometric;
pub mod panel;
pub mod reflectance;
pub mod undistort;
pub mod dls;
pub mod image;
pub mod capture;
pub mod flight;

// Re-export main types
pub use vignette::{VignetteField, VignetteModel};
pub use radiometric::{RadiometricConverter, RadiometricProducts};
pub use panel::{
    panel_irradiance, raw_region_stats, region_stats, CalibrationFactor, PanelCalibrator,
    PanelParams, PanelRegion, PixelRect, RegionStats, SessionFactor,
};
pub use reflectance::{ReflectanceConverter, ReflectanceStrategy};
pub use undistort::{remap_bilinear, LensUndistorter, RemapField, UndistortParams};
pub use dls::{DlsGeometry, SkyCondition, SunPosition};
pub use image::{ArtifactKind, ArtifactSlot, BandImage, CorrectedImage, Provenance};
pub use capture::Capture;
pub use flight::{
    FlightCalibrationConfig, FlightCalibrator, FlightReport, ImageOutcome, PanelImage,
    ProcessOptions, ReflectanceSink, TiffDirectorySink,
};

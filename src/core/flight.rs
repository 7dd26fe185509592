//! Flight-level batch calibration.
//!
//! Panel images taken before and after a flight give one radiance to
//! reflectance factor per band. Every flight image is then converted with
//! its band's factor and handed to an output sink, one image at a time.

use crate::core::image::{ArtifactKind, BandImage};
use crate::core::panel::{region_stats, CalibrationFactor, PanelCalibrator, PanelRegion, PixelRect, RegionStats};
use crate::core::reflectance::ReflectanceStrategy;
use crate::io::write_float_tiff;
use crate::types::{CalError, CalResult, ImageIdentity, Real, RealImage};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Per-image processing switches
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Remove lens distortion from the reflectance grid before output
    pub undistort: bool,
}

/// Panel reflectance per band and panel location per session and band
#[derive(Debug, Clone, Deserialize)]
pub struct FlightCalibrationConfig {
    /// Known panel reflectance keyed by band name
    pub panel_reflectance: BTreeMap<String, Real>,
    /// Session name (e.g. "preflight") to band name to panel rectangle
    pub sessions: BTreeMap<String, BTreeMap<String, PixelRect>>,
    #[serde(default)]
    pub processing: ProcessOptions,
}

impl FlightCalibrationConfig {
    pub fn from_json_str(json: &str) -> CalResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CalError::Config(format!("invalid flight config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let path = path.as_ref();
        log::info!("Loading flight calibration config: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> CalResult<()> {
        for (band, &reflectance) in &self.panel_reflectance {
            if !reflectance.is_finite() || reflectance <= 0.0 {
                return Err(CalError::Config(format!(
                    "panel reflectance for {} must be positive, got {}",
                    band, reflectance
                )));
            }
        }
        for (session, bands) in &self.sessions {
            for (band, rect) in bands {
                match rect.checked_area() {
                    Some(0) => {
                        return Err(CalError::Config(format!(
                            "empty panel region for {} in session {}",
                            band, session
                        )))
                    }
                    None => {
                        return Err(CalError::Config(format!(
                            "panel region {:?} for {} in session {} is too large",
                            rect, band, session
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    pub fn session_names(&self) -> Vec<&str> {
        self.sessions.keys().map(|s| s.as_str()).collect()
    }

    /// Panel rectangle and reflectance for one band in one session
    pub fn panel_region(&self, session: &str, band: &str) -> CalResult<PanelRegion> {
        let rect = self
            .sessions
            .get(session)
            .ok_or_else(|| CalError::Config(format!("unknown panel session {}", session)))?
            .get(band)
            .ok_or_else(|| CalError::Config(format!("no panel region for {} in session {}", band, session)))?;
        let reflectance = self
            .panel_reflectance
            .get(band)
            .ok_or_else(|| CalError::Config(format!("no panel reflectance for band {}", band)))?;
        Ok(PanelRegion {
            rect: *rect,
            reflectance: *reflectance,
        })
    }
}

/// A panel image and the session it belongs to
#[derive(Debug)]
pub struct PanelImage {
    pub session: String,
    pub image: BandImage,
}

impl PanelImage {
    pub fn new(session: impl Into<String>, image: BandImage) -> Self {
        Self {
            session: session.into(),
            image,
        }
    }
}

/// Destination for finished reflectance grids; shared by all workers
pub trait ReflectanceSink: Sync {
    fn write(&self, identity: &ImageIdentity, source_name: &str, reflectance: &RealImage) -> CalResult<()>;
}

/// Writes float TIFFs into a directory, named after the source file
#[derive(Debug, Clone)]
pub struct TiffDirectorySink {
    dir: PathBuf,
}

impl TiffDirectorySink {
    pub fn new<P: AsRef<Path>>(dir: P) -> CalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn output_path(&self, identity: &ImageIdentity, source_name: &str) -> PathBuf {
        let file_name = Path::new(source_name)
            .file_name()
            .map(|name| name.to_os_string())
            .filter(|name| Path::new(name).extension().is_some())
            .unwrap_or_else(|| format!("{}_{}.tif", identity.capture_id, identity.band_index).into());
        self.dir.join(file_name)
    }
}

impl ReflectanceSink for TiffDirectorySink {
    fn write(&self, identity: &ImageIdentity, source_name: &str, reflectance: &RealImage) -> CalResult<()> {
        let path = self.output_path(identity, source_name);
        log::debug!("Writing reflectance for {} to {}", identity, path.display());
        write_float_tiff(&path, reflectance)
    }
}

/// Result of processing one flight image
#[derive(Debug)]
pub struct ImageOutcome {
    pub identity: ImageIdentity,
    pub band_name: String,
    pub source_name: String,
    /// Whole-image reflectance statistics, or why the image failed
    pub result: CalResult<RegionStats>,
}

impl ImageOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Factors plus every per-image outcome of a flight run
#[derive(Debug)]
pub struct FlightReport {
    pub factors: BTreeMap<String, CalibrationFactor>,
    pub outcomes: Vec<ImageOutcome>,
}

impl FlightReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> Vec<&ImageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok()).collect()
    }
}

/// Panel-factor calibration for a whole flight
#[derive(Debug, Clone)]
pub struct FlightCalibrator {
    config: FlightCalibrationConfig,
    panel: PanelCalibrator,
}

impl FlightCalibrator {
    pub fn new(config: FlightCalibrationConfig) -> Self {
        Self {
            config,
            panel: PanelCalibrator::new(),
        }
    }

    pub fn with_panel_calibrator(mut self, panel: PanelCalibrator) -> Self {
        self.panel = panel;
        self
    }

    pub fn config(&self) -> &FlightCalibrationConfig {
        &self.config
    }

    /// One factor per band, averaged over all panel sessions of that band
    pub fn derive_band_factors(
        &self,
        panel_images: Vec<PanelImage>,
    ) -> CalResult<BTreeMap<String, CalibrationFactor>> {
        log::info!("Deriving calibration factors from {} panel images", panel_images.len());

        let mut by_band: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for PanelImage { session, mut image } in panel_images {
            let band = image.band_name().to_string();
            let region = self.config.panel_region(&session, &band)?;

            let raw = image.raw()?;
            self.panel.raw_stats(&raw.data, &region.rect)?;
            let radiance = image.radiance(false)?;
            let session_factor = self.panel.session_factor(&session, &radiance.data, &region)?;
            image.clear_image_data();

            log::debug!("{} {}: factor {:.6}", session, band, session_factor.factor);
            by_band.entry(band).or_default().push(session_factor);
        }

        let factors = by_band
            .into_iter()
            .map(|(band, sessions)| {
                CalibrationFactor::from_sessions(band.clone(), sessions).map(|factor| (band, factor))
            })
            .collect::<CalResult<BTreeMap<_, _>>>()?;

        for factor in factors.values() {
            log::info!("{}: radiance to reflectance factor {:.4}", factor.band_name, factor.value);
        }
        Ok(factors)
    }

    fn process_one(
        &self,
        mut image: BandImage,
        factors: &BTreeMap<String, CalibrationFactor>,
        options: &ProcessOptions,
        sink: &dyn ReflectanceSink,
    ) -> ImageOutcome {
        let identity = image.identity().clone();
        let band_name = image.band_name().to_string();
        let source_name = image.source_name();

        let result = (|| -> CalResult<RegionStats> {
            let factor = factors.get(&band_name).ok_or_else(|| {
                CalError::MissingCalibrationInput(format!("no calibration factor for band {}", band_name))
            })?;
            let reflectance = image.reflectance(ReflectanceStrategy::panel_factor(factor.value), false)?;
            let output = if options.undistort {
                image.undistorted(ArtifactKind::Reflectance)?
            } else {
                reflectance
            };

            let (rows, cols) = output.data.dim();
            let stats = region_stats(&output.data, &PixelRect::new(0, 0, cols, rows))?;
            sink.write(&identity, &source_name, &output.data)?;
            Ok(stats)
        })();

        image.clear_image_data();
        if let Err(e) = &result {
            log::warn!("Failed to process {} ({}): {}", source_name, identity, e);
        }
        ImageOutcome {
            identity,
            band_name,
            source_name,
            result,
        }
    }

    /// Convert every image to reflectance with its band factor.
    ///
    /// Images are independent: a failure is recorded in that image's outcome
    /// and the rest of the batch continues. Outcomes keep the input order.
    pub fn process_images(
        &self,
        images: Vec<BandImage>,
        factors: &BTreeMap<String, CalibrationFactor>,
        options: &ProcessOptions,
        sink: &dyn ReflectanceSink,
    ) -> Vec<ImageOutcome> {
        log::info!("Processing {} flight images to reflectance", images.len());

        #[cfg(feature = "parallel")]
        let outcomes: Vec<ImageOutcome> = images
            .into_par_iter()
            .map(|image| self.process_one(image, factors, options, sink))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<ImageOutcome> = images
            .into_iter()
            .map(|image| self.process_one(image, factors, options, sink))
            .collect();

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        log::info!("Batch completed: {} succeeded, {} failed", ok, outcomes.len() - ok);
        outcomes
    }

    /// Derive factors from the panel images, then process the flight
    pub fn run(
        &self,
        panel_images: Vec<PanelImage>,
        images: Vec<BandImage>,
        sink: &dyn ReflectanceSink,
    ) -> CalResult<FlightReport> {
        let factors = self.derive_band_factors(panel_images)?;
        let outcomes = self.process_images(images, &factors, &self.config.processing, sink);
        Ok(FlightReport { factors, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::radiometric::tests::flat_params;
    use crate::io::InMemorySource;
    use crate::types::RawGrid;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    const CONFIG: &str = r#"{
        "panel_reflectance": { "Blue": 0.61, "Green": 0.61 },
        "sessions": {
            "preflight": {
                "Blue": { "ulx": 2, "uly": 2, "lrx": 6, "lry": 5 },
                "Green": { "ulx": 1, "uly": 1, "lrx": 4, "lry": 4 }
            },
            "postflight": {
                "Blue": { "ulx": 4, "uly": 3, "lrx": 8, "lry": 6 }
            }
        }
    }"#;

    #[derive(Default)]
    struct MemorySink {
        written: Mutex<Vec<(ImageIdentity, RealImage)>>,
    }

    impl ReflectanceSink for MemorySink {
        fn write(&self, identity: &ImageIdentity, _source_name: &str, reflectance: &RealImage) -> CalResult<()> {
            let mut written = self
                .written
                .lock()
                .map_err(|_| CalError::Processing("sink poisoned".to_string()))?;
            written.push((identity.clone(), reflectance.clone()));
            Ok(())
        }
    }

    fn image(index: u32, capture: &str, band: &str, dn: u16) -> BandImage {
        let mut params = flat_params(10, 8);
        params.identity = ImageIdentity::new(index, capture);
        params.band_name = band.to_string();
        let source = InMemorySource::with_label(RawGrid::from_elem((8, 10), dn), format!("{}_{}.tif", capture, index));
        BandImage::new(params, Box::new(source)).unwrap()
    }

    #[test]
    fn test_config_parsing() {
        let config = FlightCalibrationConfig::from_json_str(CONFIG).unwrap();
        assert_eq!(config.session_names(), vec!["postflight", "preflight"]);
        let region = config.panel_region("preflight", "Blue").unwrap();
        assert_eq!(region.rect, PixelRect::new(2, 2, 6, 5));
        assert_eq!(region.reflectance, 0.61);
        assert!(!config.processing.undistort);

        assert!(matches!(config.panel_region("midflight", "Blue"), Err(CalError::Config(_))));
        assert!(matches!(config.panel_region("postflight", "Green"), Err(CalError::Config(_))));
        assert!(matches!(
            FlightCalibrationConfig::from_json_str("{\"sessions\": {}}"),
            Err(CalError::Config(_))
        ));
    }

    #[test]
    fn test_oversized_region_rejected() {
        let json = format!(
            r#"{{
                "panel_reflectance": {{ "Blue": 0.5 }},
                "sessions": {{
                    "preflight": {{ "Blue": {{ "ulx": 0, "uly": 0, "lrx": {max}, "lry": {max} }} }}
                }}
            }}"#,
            max = usize::MAX
        );
        assert!(matches!(
            FlightCalibrationConfig::from_json_str(&json),
            Err(CalError::Config(_))
        ));

        let empty = CONFIG.replace(r#""lrx": 6, "lry": 5"#, r#""lrx": 2, "lry": 5"#);
        assert!(matches!(
            FlightCalibrationConfig::from_json_str(&empty),
            Err(CalError::Config(_))
        ));
    }

    #[test]
    fn test_factors_average_sessions() {
        let calibrator = FlightCalibrator::new(FlightCalibrationConfig::from_json_str(CONFIG).unwrap());
        let panels = vec![
            PanelImage::new("preflight", image(0, "pre", "Blue", 1000)),
            PanelImage::new("postflight", image(0, "post", "Blue", 2000)),
            PanelImage::new("preflight", image(1, "pre", "Green", 1000)),
        ];
        let factors = calibrator.derive_band_factors(panels).unwrap();

        let radiance_1000 = 1000.0 / 0.001 / 65536.0;
        let pre = 0.61 / radiance_1000;
        let post = 0.61 / (2.0 * radiance_1000);
        assert_relative_eq!(factors["Blue"].value, (pre + post) / 2.0, max_relative = 1e-12);
        assert_eq!(factors["Blue"].sessions.len(), 2);
        assert_relative_eq!(factors["Green"].value, pre, max_relative = 1e-12);
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut factors = BTreeMap::new();
        factors.insert("Blue".to_string(), CalibrationFactor::fixed("Blue", 0.5));

        let mut broken = flat_params(10, 8);
        broken.identity = ImageIdentity::new(1, "cap-1");
        broken.band_name = "Blue".to_string();
        let broken = BandImage::new(broken, Box::new(InMemorySource::new(RawGrid::zeros((3, 3))))).unwrap();

        let images = vec![
            image(0, "cap-0", "Blue", 1000),
            broken,
            image(2, "cap-2", "Green", 1000),
            image(0, "cap-3", "Blue", 500),
        ];

        let sink = MemorySink::default();
        let calibrator = FlightCalibrator::new(FlightCalibrationConfig::from_json_str(CONFIG).unwrap());
        let outcomes = calibrator.process_images(images, &factors, &ProcessOptions::default(), &sink);

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1].result, Err(CalError::InvalidFormat(_))));
        assert!(matches!(outcomes[2].result, Err(CalError::MissingCalibrationInput(_))));
        assert!(outcomes[3].is_ok());
        assert_eq!(outcomes[0].source_name, "cap-0_0.tif");

        let stats = outcomes[0].result.as_ref().unwrap();
        assert_relative_eq!(stats.mean, 0.5 * 1000.0 / 0.001 / 65536.0, max_relative = 1e-12);
        assert_eq!(sink.written.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_sink_file_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = TiffDirectorySink::new(dir.path().join("reflectance")).unwrap();
        let identity = ImageIdentity::new(2, "abc");
        assert_eq!(
            sink.output_path(&identity, "/flight/IMG_0001_3.tif"),
            dir.path().join("reflectance").join("IMG_0001_3.tif")
        );
        assert_eq!(
            sink.output_path(&identity, "in-memory"),
            dir.path().join("reflectance").join("abc_2.tif")
        );
    }
}

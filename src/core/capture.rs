use crate::core::dls::{DlsGeometry, SkyCondition};
use crate::core::image::{ArtifactKind, BandImage, CorrectedImage};
use crate::core::panel::{panel_irradiance, PanelCalibrator, PanelRegion, RegionStats};
use crate::core::reflectance::ReflectanceStrategy;
use crate::types::{CalError, CalResult, DlsPose, GeoPosition, Real};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

/// All band images taken at the same instant, ordered by band index
#[derive(Debug)]
pub struct Capture {
    capture_id: String,
    images: Vec<BandImage>,
    /// One region per band, in band order
    panel_regions: Option<Vec<PanelRegion>>,
}

impl Capture {
    pub fn new(mut images: Vec<BandImage>) -> CalResult<Self> {
        let capture_id = match images.first() {
            Some(image) => image.capture_id().to_string(),
            None => {
                return Err(CalError::InvalidFormat(
                    "a capture needs at least one image".to_string(),
                ))
            }
        };
        if let Some(stray) = images.iter().find(|img| img.capture_id() != capture_id) {
            return Err(CalError::InvalidFormat(format!(
                "images must share one capture id: {} vs {}",
                capture_id,
                stray.capture_id()
            )));
        }
        images.sort_by(|a, b| a.identity().compare_band_order(b.identity()));
        log::debug!("Capture {} with {} bands", capture_id, images.len());

        Ok(Self {
            capture_id,
            images,
            panel_regions: None,
        })
    }

    pub fn from_image(image: BandImage) -> Self {
        Self {
            capture_id: image.capture_id().to_string(),
            images: vec![image],
            panel_regions: None,
        }
    }

    pub fn append_image(&mut self, image: BandImage) -> CalResult<()> {
        if image.capture_id() != self.capture_id {
            return Err(CalError::InvalidFormat(format!(
                "cannot add image of capture {} to capture {}",
                image.capture_id(),
                self.capture_id
            )));
        }
        self.images.push(image);
        self.images.sort_by(|a, b| a.identity().compare_band_order(b.identity()));
        Ok(())
    }

    pub fn append_images(&mut self, images: Vec<BandImage>) -> CalResult<()> {
        for image in images {
            self.append_image(image)?;
        }
        Ok(())
    }

    /// Attach panel regions, one per band in band order
    pub fn set_panel_regions(&mut self, regions: Vec<PanelRegion>) -> CalResult<()> {
        if regions.len() != self.images.len() {
            return Err(CalError::InvalidFormat(format!(
                "{} panel regions for {} bands",
                regions.len(),
                self.images.len()
            )));
        }
        self.panel_regions = Some(regions);
        Ok(())
    }

    pub fn capture_id(&self) -> &str {
        &self.capture_id
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[BandImage] {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut [BandImage] {
        &mut self.images
    }

    pub fn band_names(&self) -> Vec<String> {
        self.images.iter().map(|img| img.band_name().to_string()).collect()
    }

    pub fn center_wavelengths(&self) -> Vec<Option<Real>> {
        self.images.iter().map(|img| img.parameters().center_wavelength).collect()
    }

    fn first(&self) -> &BandImage {
        // construction guarantees at least one image
        &self.images[0]
    }

    pub fn location(&self) -> Option<GeoPosition> {
        self.first().parameters().position
    }

    pub fn utc_time(&self) -> Option<DateTime<Utc>> {
        self.first().parameters().utc_time
    }

    pub fn dls_pose(&self) -> Option<DlsPose> {
        self.first().parameters().dls_pose
    }

    pub fn dls_present(&self) -> bool {
        self.first().parameters().irradiance.is_some()
    }

    /// Sun and sensor geometry of this capture
    pub fn dls_geometry(&self) -> CalResult<DlsGeometry> {
        let missing = |what: &str| {
            CalError::MissingCalibrationInput(format!("capture {} has no {}", self.capture_id, what))
        };
        let time = self.utc_time().ok_or_else(|| missing("capture time"))?;
        let position = self.location().ok_or_else(|| missing("GPS position"))?;
        let pose = self.dls_pose().ok_or_else(|| missing("DLS pose"))?;
        Ok(DlsGeometry::compute(&time, &position, &pose))
    }

    /// Uncorrected DLS readings per band
    pub fn dls_irradiance_raw(&self) -> Vec<Option<Real>> {
        self.images.iter().map(|img| img.parameters().irradiance).collect()
    }

    /// Ground irradiance per band from the DLS readings
    pub fn dls_irradiance(&self, sky: SkyCondition) -> CalResult<Vec<Real>> {
        let geometry = self.dls_geometry()?;
        self.images
            .iter()
            .map(|img| {
                let raw = img.parameters().irradiance.ok_or_else(|| {
                    CalError::MissingCalibrationInput(format!("{}: no DLS irradiance", img.identity()))
                })?;
                geometry.ground_irradiance(raw, sky)
            })
            .collect()
    }

    fn regions(&self) -> CalResult<&[PanelRegion]> {
        self.panel_regions.as_deref().ok_or_else(|| {
            CalError::MissingCalibrationInput(format!("capture {} has no panel regions", self.capture_id))
        })
    }

    /// Raw DN statistics over each band's panel
    pub fn panel_raw(&mut self) -> CalResult<Vec<RegionStats>> {
        let regions = self.regions()?.to_vec();
        let calibrator = PanelCalibrator::new();
        self.images
            .iter_mut()
            .zip(regions.iter())
            .map(|(img, region)| calibrator.raw_stats(&img.raw()?.data, &region.rect))
            .collect()
    }

    /// Mean panel radiance per band
    pub fn panel_radiance(&mut self) -> CalResult<Vec<Real>> {
        let regions = self.regions()?.to_vec();
        let calibrator = PanelCalibrator::new();
        self.images
            .iter_mut()
            .zip(regions.iter())
            .map(|(img, region)| calibrator.mean_radiance(&img.radiance(false)?.data, &region.rect))
            .collect()
    }

    /// Irradiance implied by each band's panel and its known reflectance
    pub fn panel_irradiance(&mut self) -> CalResult<Vec<Real>> {
        let regions = self.regions()?.to_vec();
        let means = self.panel_radiance()?;
        means
            .iter()
            .zip(regions.iter())
            .map(|(&mean, region)| panel_irradiance(mean, region.reflectance))
            .collect()
    }

    /// Reflectance of every band, one strategy per band in band order
    pub fn reflectance(
        &mut self,
        strategies: &[ReflectanceStrategy],
        force: bool,
    ) -> CalResult<Vec<Arc<CorrectedImage>>> {
        if strategies.len() != self.images.len() {
            return Err(CalError::InvalidFormat(format!(
                "{} reflectance strategies for {} bands",
                strategies.len(),
                self.images.len()
            )));
        }
        self.images
            .iter_mut()
            .zip(strategies.iter())
            .map(|(img, strategy)| img.reflectance(*strategy, force))
            .collect()
    }

    /// Undistorted copy of `source` for every band
    pub fn undistorted(&mut self, source: ArtifactKind) -> CalResult<Vec<Arc<CorrectedImage>>> {
        self.images.iter_mut().map(|img| img.undistorted(source)).collect()
    }

    pub fn clear_image_data(&mut self) {
        for image in self.images.iter_mut() {
            image.clear_image_data();
        }
    }

    /// Order by capture time; `None` when either time is unknown
    pub fn compare_capture_time(&self, other: &Capture) -> Option<Ordering> {
        match (self.utc_time(), other.utc_time()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    pub fn same_capture(&self, other: &Capture) -> bool {
        self.capture_id == other.capture_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::panel::PixelRect;
    use crate::core::radiometric::tests::flat_params;
    use crate::io::InMemorySource;
    use crate::types::{DlsPose, ImageIdentity, RawGrid};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn band(index: u32, capture: &str, name: &str, dn: u16) -> BandImage {
        let mut params = flat_params(10, 8);
        params.identity = ImageIdentity::new(index, capture);
        params.band_name = name.to_string();
        params.irradiance = Some(1.0848);
        params.dls_pose = Some(DlsPose {
            yaw: -3.070222992336269,
            pitch: -0.18812839845718335,
            roll: -0.013387829297356699,
        });
        params.position = Some(GeoPosition {
            latitude: 36.576096,
            longitude: -119.4352689,
            altitude: Some(101.861),
        });
        params.utc_time =
            Some(Utc.with_ymd_and_hms(2017, 10, 19, 20, 40, 39).unwrap() + chrono::Duration::microseconds(200174));
        let source = InMemorySource::new(RawGrid::from_elem((8, 10), dn));
        BandImage::new(params, Box::new(source)).unwrap()
    }

    fn five_band_capture() -> Capture {
        let names = ["Blue", "Green", "Red", "NIR", "Red edge"];
        let images = (0..5u32)
            .rev()
            .map(|i| band(i, "cap-a", names[i as usize], 1000 + 100 * i as u16))
            .collect();
        Capture::new(images).unwrap()
    }

    #[test]
    fn test_sorted_by_band_index() {
        let capture = five_band_capture();
        assert_eq!(capture.len(), 5);
        assert_eq!(capture.band_names(), vec!["Blue", "Green", "Red", "NIR", "Red edge"]);
    }

    #[test]
    fn test_mismatched_capture_ids() {
        let images = vec![band(0, "cap-a", "Blue", 1000), band(1, "cap-b", "Green", 1000)];
        assert!(matches!(Capture::new(images), Err(CalError::InvalidFormat(_))));

        let mut capture = Capture::from_image(band(0, "cap-a", "Blue", 1000));
        assert!(capture.append_image(band(1, "cap-b", "Green", 1000)).is_err());
        capture.append_images(vec![band(2, "cap-a", "Red", 1000), band(1, "cap-a", "Green", 1000)]).unwrap();
        assert_eq!(capture.band_names(), vec!["Blue", "Green", "Red"]);
    }

    #[test]
    fn test_dls_irradiance() {
        let capture = five_band_capture();
        assert!(capture.dls_present());
        let clear = capture.dls_irradiance(SkyCondition::Clear).unwrap();
        assert_eq!(clear.len(), 5);
        assert_relative_eq!(clear[0], 1.124438, max_relative = 1e-3);
        assert_eq!(capture.dls_irradiance_raw()[2], Some(1.0848));
        let overcast = capture.dls_irradiance(SkyCondition::Overcast).unwrap();
        assert!(overcast[0] != clear[0]);
    }

    #[test]
    fn test_panel_values() {
        let mut capture = five_band_capture();
        assert!(matches!(capture.panel_radiance(), Err(CalError::MissingCalibrationInput(_))));

        let region = PanelRegion {
            rect: PixelRect::new(2, 2, 6, 5),
            reflectance: 0.5,
        };
        assert!(capture.set_panel_regions(vec![region; 3]).is_err());
        capture.set_panel_regions(vec![region; 5]).unwrap();

        let raw = capture.panel_raw().unwrap();
        assert_eq!(raw[1].mean, 1100.0);
        assert_eq!(raw[1].count, 12);

        let radiance = capture.panel_radiance().unwrap();
        assert_relative_eq!(radiance[0], 1000.0 / 0.001 / 65536.0, max_relative = 1e-12);

        let irradiance = capture.panel_irradiance().unwrap();
        assert_relative_eq!(irradiance[0], radiance[0] * std::f64::consts::PI / 0.5, max_relative = 1e-12);

        // panel-derived irradiance recovers the panel reflectance
        let strategies: Vec<_> = irradiance
            .iter()
            .map(|&irradiance| ReflectanceStrategy::IrradianceBased { irradiance })
            .collect();
        let reflectance = capture.reflectance(&strategies, false).unwrap();
        for image in reflectance.iter() {
            assert_relative_eq!(image.data[[3, 3]], 0.5, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_capture_ordering_and_identity() {
        let a = five_band_capture();
        let mut later = band(0, "cap-b", "Blue", 1000);
        let mut params = later.parameters().clone();
        params.utc_time = params.utc_time.map(|t| t + chrono::Duration::seconds(2));
        later = BandImage::new(params, Box::new(InMemorySource::new(RawGrid::zeros((8, 10))))).unwrap();
        let b = Capture::from_image(later);

        assert_eq!(a.compare_capture_time(&b), Some(Ordering::Less));
        assert!(!a.same_capture(&b));
        assert!(a.same_capture(&five_band_capture()));
    }

    #[test]
    fn test_clear_keeps_bands() {
        let mut capture = five_band_capture();
        capture.undistorted(ArtifactKind::Radiance).unwrap();
        capture.clear_image_data();
        assert!(capture.images().iter().all(|img| !img.is_computed(ArtifactKind::Raw)));
        assert_eq!(capture.len(), 5);
    }
}

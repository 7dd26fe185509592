use crate::core::dls::{DlsGeometry, SkyCondition};
use crate::core::radiometric::RadiometricConverter;
use crate::core::reflectance::{ReflectanceConverter, ReflectanceStrategy};
use crate::core::undistort::{LensUndistorter, UndistortParams};
use crate::core::vignette::{VignetteField, VignetteModel};
use crate::io::{MetadataProvider, PixelSource};
use crate::types::{
    check_bit_depth, CalError, CalResult, CalibrationParameters, ImageIdentity, RawImage, Real,
    RealImage,
};
use std::fmt;
use std::sync::Arc;

/// Kinds of per-image grids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Raw,
    Intensity,
    Radiance,
    Reflectance,
    Undistorted,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Intensity => "intensity",
            ArtifactKind::Radiance => "radiance",
            ArtifactKind::Reflectance => "reflectance",
            ArtifactKind::Undistorted => "undistorted",
        };
        f.write_str(name)
    }
}

/// What produced an artifact
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// Decoded from the pixel source
    Sensor,
    /// Radiometric conversion of the raw grid
    Radiometric,
    Reflectance(ReflectanceStrategy),
    /// Resampled from another artifact, identified by its version tag
    Undistorted { source: ArtifactKind, source_version: u64 },
}

/// A floating-point grid with its provenance and version tag
#[derive(Debug, Clone)]
pub struct CorrectedImage {
    pub kind: ArtifactKind,
    pub provenance: Provenance,
    /// Unique per image for the lifetime of the image, survives resets
    pub version: u64,
    pub data: RealImage,
}

/// Cache state of one artifact
#[derive(Debug, Clone)]
pub enum ArtifactSlot<T> {
    Unset,
    Computed {
        value: Arc<T>,
        provenance: Provenance,
        version: u64,
    },
}

impl<T> ArtifactSlot<T> {
    pub fn is_computed(&self) -> bool {
        matches!(self, ArtifactSlot::Computed { .. })
    }

    fn get(&self) -> Option<&Arc<T>> {
        match self {
            ArtifactSlot::Unset => None,
            ArtifactSlot::Computed { value, .. } => Some(value),
        }
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            ArtifactSlot::Unset => None,
            ArtifactSlot::Computed { provenance, .. } => Some(provenance),
        }
    }

    fn version(&self) -> Option<u64> {
        match self {
            ArtifactSlot::Unset => None,
            ArtifactSlot::Computed { version, .. } => Some(*version),
        }
    }
}

impl<T> Default for ArtifactSlot<T> {
    fn default() -> Self {
        ArtifactSlot::Unset
    }
}

/// One band of one capture, with lazily computed and cached products.
///
/// Calibration parameters are fixed at construction. Pixels are decoded on
/// first use and every derived grid is cached until [`BandImage::clear_image_data`].
pub struct BandImage {
    params: CalibrationParameters,
    source: Box<dyn PixelSource>,
    undistort_params: UndistortParams,

    raw: ArtifactSlot<RawImage>,
    vignette: Option<Arc<VignetteField>>,
    intensity: ArtifactSlot<CorrectedImage>,
    radiance: ArtifactSlot<CorrectedImage>,
    reflectance: ArtifactSlot<CorrectedImage>,
    undistorted: ArtifactSlot<CorrectedImage>,

    next_version: u64,
}

impl fmt::Debug for BandImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandImage")
            .field("identity", &self.params.identity)
            .field("band_name", &self.params.band_name)
            .field("source", &self.source.describe())
            .field("raw_loaded", &self.raw.is_computed())
            .finish()
    }
}

impl BandImage {
    pub fn new(params: CalibrationParameters, source: Box<dyn PixelSource>) -> CalResult<Self> {
        check_bit_depth(params.bits_per_pixel)?;
        Ok(Self {
            params,
            source,
            undistort_params: UndistortParams::default(),
            raw: ArtifactSlot::Unset,
            vignette: None,
            intensity: ArtifactSlot::Unset,
            radiance: ArtifactSlot::Unset,
            reflectance: ArtifactSlot::Unset,
            undistorted: ArtifactSlot::Unset,
            next_version: 1,
        })
    }

    pub fn from_provider(provider: &dyn MetadataProvider, source: Box<dyn PixelSource>) -> CalResult<Self> {
        Self::new(CalibrationParameters::from_provider(provider)?, source)
    }

    pub fn with_undistort_params(mut self, params: UndistortParams) -> Self {
        self.undistort_params = params;
        self
    }

    pub fn parameters(&self) -> &CalibrationParameters {
        &self.params
    }

    pub fn identity(&self) -> &ImageIdentity {
        &self.params.identity
    }

    pub fn band_name(&self) -> &str {
        &self.params.band_name
    }

    pub fn band_index(&self) -> u32 {
        self.params.identity.band_index
    }

    pub fn capture_id(&self) -> &str {
        &self.params.identity.capture_id
    }

    /// Where the pixels come from, e.g. the file path
    pub fn source_name(&self) -> String {
        self.source.describe()
    }

    /// (width, height) in pixels
    pub fn size(&self) -> (usize, usize) {
        self.params.image_size
    }

    pub fn is_computed(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Raw => self.raw.is_computed(),
            ArtifactKind::Intensity => self.intensity.is_computed(),
            ArtifactKind::Radiance => self.radiance.is_computed(),
            ArtifactKind::Reflectance => self.reflectance.is_computed(),
            ArtifactKind::Undistorted => self.undistorted.is_computed(),
        }
    }

    fn bump_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    fn store(&mut self, kind: ArtifactKind, provenance: Provenance, data: RealImage) -> Arc<CorrectedImage> {
        let version = self.bump_version();
        let image = Arc::new(CorrectedImage {
            kind,
            provenance: provenance.clone(),
            version,
            data,
        });
        let slot = ArtifactSlot::Computed {
            value: Arc::clone(&image),
            provenance,
            version,
        };
        match kind {
            ArtifactKind::Intensity => self.intensity = slot,
            ArtifactKind::Radiance => self.radiance = slot,
            ArtifactKind::Reflectance => self.reflectance = slot,
            ArtifactKind::Undistorted => self.undistorted = slot,
            ArtifactKind::Raw => {}
        }
        image
    }

    /// Raw DN grid, decoded on first access
    pub fn raw(&mut self) -> CalResult<Arc<RawImage>> {
        if let Some(raw) = self.raw.get() {
            return Ok(Arc::clone(raw));
        }

        log::debug!("Loading raw pixels for {} from {}", self.params.identity, self.source.describe());
        let data = self.source.decode()?;
        let (width, height) = self.params.image_size;
        if data.dim() != (height, width) {
            return Err(CalError::InvalidFormat(format!(
                "{}: decoded {}x{} pixels, metadata says {}x{}",
                self.source.describe(),
                data.ncols(),
                data.nrows(),
                width,
                height
            )));
        }

        let raw = Arc::new(RawImage::new(data, self.params.bits_per_pixel));
        let version = self.bump_version();
        self.raw = ArtifactSlot::Computed {
            value: Arc::clone(&raw),
            provenance: Provenance::Sensor,
            version,
        };
        Ok(raw)
    }

    pub fn vignette(&mut self) -> CalResult<Arc<VignetteField>> {
        if let Some(field) = &self.vignette {
            return Ok(Arc::clone(field));
        }
        let (width, height) = self.params.image_size;
        let field = Arc::new(VignetteModel::new(&self.params.vignette).compute(width, height)?);
        self.vignette = Some(Arc::clone(&field));
        Ok(field)
    }

    fn converter(&self) -> CalResult<RadiometricConverter> {
        RadiometricConverter::new(&self.params)
    }

    pub fn intensity(&mut self, force: bool) -> CalResult<Arc<CorrectedImage>> {
        if !force {
            if let Some(cached) = self.intensity.get() {
                return Ok(Arc::clone(cached));
            }
        }
        let converter = self.converter()?;
        let raw = self.raw()?;
        let vignette = self.vignette()?;
        let data = converter.intensity(&raw, &vignette)?;
        Ok(self.store(ArtifactKind::Intensity, Provenance::Radiometric, data))
    }

    pub fn radiance(&mut self, force: bool) -> CalResult<Arc<CorrectedImage>> {
        if !force {
            if let Some(cached) = self.radiance.get() {
                return Ok(Arc::clone(cached));
            }
        }
        let converter = self.converter()?;
        let raw = self.raw()?;
        let vignette = self.vignette()?;
        let data = converter.radiance(&raw, &vignette)?;
        Ok(self.store(ArtifactKind::Radiance, Provenance::Radiometric, data))
    }

    /// Reflectance under `strategy`.
    ///
    /// A cached irradiance-based result is reused only for the same irradiance;
    /// a cached factor-based result is reused for any factor unless forced.
    /// A result of the other strategy is never reused.
    pub fn reflectance(
        &mut self,
        strategy: ReflectanceStrategy,
        force: bool,
    ) -> CalResult<Arc<CorrectedImage>> {
        if !force {
            if let Some(cached) = self.reflectance.get() {
                if let Provenance::Reflectance(previous) = &cached.provenance {
                    match (previous, &strategy) {
                        (
                            ReflectanceStrategy::IrradianceBased { irradiance: a },
                            ReflectanceStrategy::IrradianceBased { irradiance: b },
                        ) if a == b => return Ok(Arc::clone(cached)),
                        (
                            ReflectanceStrategy::PanelFactorBased { factor: a },
                            ReflectanceStrategy::PanelFactorBased { factor: b },
                        ) => {
                            if a != b {
                                log::warn!(
                                    "{}: returning reflectance cached with factor {} for factor {}; force to recompute",
                                    self.params.identity,
                                    a,
                                    b
                                );
                            }
                            return Ok(Arc::clone(cached));
                        }
                        _ => {}
                    }
                }
            }
        }

        let radiance = self.radiance(false)?;
        let data = ReflectanceConverter::convert(&radiance.data, &strategy)?;
        Ok(self.store(ArtifactKind::Reflectance, Provenance::Reflectance(strategy), data))
    }

    /// Horizontal ground irradiance from the DLS reading stored with this image
    pub fn dls_ground_irradiance(&self, sky: SkyCondition) -> CalResult<Real> {
        let missing = |what: &str| {
            CalError::MissingCalibrationInput(format!("{}: no {} recorded", self.params.identity, what))
        };
        let raw = self.params.irradiance.ok_or_else(|| missing("DLS irradiance"))?;
        let pose = self.params.dls_pose.ok_or_else(|| missing("DLS pose"))?;
        let position = self.params.position.ok_or_else(|| missing("GPS position"))?;
        let time = self.params.utc_time.ok_or_else(|| missing("capture time"))?;

        DlsGeometry::compute(&time, &position, &pose).ground_irradiance(raw, sky)
    }

    /// Irradiance-based reflectance using the corrected DLS irradiance
    pub fn reflectance_from_dls(&mut self, sky: SkyCondition, force: bool) -> CalResult<Arc<CorrectedImage>> {
        let irradiance = self.dls_ground_irradiance(sky)?;
        self.reflectance(ReflectanceStrategy::IrradianceBased { irradiance }, force)
    }

    /// Current version tag of `kind`, computing it if needed
    fn ensure_source(&mut self, kind: ArtifactKind) -> CalResult<u64> {
        let version = match kind {
            ArtifactKind::Raw => {
                self.raw()?;
                self.raw.version()
            }
            ArtifactKind::Intensity => Some(self.intensity(false)?.version),
            ArtifactKind::Radiance => Some(self.radiance(false)?.version),
            ArtifactKind::Reflectance => self.reflectance.version(),
            ArtifactKind::Undistorted => None,
        };
        version.ok_or_else(|| match kind {
            ArtifactKind::Undistorted => {
                CalError::Processing("cannot undistort an already undistorted grid".to_string())
            }
            _ => CalError::MissingCalibrationInput(format!(
                "{} has not been computed for {}",
                kind, self.params.identity
            )),
        })
    }

    fn source_grid(&self, kind: ArtifactKind) -> Option<RealImage> {
        match kind {
            ArtifactKind::Raw => self.raw.get().map(|raw| raw.data.mapv(|v| v as Real)),
            ArtifactKind::Intensity => self.intensity.get().map(|img| img.data.clone()),
            ArtifactKind::Radiance => self.radiance.get().map(|img| img.data.clone()),
            ArtifactKind::Reflectance => self.reflectance.get().map(|img| img.data.clone()),
            ArtifactKind::Undistorted => None,
        }
    }

    /// Lens-undistorted copy of `source`.
    ///
    /// Reflectance must have been computed first since it needs a strategy.
    /// The result is cached against the source's version tag.
    pub fn undistorted(&mut self, source: ArtifactKind) -> CalResult<Arc<CorrectedImage>> {
        let source_version = self.ensure_source(source)?;
        let wanted = Provenance::Undistorted {
            source,
            source_version,
        };
        if self.undistorted.provenance() == Some(&wanted) {
            if let Some(cached) = self.undistorted.get() {
                log::debug!("{}: undistorted {} served from cache", self.params.identity, source);
                return Ok(Arc::clone(cached));
            }
        }

        let grid = self.source_grid(source).ok_or_else(|| {
            CalError::Processing(format!("{} vanished while undistorting", source))
        })?;
        let undistorter = LensUndistorter::with_params(
            &self.params.geometry,
            self.params.image_size,
            self.undistort_params.clone(),
        )?;
        let data = undistorter.undistort(&grid)?;
        Ok(self.store(ArtifactKind::Undistorted, wanted, data))
    }

    /// Drop pixels and every derived grid; parameters are kept
    pub fn clear_image_data(&mut self) {
        log::debug!("Clearing cached image data for {}", self.params.identity);
        self.raw = ArtifactSlot::Unset;
        self.vignette = None;
        self.intensity = ArtifactSlot::Unset;
        self.radiance = ArtifactSlot::Unset;
        self.reflectance = ArtifactSlot::Unset;
        self.undistorted = ArtifactSlot::Unset;
    }
}

use crate::types::{
    CalError, CalResult, CalibrationParameters, CameraGeometry, DistortionParameters, DlsPose,
    GeoPosition, ImageIdentity, RadiometricCoefficients, Real, VignetteParams,
};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Source of per-image calibration constants and acquisition parameters.
///
/// Implementations are pure data sources: no pixel computation happens here.
pub trait MetadataProvider {
    /// Whether the camera firmware wrote radiometric calibration data at all
    fn supports_radiometric_calibration(&self) -> bool;

    fn band_name(&self) -> CalResult<String>;
    fn band_index(&self) -> CalResult<u32>;
    fn capture_id(&self) -> CalResult<String>;
    fn flight_id(&self) -> Option<String>;

    fn black_level(&self) -> CalResult<Real>;
    fn gain(&self) -> CalResult<Real>;
    /// Exposure time in seconds
    fn exposure_time(&self) -> CalResult<Real>;
    fn bits_per_pixel(&self) -> CalResult<u32>;
    fn radiometric_coefficients(&self) -> CalResult<RadiometricCoefficients>;

    fn vignette_center(&self) -> CalResult<(Real, Real)>;
    /// Radial vignette polynomial in the order it is stored by the camera
    fn vignette_polynomial(&self) -> CalResult<Vec<Real>>;

    fn distortion_parameters(&self) -> CalResult<DistortionParameters>;
    fn principal_point_mm(&self) -> CalResult<(Real, Real)>;
    fn focal_plane_resolution_px_per_mm(&self) -> CalResult<(Real, Real)>;
    fn focal_length_mm(&self) -> CalResult<Real>;
    /// (width, height) in pixels
    fn image_size(&self) -> CalResult<(usize, usize)>;

    fn center_wavelength(&self) -> Option<Real>;
    fn bandwidth(&self) -> Option<Real>;

    fn utc_time(&self) -> CalResult<Option<DateTime<Utc>>>;
    fn position(&self) -> CalResult<Option<GeoPosition>>;
    fn dls_present(&self) -> bool;
    fn dls_pose(&self) -> CalResult<Option<DlsPose>>;
    fn dls_irradiance(&self) -> CalResult<Option<Real>>;
}

impl CalibrationParameters {
    /// Snapshot every value the pipeline needs from a metadata provider
    pub fn from_provider(provider: &dyn MetadataProvider) -> CalResult<Self> {
        if !provider.supports_radiometric_calibration() {
            return Err(CalError::UnsupportedCalibration(
                "images must be taken with firmware that records radiometric calibration"
                    .to_string(),
            ));
        }

        let identity = ImageIdentity::new(provider.band_index()?, provider.capture_id()?);
        log::debug!("Reading calibration parameters for {}", identity);

        Ok(CalibrationParameters {
            identity,
            band_name: provider.band_name()?,
            flight_id: provider.flight_id(),
            black_level: provider.black_level()?,
            gain: provider.gain()?,
            exposure_time: provider.exposure_time()?,
            bits_per_pixel: provider.bits_per_pixel()?,
            radiometric: provider.radiometric_coefficients()?,
            vignette: VignetteParams {
                center: provider.vignette_center()?,
                polynomial: provider.vignette_polynomial()?,
            },
            geometry: CameraGeometry {
                focal_length_mm: provider.focal_length_mm()?,
                focal_plane_resolution_px_per_mm: provider.focal_plane_resolution_px_per_mm()?,
                principal_point_mm: provider.principal_point_mm()?,
                distortion: provider.distortion_parameters()?,
            },
            image_size: provider.image_size()?,
            irradiance: provider.dls_irradiance()?,
            dls_pose: provider.dls_pose()?,
            position: provider.position()?,
            utc_time: provider.utc_time()?,
            center_wavelength: provider.center_wavelength(),
            bandwidth: provider.bandwidth(),
        })
    }
}

// Tag names as written by `exiftool -j -G`
const TAG_RADIOMETRIC_CAL: &str = "XMP:RadiometricCalibration";
const TAG_BAND_NAME: &str = "XMP:BandName";
const TAG_BAND_INDEX: &str = "XMP:RigCameraIndex";
const TAG_CAPTURE_ID: &str = "XMP:CaptureId";
const TAG_FLIGHT_ID: &str = "XMP:FlightId";
const TAG_BLACK_LEVEL: &str = "EXIF:BlackLevel";
const TAG_ISO_SPEED: &str = "EXIF:ISOSpeed";
const TAG_EXPOSURE: &str = "EXIF:ExposureTime";
const TAG_BITS: &str = "EXIF:BitsPerSample";
const TAG_VIGNETTE_CENTER: &str = "XMP:VignettingCenter";
const TAG_VIGNETTE_POLY: &str = "XMP:VignettingPolynomial";
const TAG_DISTORTION: &str = "XMP:PerspectiveDistortion";
const TAG_PRINCIPAL_POINT: &str = "XMP:PrincipalPoint";
const TAG_FP_X_RES: &str = "EXIF:FocalPlaneXResolution";
const TAG_FP_Y_RES: &str = "EXIF:FocalPlaneYResolution";
const TAG_FOCAL_LENGTH: &str = "XMP:PerspectiveFocalLength";
const TAG_FOCAL_UNITS: &str = "XMP:PerspectiveFocalLengthUnits";
const TAG_WIDTH: &str = "EXIF:ImageWidth";
const TAG_HEIGHT: &str = "EXIF:ImageHeight";
const TAG_WAVELENGTH: &str = "XMP:CentralWavelength";
const TAG_BANDWIDTH: &str = "XMP:WavelengthFWHM";
const TAG_DATETIME: &str = "EXIF:DateTimeOriginal";
const TAG_SUBSEC: &str = "EXIF:SubSecTime";
const TAG_LAT: &str = "EXIF:GPSLatitude";
const TAG_LAT_REF: &str = "EXIF:GPSLatitudeRef";
const TAG_LON: &str = "EXIF:GPSLongitude";
const TAG_LON_REF: &str = "EXIF:GPSLongitudeRef";
const TAG_ALT: &str = "EXIF:GPSAltitude";
const TAG_DLS_IRRADIANCE_PRESENT: &str = "XMP:Irradiance";
const TAG_SPECTRAL_IRRADIANCE: &str = "XMP:SpectralIrradiance";
const TAG_YAW: &str = "XMP:Yaw";
const TAG_PITCH: &str = "XMP:Pitch";
const TAG_ROLL: &str = "XMP:Roll";

/// Metadata backed by an exiftool-style tag dump (`exiftool -j -G -n`)
#[derive(Debug, Clone)]
pub struct TagMetadata {
    tags: Map<String, Value>,
    source: Option<PathBuf>,
}

impl TagMetadata {
    pub fn from_tags(tags: Map<String, Value>) -> Self {
        Self { tags, source: None }
    }

    /// Parse a JSON dump; exiftool wraps each file's tags in a one-element array
    pub fn from_json_str(json: &str) -> CalResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| CalError::Metadata(format!("Invalid tag JSON: {}", e)))?;

        let object = match value {
            Value::Object(map) => map,
            Value::Array(mut items) if !items.is_empty() => match items.swap_remove(0) {
                Value::Object(map) => map,
                _ => {
                    return Err(CalError::Metadata(
                        "Tag JSON array must contain objects".to_string(),
                    ))
                }
            },
            _ => {
                return Err(CalError::Metadata(
                    "Tag JSON must be an object or a non-empty array".to_string(),
                ))
            }
        };

        Ok(Self::from_tags(object))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let path = path.as_ref();
        log::debug!("Reading tag dump: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let mut meta = Self::from_json_str(&content)?;
        meta.source = Some(path.to_path_buf());
        Ok(meta)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Raw tag lookup by `Group:Name`
    pub fn get_item(&self, tag: &str) -> Option<&Value> {
        self.tags.get(tag)
    }

    fn require(&self, tag: &str) -> CalResult<&Value> {
        self.get_item(tag)
            .ok_or_else(|| CalError::Metadata(format!("Missing tag {}", tag)))
    }

    fn real(&self, tag: &str) -> CalResult<Real> {
        value_as_real(self.require(tag)?)
            .ok_or_else(|| CalError::Metadata(format!("Tag {} is not numeric", tag)))
    }

    fn optional_real(&self, tag: &str) -> CalResult<Option<Real>> {
        match self.get_item(tag) {
            None => Ok(None),
            Some(v) => value_as_real(v)
                .map(Some)
                .ok_or_else(|| CalError::Metadata(format!("Tag {} is not numeric", tag))),
        }
    }

    fn text(&self, tag: &str) -> CalResult<String> {
        value_as_text(self.require(tag)?)
            .ok_or_else(|| CalError::Metadata(format!("Tag {} is not a scalar", tag)))
    }

    fn real_list(&self, tag: &str) -> CalResult<Vec<Real>> {
        value_as_real_list(self.require(tag)?)
            .ok_or_else(|| CalError::Metadata(format!("Tag {} is not a numeric list", tag)))
    }

    fn real_pair(&self, tag: &str) -> CalResult<(Real, Real)> {
        match self.real_list(tag)?.as_slice() {
            [a, b] => Ok((*a, *b)),
            other => Err(CalError::Metadata(format!(
                "Tag {} should hold 2 values, got {}",
                tag,
                other.len()
            ))),
        }
    }
}

impl MetadataProvider for TagMetadata {
    fn supports_radiometric_calibration(&self) -> bool {
        self.get_item(TAG_RADIOMETRIC_CAL).is_some()
    }

    fn band_name(&self) -> CalResult<String> {
        self.text(TAG_BAND_NAME)
    }

    fn band_index(&self) -> CalResult<u32> {
        let index = self.real(TAG_BAND_INDEX)?;
        if index < 0.0 || index.fract() != 0.0 {
            return Err(CalError::Metadata(format!("Invalid band index {}", index)));
        }
        Ok(index as u32)
    }

    fn capture_id(&self) -> CalResult<String> {
        self.text(TAG_CAPTURE_ID)
    }

    fn flight_id(&self) -> Option<String> {
        self.get_item(TAG_FLIGHT_ID).and_then(value_as_text)
    }

    /// Mean of the per-channel black levels
    fn black_level(&self) -> CalResult<Real> {
        let levels = self.real_list(TAG_BLACK_LEVEL)?;
        if levels.is_empty() {
            return Err(CalError::Metadata("Empty black level tag".to_string()));
        }
        Ok(levels.iter().sum::<Real>() / levels.len() as Real)
    }

    fn gain(&self) -> CalResult<Real> {
        Ok(self.real(TAG_ISO_SPEED)? / 100.0)
    }

    fn exposure_time(&self) -> CalResult<Real> {
        self.real(TAG_EXPOSURE)
    }

    fn bits_per_pixel(&self) -> CalResult<u32> {
        Ok(self.real(TAG_BITS)? as u32)
    }

    fn radiometric_coefficients(&self) -> CalResult<RadiometricCoefficients> {
        RadiometricCoefficients::from_slice(&self.real_list(TAG_RADIOMETRIC_CAL)?)
    }

    fn vignette_center(&self) -> CalResult<(Real, Real)> {
        self.real_pair(TAG_VIGNETTE_CENTER)
    }

    fn vignette_polynomial(&self) -> CalResult<Vec<Real>> {
        self.real_list(TAG_VIGNETTE_POLY)
    }

    fn distortion_parameters(&self) -> CalResult<DistortionParameters> {
        DistortionParameters::from_native(&self.real_list(TAG_DISTORTION)?)
    }

    fn principal_point_mm(&self) -> CalResult<(Real, Real)> {
        self.real_pair(TAG_PRINCIPAL_POINT)
    }

    fn focal_plane_resolution_px_per_mm(&self) -> CalResult<(Real, Real)> {
        Ok((self.real(TAG_FP_X_RES)?, self.real(TAG_FP_Y_RES)?))
    }

    fn focal_length_mm(&self) -> CalResult<Real> {
        let focal_length = self.real(TAG_FOCAL_LENGTH)?;
        let units = self.get_item(TAG_FOCAL_UNITS).and_then(value_as_text);
        if units.as_deref() == Some("mm") {
            Ok(focal_length)
        } else {
            // stored in pixels
            let (x_res, _) = self.focal_plane_resolution_px_per_mm()?;
            Ok(focal_length / x_res)
        }
    }

    fn image_size(&self) -> CalResult<(usize, usize)> {
        Ok((self.real(TAG_WIDTH)? as usize, self.real(TAG_HEIGHT)? as usize))
    }

    fn center_wavelength(&self) -> Option<Real> {
        self.get_item(TAG_WAVELENGTH).and_then(value_as_real)
    }

    fn bandwidth(&self) -> Option<Real> {
        self.get_item(TAG_BANDWIDTH).and_then(value_as_real)
    }

    fn utc_time(&self) -> CalResult<Option<DateTime<Utc>>> {
        let Some(stamp) = self.get_item(TAG_DATETIME).and_then(value_as_text) else {
            return Ok(None);
        };
        let naive = NaiveDateTime::parse_from_str(&stamp, "%Y:%m:%d %H:%M:%S")
            .map_err(|e| CalError::Metadata(format!("Invalid capture time '{}': {}", stamp, e)))?;

        let subsec = match self.get_item(TAG_SUBSEC).and_then(value_as_text) {
            Some(text) => parse_subsec_seconds(&text)?,
            None => 0.0,
        };
        let offset = Duration::microseconds((subsec * 1e6).round() as i64);

        Ok(Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc) + offset))
    }

    fn position(&self) -> CalResult<Option<GeoPosition>> {
        let (Some(_), Some(_)) = (self.get_item(TAG_LAT), self.get_item(TAG_LON)) else {
            return Ok(None);
        };
        let mut latitude = self.real(TAG_LAT)?;
        let mut longitude = self.real(TAG_LON)?;
        if self.get_item(TAG_LAT_REF).and_then(value_as_text).as_deref() == Some("S") {
            latitude = -latitude.abs();
        }
        if self.get_item(TAG_LON_REF).and_then(value_as_text).as_deref() == Some("W") {
            longitude = -longitude.abs();
        }
        let altitude = self.optional_real(TAG_ALT)?;
        Ok(Some(GeoPosition { latitude, longitude, altitude }))
    }

    fn dls_present(&self) -> bool {
        self.get_item(TAG_DLS_IRRADIANCE_PRESENT).is_some()
    }

    fn dls_pose(&self) -> CalResult<Option<DlsPose>> {
        match (self.optional_real(TAG_YAW)?, self.optional_real(TAG_PITCH)?, self.optional_real(TAG_ROLL)?) {
            (Some(yaw), Some(pitch), Some(roll)) => Ok(Some(DlsPose { yaw, pitch, roll })),
            (None, None, None) => Ok(None),
            _ => Err(CalError::Metadata("Incomplete DLS pose tags".to_string())),
        }
    }

    fn dls_irradiance(&self) -> CalResult<Option<Real>> {
        self.optional_real(TAG_SPECTRAL_IRRADIANCE)
    }
}

/// Sub-second field is the digits after the decimal point, optionally signed
fn parse_subsec_seconds(text: &str) -> CalResult<Real> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CalError::Metadata(format!("Invalid sub-second time '{}'", text)));
    }
    let fraction: Real = format!("0.{}", digits)
        .parse()
        .map_err(|e| CalError::Metadata(format!("Invalid sub-second time '{}': {}", text, e)))?;
    Ok(if negative { -fraction } else { fraction })
}

fn value_as_real(value: &Value) -> Option<Real> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accepts JSON arrays as well as space- or comma-separated strings
fn value_as_real_list(value: &Value) -> Option<Vec<Real>> {
    match value {
        Value::Array(items) => items.iter().map(value_as_real).collect(),
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| part.parse().ok())
            .collect(),
        Value::Number(n) => n.as_f64().map(|v| vec![v]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn rededge_tags() -> TagMetadata {
        TagMetadata::from_json_str(
            r#"[{
                "EXIF:Make": "MicaSense",
                "XMP:BandName": "Blue",
                "XMP:RigCameraIndex": 0,
                "XMP:CaptureId": "5v25BtsZg3BQBhVH7Iaz",
                "XMP:FlightId": "NtLNbVIdowuCaWYbg3ck",
                "EXIF:BlackLevel": "4800 4800 4800 4800",
                "EXIF:ISOSpeed": 100,
                "EXIF:ExposureTime": 0.0013,
                "EXIF:BitsPerSample": 16,
                "XMP:RadiometricCalibration": ["0.00019", "6.4e-05", "0.00027"],
                "XMP:VignettingCenter": [676.703, 480.445],
                "XMP:VignettingPolynomial": "-3.1881e-05 1.1380e-07 -2.7776e-09",
                "XMP:PerspectiveDistortion": [-0.0968, 0.1404, -0.0230, 0.000276, 0.000660],
                "XMP:PrincipalPoint": "2.35363,1.79947",
                "EXIF:FocalPlaneXResolution": 266.666667,
                "EXIF:FocalPlaneYResolution": 266.666667,
                "XMP:PerspectiveFocalLength": 1449.358,
                "XMP:PerspectiveFocalLengthUnits": "px",
                "EXIF:ImageWidth": 1280,
                "EXIF:ImageHeight": 960,
                "XMP:CentralWavelength": 475,
                "XMP:WavelengthFWHM": 20,
                "EXIF:DateTimeOriginal": "2017:10:19 20:40:39",
                "EXIF:SubSecTime": "200174",
                "EXIF:GPSLatitude": 36.576096,
                "EXIF:GPSLatitudeRef": "N",
                "EXIF:GPSLongitude": 119.4352689,
                "EXIF:GPSLongitudeRef": "W",
                "EXIF:GPSAltitude": 101.861,
                "XMP:Irradiance": 1.0,
                "XMP:SpectralIrradiance": 1.0848,
                "XMP:Yaw": -3.070,
                "XMP:Pitch": -0.188,
                "XMP:Roll": -0.013
            }]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_scalar_conversions() {
        let meta = rededge_tags();
        assert!(meta.supports_radiometric_calibration());
        assert_eq!(meta.band_index().unwrap(), 0);
        assert_eq!(meta.black_level().unwrap(), 4800.0);
        assert_eq!(meta.gain().unwrap(), 1.0);
        assert!((meta.focal_length_mm().unwrap() - 5.43509).abs() < 1e-4);
        assert_eq!(meta.principal_point_mm().unwrap(), (2.35363, 1.79947));
        assert_eq!(meta.vignette_polynomial().unwrap().len(), 3);
        assert_eq!(meta.image_size().unwrap(), (1280, 960));
        assert_eq!(meta.flight_id().as_deref(), Some("NtLNbVIdowuCaWYbg3ck"));
    }

    #[test]
    fn test_utc_time_with_subseconds() {
        let time = rededge_tags().utc_time().unwrap().unwrap();
        assert_eq!(time.format("%Y-%m-%d %H:%M:%S").to_string(), "2017-10-19 20:40:39");
        assert_eq!(time.nanosecond(), 200_174_000);
    }

    #[test]
    fn test_negative_subseconds() {
        assert!((parse_subsec_seconds("-25").unwrap() + 0.25).abs() < 1e-12);
        assert!(parse_subsec_seconds("12a").is_err());
    }

    #[test]
    fn test_position_refs() {
        let pos = rededge_tags().position().unwrap().unwrap();
        assert_eq!(pos.latitude, 36.576096);
        assert_eq!(pos.longitude, -119.4352689);
        assert_eq!(pos.altitude, Some(101.861));
    }

    #[test]
    fn test_position_without_altitude() {
        let mut tags = rededge_tags().tags.clone();
        tags.remove(TAG_ALT);
        let pos = TagMetadata::from_tags(tags).position().unwrap().unwrap();
        assert_eq!(pos.latitude, 36.576096);
        assert_eq!(pos.altitude, None);
    }

    #[test]
    fn test_dls_values() {
        let meta = rededge_tags();
        assert!(meta.dls_present());
        assert_eq!(meta.dls_irradiance().unwrap(), Some(1.0848));
        let pose = meta.dls_pose().unwrap().unwrap();
        assert_eq!(pose.yaw, -3.070);
    }

    #[test]
    fn test_parameters_from_provider() {
        let params = CalibrationParameters::from_provider(&rededge_tags()).unwrap();
        assert_eq!(params.band_name, "Blue");
        assert_eq!(params.bits_per_pixel, 16);
        assert_eq!(params.radiometric.a1, 0.00019);
        assert_eq!(params.geometry.distortion.k3, -0.0230);
        assert_eq!(params.irradiance, Some(1.0848));
    }

    #[test]
    fn test_unsupported_firmware() {
        let mut tags = rededge_tags().tags.clone();
        tags.remove(TAG_RADIOMETRIC_CAL);
        let meta = TagMetadata::from_tags(tags);
        assert!(matches!(
            CalibrationParameters::from_provider(&meta),
            Err(CalError::UnsupportedCalibration(_))
        ));
    }

    #[test]
    fn test_missing_tag_is_error() {
        let mut tags = rededge_tags().tags.clone();
        tags.remove(TAG_EXPOSURE);
        let meta = TagMetadata::from_tags(tags);
        assert!(matches!(meta.exposure_time(), Err(CalError::Metadata(_))));
    }
}

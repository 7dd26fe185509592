use crate::core::vignette::VignetteField;
use crate::types::{
    check_bit_depth, CalError, CalResult, CalibrationParameters, RadiometricCoefficients, RawImage,
    Real, RealImage,
};
use ndarray::{Array1, Zip};

/// Intermediate and final products of one radiometric conversion
#[derive(Debug, Clone)]
pub struct RadiometricProducts {
    /// Row-gradient factor per image row
    pub row_gradient: Array1<Real>,
    /// Vignette and row corrected, black-level subtracted, clamped DN
    pub signal: RealImage,
    /// DN * seconds, no radiance scaling
    pub intensity: RealImage,
    pub radiance: RealImage,
}

/// DN to intensity / radiance conversion for one band image
#[derive(Debug, Clone)]
pub struct RadiometricConverter {
    black_level: Real,
    gain: Real,
    exposure_time: Real,
    bits_per_pixel: u32,
    coefficients: RadiometricCoefficients,
}

impl RadiometricConverter {
    /// Create a converter; fails for anything but 16-bit data
    pub fn new(params: &CalibrationParameters) -> CalResult<Self> {
        check_bit_depth(params.bits_per_pixel)?;

        if params.exposure_time.is_nan() || params.exposure_time <= 0.0 {
            return Err(CalError::Metadata(format!(
                "Exposure time must be positive, got {}",
                params.exposure_time
            )));
        }
        if params.gain.is_nan() || params.gain <= 0.0 {
            return Err(CalError::Metadata(format!("Gain must be positive, got {}", params.gain)));
        }

        Ok(Self {
            black_level: params.black_level,
            gain: params.gain,
            exposure_time: params.exposure_time,
            bits_per_pixel: params.bits_per_pixel,
            coefficients: params.radiometric,
        })
    }

    fn max_dn(&self) -> Real {
        (2.0 as Real).powi(self.bits_per_pixel as i32)
    }

    /// Row-gradient correction `1 / (1 + a2*y/t - a3*y)` for row `y`
    pub fn row_gradient(&self, y: Real) -> Real {
        let RadiometricCoefficients { a2, a3, .. } = self.coefficients;
        1.0 / (1.0 + a2 * y / self.exposure_time - a3 * y)
    }

    /// Vignette, row-gradient and black-level corrected signal, clamped at zero
    pub fn corrected_signal(&self, raw: &RawImage, vignette: &VignetteField) -> CalResult<RealImage> {
        Ok(self.signal_with_rows(raw, vignette)?.1)
    }

    fn signal_with_rows(
        &self,
        raw: &RawImage,
        vignette: &VignetteField,
    ) -> CalResult<(Array1<Real>, RealImage)> {
        raw.validate_bit_depth()?;
        if raw.data.dim() != vignette.factors.dim() {
            return Err(CalError::InvalidFormat(format!(
                "Raw image is {:?} but vignette field is {:?}",
                raw.data.dim(),
                vignette.factors.dim()
            )));
        }

        // row coordinates from the vignette grid
        let row_gradient: Array1<Real> = vignette
            .y
            .outer_iter()
            .map(|ys| ys.get(0).map_or(1.0, |&y| self.row_gradient(y)))
            .collect();
        if let Some(row) = row_gradient.iter().position(|r| !r.is_finite()) {
            return Err(CalError::DegenerateCalibration(format!(
                "row-gradient term is not finite at row {}",
                row
            )));
        }

        let black_level = self.black_level;
        let mut signal = RealImage::zeros(raw.data.dim());
        Zip::indexed(&mut signal)
            .and(&raw.data)
            .and(&vignette.factors)
            .for_each(|(row, _), out, &dn, &v| {
                let l = v * row_gradient[row] * (dn as Real - black_level);
                *out = if l < 0.0 { 0.0 } else { l };
            });

        if signal.iter().any(|v| !v.is_finite()) {
            return Err(CalError::DegenerateCalibration(
                "corrected signal contains non-finite values".to_string(),
            ));
        }

        Ok((row_gradient, signal))
    }

    /// Signal to intensity, DN * seconds
    pub fn intensity_from_signal(&self, signal: &RealImage) -> RealImage {
        let scale = self.gain * self.exposure_time * self.max_dn();
        signal.mapv(|l| l / scale)
    }

    /// Signal to radiance using the a1 sensitivity coefficient
    pub fn radiance_from_signal(&self, signal: &RealImage) -> RealImage {
        let exposure_gain = self.gain * self.exposure_time;
        let a1 = self.coefficients.a1;
        let max_dn = self.max_dn();
        signal.mapv(|l| l / exposure_gain * a1 / max_dn)
    }

    pub fn intensity(&self, raw: &RawImage, vignette: &VignetteField) -> CalResult<RealImage> {
        let signal = self.corrected_signal(raw, vignette)?;
        Ok(self.intensity_from_signal(&signal))
    }

    pub fn radiance(&self, raw: &RawImage, vignette: &VignetteField) -> CalResult<RealImage> {
        log::info!("Applying radiometric calibration to {}x{} image", raw.width(), raw.height());
        let signal = self.corrected_signal(raw, vignette)?;
        let radiance = self.radiance_from_signal(&signal);
        log::info!(
            "Radiance conversion completed. Output range: {:.3e} to {:.3e}",
            radiance.iter().cloned().fold(Real::INFINITY, Real::min),
            radiance.iter().cloned().fold(Real::NEG_INFINITY, Real::max)
        );
        Ok(radiance)
    }

    /// Run the full conversion, keeping every intermediate product
    pub fn convert(&self, raw: &RawImage, vignette: &VignetteField) -> CalResult<RadiometricProducts> {
        let (row_gradient, signal) = self.signal_with_rows(raw, vignette)?;
        let intensity = self.intensity_from_signal(&signal);
        let radiance = self.radiance_from_signal(&signal);
        Ok(RadiometricProducts {
            row_gradient,
            signal,
            intensity,
            radiance,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::vignette::VignetteModel;
    use crate::types::{
        CameraGeometry, DistortionParameters, ImageIdentity, RawGrid, VignetteParams,
    };
    use approx::assert_relative_eq;

    pub(crate) fn flat_params(width: usize, height: usize) -> CalibrationParameters {
        CalibrationParameters {
            identity: ImageIdentity::new(0, "capture-0"),
            band_name: "Blue".to_string(),
            flight_id: None,
            black_level: 0.0,
            gain: 1.0,
            exposure_time: 0.001,
            bits_per_pixel: 16,
            radiometric: RadiometricCoefficients { a1: 1.0, a2: 0.0, a3: 0.0 },
            vignette: VignetteParams {
                center: (width as Real / 2.0, height as Real / 2.0),
                polynomial: vec![],
            },
            geometry: CameraGeometry {
                focal_length_mm: 5.4,
                focal_plane_resolution_px_per_mm: (266.666667, 266.666667),
                principal_point_mm: (
                    width as Real / 2.0 / 266.666667,
                    height as Real / 2.0 / 266.666667,
                ),
                distortion: DistortionParameters::none(),
            },
            image_size: (width, height),
            irradiance: None,
            dls_pose: None,
            position: None,
            utc_time: None,
            center_wavelength: None,
            bandwidth: None,
        }
    }

    fn vignette_for(params: &CalibrationParameters) -> VignetteField {
        let (w, h) = params.image_size;
        VignetteModel::new(&params.vignette).compute(w, h).unwrap()
    }

    #[test]
    fn test_constant_raw_scenario() {
        let params = flat_params(8, 6);
        let raw = RawImage::new(RawGrid::from_elem((6, 8), 1000), 16);
        let converter = RadiometricConverter::new(&params).unwrap();
        let products = converter.convert(&raw, &vignette_for(&params)).unwrap();

        assert!(products.signal.iter().all(|&l| l == 1000.0));
        let expected = 1000.0 / (1.0 * 0.001 * 65536.0);
        assert_relative_eq!(products.intensity[[3, 4]], expected, max_relative = 1e-12);
        assert_relative_eq!(products.radiance[[0, 0]], expected, max_relative = 1e-12);
        assert_relative_eq!(expected, 15.2587890625, max_relative = 1e-12);
    }

    #[test]
    fn test_signal_never_negative() {
        let mut params = flat_params(5, 5);
        params.black_level = 4800.0;
        params.radiometric = RadiometricCoefficients { a1: 0.5, a2: 1e-5, a3: 2e-4 };
        params.vignette.polynomial = vec![1e-3, -2e-5];
        let raw = RawImage::new(RawGrid::from_shape_fn((5, 5), |(r, c)| (r * 2400 + c * 10) as u16), 16);

        let converter = RadiometricConverter::new(&params).unwrap();
        let signal = converter.corrected_signal(&raw, &vignette_for(&params)).unwrap();
        assert!(signal.iter().all(|&l| l >= 0.0));
        // rows below the black level clamp to zero
        assert!(signal.row(0).iter().all(|&l| l == 0.0));
        assert!(signal[[4, 0]] > 0.0);
    }

    #[test]
    fn test_radiance_over_intensity_is_a1() {
        let mut params = flat_params(6, 4);
        params.radiometric = RadiometricCoefficients { a1: 0.000193, a2: 6.4e-5, a3: 2.7e-4 };
        params.black_level = 100.0;
        params.gain = 2.0;
        params.exposure_time = 0.0013;
        params.vignette.polynomial = vec![-3.2e-5, 1.1e-7];
        let raw = RawImage::new(RawGrid::from_shape_fn((4, 6), |(r, c)| (500 + r * 37 + c * 91) as u16), 16);

        let converter = RadiometricConverter::new(&params).unwrap();
        let products = converter.convert(&raw, &vignette_for(&params)).unwrap();
        Zip::from(&products.radiance)
            .and(&products.intensity)
            .for_each(|&rad, &int| assert_relative_eq!(rad / int, 0.000193, max_relative = 1e-12));
    }

    #[test]
    fn test_row_gradient_uses_row_index() {
        let mut params = flat_params(2, 3);
        params.radiometric = RadiometricCoefficients { a1: 1.0, a2: 1e-4, a3: 1e-3 };
        let converter = RadiometricConverter::new(&params).unwrap();
        assert_eq!(converter.row_gradient(0.0), 1.0);
        let expected = 1.0 / (1.0 + 1e-4 * 2.0 / 0.001 - 1e-3 * 2.0);
        assert_relative_eq!(converter.row_gradient(2.0), expected);
    }

    #[test]
    fn test_row_gradient_follows_vignette_rows() {
        let mut params = flat_params(3, 4);
        params.radiometric = RadiometricCoefficients { a1: 1.0, a2: 1e-4, a3: 1e-3 };
        let converter = RadiometricConverter::new(&params).unwrap();

        // grid whose row coordinates start at 5 instead of 0
        let vignette = VignetteField {
            factors: RealImage::from_elem((4, 3), 1.0),
            x: RealImage::from_shape_fn((4, 3), |(_, c)| c as Real),
            y: RealImage::from_shape_fn((4, 3), |(r, _)| (r + 5) as Real),
        };
        let raw = RawImage::new(RawGrid::from_elem((4, 3), 2000), 16);
        let products = converter.convert(&raw, &vignette).unwrap();

        for row in 0..4 {
            let expected = converter.row_gradient((row + 5) as Real);
            assert_relative_eq!(products.row_gradient[row], expected, max_relative = 1e-12);
            assert_relative_eq!(products.signal[[row, 1]], 2000.0 * expected, max_relative = 1e-12);
        }
        assert!(products.row_gradient[0] != converter.row_gradient(0.0));
    }

    #[test]
    fn test_unsupported_bit_depth_is_fatal() {
        let mut params = flat_params(4, 4);
        params.bits_per_pixel = 12;
        assert!(matches!(
            RadiometricConverter::new(&params),
            Err(CalError::UnsupportedBitDepth(12))
        ));

        let params = flat_params(4, 4);
        let converter = RadiometricConverter::new(&params).unwrap();
        let raw = RawImage::new(RawGrid::zeros((4, 4)), 14);
        assert!(matches!(
            converter.radiance(&raw, &vignette_for(&params)),
            Err(CalError::UnsupportedBitDepth(14))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let params = flat_params(4, 4);
        let converter = RadiometricConverter::new(&params).unwrap();
        let raw = RawImage::new(RawGrid::zeros((3, 4)), 16);
        assert!(matches!(
            converter.intensity(&raw, &vignette_for(&params)),
            Err(CalError::InvalidFormat(_))
        ));
    }
}

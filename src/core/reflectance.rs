use crate::types::{CalError, CalResult, Real, RealImage};
use std::f64::consts::PI;

/// How radiance is turned into reflectance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReflectanceStrategy {
    /// `radiance * pi / irradiance`, irradiance in the radiance units
    IrradianceBased { irradiance: Real },
    /// `radiance * factor`, factor from a reference panel
    PanelFactorBased { factor: Real },
}

impl ReflectanceStrategy {
    /// Irradiance strategy from an optional measurement; absence is an error
    pub fn from_irradiance(irradiance: Option<Real>) -> CalResult<Self> {
        irradiance
            .map(|irradiance| Self::IrradianceBased { irradiance })
            .ok_or_else(|| {
                CalError::MissingCalibrationInput(
                    "irradiance-based reflectance requested without an irradiance value".to_string(),
                )
            })
    }

    pub fn panel_factor(factor: Real) -> Self {
        Self::PanelFactorBased { factor }
    }

    /// Multiplier applied to every radiance sample
    pub fn scale(&self) -> CalResult<Real> {
        match *self {
            Self::IrradianceBased { irradiance } => {
                if irradiance == 0.0 || !irradiance.is_finite() {
                    return Err(CalError::DegenerateCalibration(format!(
                        "irradiance must be finite and non-zero, got {}",
                        irradiance
                    )));
                }
                Ok(PI / irradiance)
            }
            Self::PanelFactorBased { factor } => {
                if !factor.is_finite() {
                    return Err(CalError::DegenerateCalibration(format!(
                        "calibration factor is not finite: {}",
                        factor
                    )));
                }
                Ok(factor)
            }
        }
    }

    /// True when both are the same variant, regardless of value
    pub fn same_kind(&self, other: &ReflectanceStrategy) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IrradianceBased { .. } => "irradiance",
            Self::PanelFactorBased { .. } => "panel factor",
        }
    }
}

/// Radiance to reflectance conversion
pub struct ReflectanceConverter;

impl ReflectanceConverter {
    pub fn convert(radiance: &RealImage, strategy: &ReflectanceStrategy) -> CalResult<RealImage> {
        let scale = strategy.scale()?;
        log::info!(
            "Converting {}x{} radiance to reflectance ({} strategy, scale {:.6e})",
            radiance.ncols(),
            radiance.nrows(),
            strategy.name(),
            scale
        );

        let reflectance = radiance.mapv(|r| r * scale);

        let above_one = reflectance.iter().filter(|&&v| v > 1.0).count();
        if above_one > 0 {
            log::warn!(
                "{} of {} reflectance samples exceed 1.0 (specular or mis-calibrated?)",
                above_one,
                reflectance.len()
            );
        }
        log::debug!(
            "Reflectance range: {:.4} to {:.4}",
            reflectance.iter().cloned().fold(Real::INFINITY, Real::min),
            reflectance.iter().cloned().fold(Real::NEG_INFINITY, Real::max)
        );
        Ok(reflectance)
    }
}

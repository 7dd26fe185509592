use crate::types::{CalError, CalResult, Real, RealImage, VignetteParams};
use ndarray::{Array2, Zip};

/// Per-pixel vignette correction plus the coordinate meshes it was built on.
///
/// The meshes are kept so the row-gradient term can reuse `y` without
/// rebuilding it.
#[derive(Debug, Clone)]
pub struct VignetteField {
    /// Multiplicative correction, one factor per pixel
    pub factors: RealImage,
    /// Column index of each pixel
    pub x: RealImage,
    /// Row index of each pixel
    pub y: RealImage,
}

/// Radial polynomial vignette model
#[derive(Debug, Clone)]
pub struct VignetteModel {
    center: (Real, Real),
    /// Highest power first, trailing unit constant term
    descending: Vec<Real>,
}

impl VignetteModel {
    /// Camera coefficients are stored lowest power first, starting at r^1
    pub fn new(params: &VignetteParams) -> Self {
        let mut descending: Vec<Real> = params.polynomial.iter().rev().copied().collect();
        descending.push(1.0);
        Self {
            center: params.center,
            descending,
        }
    }

    pub fn center(&self) -> (Real, Real) {
        self.center
    }

    /// Evaluate the vignette polynomial at radius `r` (Horner form)
    pub fn polynomial(&self, r: Real) -> Real {
        self.descending.iter().fold(0.0, |acc, &c| acc * r + c)
    }

    /// Correction factor for a single pixel
    pub fn factor_at(&self, x: Real, y: Real) -> Real {
        let r = (x - self.center.0).hypot(y - self.center.1);
        1.0 / self.polynomial(r)
    }

    /// Build the correction field for a `width` x `height` image
    pub fn compute(&self, width: usize, height: usize) -> CalResult<VignetteField> {
        log::debug!(
            "Computing {}x{} vignette field, center ({:.3}, {:.3}), {} coefficients",
            width,
            height,
            self.center.0,
            self.center.1,
            self.descending.len() - 1
        );

        let x = Array2::from_shape_fn((height, width), |(_, col)| col as Real);
        let y = Array2::from_shape_fn((height, width), |(row, _)| row as Real);

        #[cfg(feature = "parallel")]
        let factors = Zip::from(&x).and(&y).par_map_collect(|&px, &py| self.factor_at(px, py));
        #[cfg(not(feature = "parallel"))]
        let factors = Zip::from(&x).and(&y).map_collect(|&px, &py| self.factor_at(px, py));

        let non_finite = factors.iter().filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            return Err(CalError::DegenerateCalibration(format!(
                "vignette polynomial has a root inside the image: {} non-finite factors",
                non_finite
            )));
        }

        Ok(VignetteField { factors, x, y })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(center: (Real, Real), polynomial: Vec<Real>) -> VignetteParams {
        VignetteParams { center, polynomial }
    }

    #[test]
    fn test_unity_at_center() {
        let polys = [
            vec![-3.188190987533484e-05, 1.1380741452056501e-07, -2.7776829778142425e-09],
            vec![0.5, -0.25, 0.125, 1e-3],
            vec![],
        ];
        for poly in polys.iter() {
            let model = VignetteModel::new(&params((12.0, 7.0), poly.clone()));
            let field = model.compute(30, 20).unwrap();
            assert_eq!(field.factors[[7, 12]], 1.0);
            assert_eq!(model.factor_at(12.0, 7.0), 1.0);
        }
    }

    #[test]
    fn test_coefficient_order() {
        // p(r) = 1 + 0.1 r + 0.01 r^2
        let model = VignetteModel::new(&params((0.0, 0.0), vec![0.1, 0.01]));
        assert!((model.polynomial(2.0) - 1.24).abs() < 1e-12);
        assert!((model.factor_at(2.0, 0.0) - 1.0 / 1.24).abs() < 1e-12);
    }

    #[test]
    fn test_coordinate_meshes() {
        let model = VignetteModel::new(&params((0.0, 0.0), vec![]));
        let field = model.compute(4, 3).unwrap();
        assert_eq!(field.factors.dim(), (3, 4));
        assert_eq!(field.x[[2, 3]], 3.0);
        assert_eq!(field.y[[2, 3]], 2.0);
        assert!(field.factors.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_degenerate_polynomial() {
        // p(r) = 1 - r vanishes one pixel from the center
        let model = VignetteModel::new(&params((0.0, 0.0), vec![-1.0]));
        let result = model.compute(3, 3);
        assert!(matches!(result, Err(CalError::DegenerateCalibration(_))));
    }
}

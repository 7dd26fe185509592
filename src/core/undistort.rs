use crate::types::{CalError, CalResult, CalibrationParameters, CameraGeometry, Real, RealImage};
use nalgebra::Matrix3;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Lens undistortion parameters
#[derive(Debug, Clone)]
pub struct UndistortParams {
    /// 0 keeps only valid pixels, 1 keeps every source pixel
    pub alpha: Real,
    /// Fixed-point iterations when inverting the distortion model
    pub undistort_iterations: usize,
    /// Border sampling grid size (per axis) for the new camera matrix
    pub grid_samples: usize,
}

impl Default for UndistortParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            undistort_iterations: 5,
            grid_samples: 9,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x: Real,
    y: Real,
    width: Real,
    height: Real,
}

/// Per-pixel source coordinates for resampling
#[derive(Debug, Clone)]
pub struct RemapField {
    pub map_x: RealImage,
    pub map_y: RealImage,
}

/// Brown-Conrady undistortion with a pinhole camera model
#[derive(Debug, Clone)]
pub struct LensUndistorter {
    camera_matrix: Matrix3<Real>,
    /// `[k1, k2, p1, p2, k3]`
    distortion: [Real; 5],
    width: usize,
    height: usize,
    params: UndistortParams,
}

impl LensUndistorter {
    pub fn new(geometry: &CameraGeometry, image_size: (usize, usize)) -> CalResult<Self> {
        Self::with_params(geometry, image_size, UndistortParams::default())
    }

    pub fn with_params(
        geometry: &CameraGeometry,
        image_size: (usize, usize),
        params: UndistortParams,
    ) -> CalResult<Self> {
        let (fx, fy) = geometry.focal_length_px();
        let (cx, cy) = geometry.principal_point_px();
        let valid = [fx, fy, cx, cy].iter().all(|v| v.is_finite()) && fx.abs() > 1e-12 && fy.abs() > 1e-12;
        if !valid {
            return Err(CalError::DegenerateCalibration(format!(
                "invalid camera intrinsics fx={} fy={} cx={} cy={}",
                fx, fy, cx, cy
            )));
        }
        let (width, height) = image_size;
        if width < 2 || height < 2 {
            return Err(CalError::InvalidFormat(format!(
                "image of {}x{} is too small to undistort",
                width, height
            )));
        }

        #[rustfmt::skip]
        let camera_matrix = Matrix3::new(
            fx, 0.0, cx,
            0.0, fy, cy,
            0.0, 0.0, 1.0,
        );

        Ok(Self {
            camera_matrix,
            distortion: geometry.distortion.canonical(),
            width,
            height,
            params,
        })
    }

    pub fn from_parameters(params: &CalibrationParameters) -> CalResult<Self> {
        Self::new(&params.geometry, params.image_size)
    }

    pub fn camera_matrix(&self) -> Matrix3<Real> {
        self.camera_matrix
    }

    pub fn distortion_coefficients(&self) -> [Real; 5] {
        self.distortion
    }

    /// Apply the distortion model to normalized coordinates
    pub fn distort_normalized(&self, x: Real, y: Real) -> (Real, Real) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + ((k3 * r2 + k2) * r2 + k1) * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Invert the distortion model for a distorted pixel, returning normalized coordinates
    pub fn undistort_to_normalized(&self, u: Real, v: Real) -> (Real, Real) {
        let k = &self.camera_matrix;
        let x0 = (u - k[(0, 2)]) / k[(0, 0)];
        let y0 = (v - k[(1, 2)]) / k[(1, 1)];
        let [k1, k2, p1, p2, k3] = self.distortion;

        let (mut x, mut y) = (x0, y0);
        for _ in 0..self.params.undistort_iterations {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + ((k3 * r2 + k2) * r2 + k1) * r2);
            if icdist < 0.0 {
                return (x0, y0);
            }
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - dx) * icdist;
            y = (y0 - dy) * icdist;
        }
        (x, y)
    }

    /// Inscribed and bounding rectangles of the undistorted image, normalized units
    fn undistorted_rectangles(&self) -> (Rect, Rect) {
        let n = self.params.grid_samples.max(2);
        let step_x = (self.width - 1) as Real / (n - 1) as Real;
        let step_y = (self.height - 1) as Real / (n - 1) as Real;

        let (mut ix0, mut ix1, mut iy0, mut iy1) =
            (Real::NEG_INFINITY, Real::INFINITY, Real::NEG_INFINITY, Real::INFINITY);
        let (mut ox0, mut ox1, mut oy0, mut oy1) =
            (Real::INFINITY, Real::NEG_INFINITY, Real::INFINITY, Real::NEG_INFINITY);

        for gy in 0..n {
            for gx in 0..n {
                let (px, py) = self.undistort_to_normalized(gx as Real * step_x, gy as Real * step_y);
                ox0 = ox0.min(px);
                ox1 = ox1.max(px);
                oy0 = oy0.min(py);
                oy1 = oy1.max(py);

                if gx == 0 {
                    ix0 = ix0.max(px);
                }
                if gx == n - 1 {
                    ix1 = ix1.min(px);
                }
                if gy == 0 {
                    iy0 = iy0.max(py);
                }
                if gy == n - 1 {
                    iy1 = iy1.min(py);
                }
            }
        }

        let inner = Rect { x: ix0, y: iy0, width: ix1 - ix0, height: iy1 - iy0 };
        let outer = Rect { x: ox0, y: oy0, width: ox1 - ox0, height: oy1 - oy0 };
        (inner, outer)
    }

    /// New camera matrix for the configured alpha, same output resolution
    pub fn optimal_camera_matrix(&self) -> CalResult<Matrix3<Real>> {
        let (inner, outer) = self.undistorted_rectangles();
        if inner.width <= 0.0 || inner.height <= 0.0 || outer.width <= 0.0 || outer.height <= 0.0 {
            return Err(CalError::DegenerateCalibration(
                "distortion model folds the image border".to_string(),
            ));
        }

        let w = (self.width - 1) as Real;
        let h = (self.height - 1) as Real;
        let fx0 = w / inner.width;
        let fy0 = h / inner.height;
        let cx0 = -fx0 * inner.x;
        let cy0 = -fy0 * inner.y;
        let fx1 = w / outer.width;
        let fy1 = h / outer.height;
        let cx1 = -fx1 * outer.x;
        let cy1 = -fy1 * outer.y;

        let alpha = self.params.alpha;
        let blend = |a: Real, b: Real| a * (1.0 - alpha) + b * alpha;

        #[rustfmt::skip]
        let new_matrix = Matrix3::new(
            blend(fx0, fx1), 0.0, blend(cx0, cx1),
            0.0, blend(fy0, fy1), blend(cy0, cy1),
            0.0, 0.0, 1.0,
        );
        log::debug!(
            "New camera matrix: fx={:.3} fy={:.3} cx={:.3} cy={:.3}",
            new_matrix[(0, 0)],
            new_matrix[(1, 1)],
            new_matrix[(0, 2)],
            new_matrix[(1, 2)]
        );
        Ok(new_matrix)
    }

    /// Source coordinates of every output pixel under `new_matrix`
    pub fn remap_field(&self, new_matrix: &Matrix3<Real>) -> CalResult<RemapField> {
        let inverse = new_matrix.try_inverse().ok_or_else(|| {
            CalError::DegenerateCalibration("new camera matrix is singular".to_string())
        })?;
        let k = self.camera_matrix;
        let (width, height) = (self.width, self.height);

        let source_of = |row: usize, col: usize| -> (Real, Real) {
            let x = inverse[(0, 0)] * col as Real + inverse[(0, 2)];
            let y = inverse[(1, 1)] * row as Real + inverse[(1, 2)];
            let (xd, yd) = self.distort_normalized(x, y);
            (k[(0, 0)] * xd + k[(0, 2)], k[(1, 1)] * yd + k[(1, 2)])
        };

        let coords: Vec<(usize, usize)> = (0..height)
            .flat_map(|i| (0..width).map(move |j| (i, j)))
            .collect();

        #[cfg(feature = "parallel")]
        let sources: Vec<(Real, Real)> = coords.into_par_iter().map(|(i, j)| source_of(i, j)).collect();
        #[cfg(not(feature = "parallel"))]
        let sources: Vec<(Real, Real)> = coords.into_iter().map(|(i, j)| source_of(i, j)).collect();

        let (xs, ys): (Vec<Real>, Vec<Real>) = sources.into_iter().unzip();
        let map_x = RealImage::from_shape_vec((height, width), xs)
            .map_err(|e| CalError::Processing(format!("Shape error: {}", e)))?;
        let map_y = RealImage::from_shape_vec((height, width), ys)
            .map_err(|e| CalError::Processing(format!("Shape error: {}", e)))?;
        Ok(RemapField { map_x, map_y })
    }

    /// Undistort a corrected grid; output keeps the input resolution
    pub fn undistort(&self, image: &RealImage) -> CalResult<RealImage> {
        if image.dim() != (self.height, self.width) {
            return Err(CalError::InvalidFormat(format!(
                "expected {}x{} image, got {}x{}",
                self.width,
                self.height,
                image.ncols(),
                image.nrows()
            )));
        }
        log::info!("Undistorting {}x{} image", self.width, self.height);

        let new_matrix = self.optimal_camera_matrix()?;
        let field = self.remap_field(&new_matrix)?;
        Ok(remap_bilinear(image, &field))
    }
}

/// Bilinear sample; neighbours outside the grid contribute zero
fn sample_bilinear(image: &RealImage, sx: Real, sy: Real) -> Real {
    if !sx.is_finite() || !sy.is_finite() {
        return 0.0;
    }
    let (rows, cols) = image.dim();
    let x0 = sx.floor();
    let y0 = sy.floor();
    let fx = sx - x0;
    let fy = sy - y0;

    let at = |r: Real, c: Real| -> Real {
        if r < 0.0 || c < 0.0 || r >= rows as Real || c >= cols as Real {
            0.0
        } else {
            image[[r as usize, c as usize]]
        }
    };

    let top = at(y0, x0) * (1.0 - fx) + at(y0, x0 + 1.0) * fx;
    let bottom = at(y0 + 1.0, x0) * (1.0 - fx) + at(y0 + 1.0, x0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resample `image` at the coordinates in `field`
pub fn remap_bilinear(image: &RealImage, field: &RemapField) -> RealImage {
    use ndarray::Zip;

    #[cfg(feature = "parallel")]
    let output = Zip::from(&field.map_x)
        .and(&field.map_y)
        .par_map_collect(|&sx, &sy| sample_bilinear(image, sx, sy));
    #[cfg(not(feature = "parallel"))]
    let output = Zip::from(&field.map_x)
        .and(&field.map_y)
        .map_collect(|&sx, &sy| sample_bilinear(image, sx, sy));

    output
}

//! Downwelling light sensor (DLS) model.
//!
//! The DLS sits on top of the aircraft and measures spectral irradiance
//! through a diffuser. Its reading depends on how the sensor is tilted
//! relative to the sun, so the raw value is corrected with the solar
//! position, the sensor attitude and a Fresnel transmission model of the
//! diffuser stack before it is used as ground irradiance.

use crate::types::{CalError, CalResult, DlsPose, GeoPosition, Real};
use chrono::{DateTime, Timelike, Utc};
use nalgebra::{Matrix3, Vector3};

/// Refractive indices of air, the diffuser and its coating
pub const DIFFUSER_INDICES: [Real; 3] = [1.000277, 1.6, 1.38];

/// Sensor boresight in body coordinates: pointing up, NED frame
pub const SENSOR_ORIENTATION: [Real; 3] = [0.0, 0.0, -1.0];

/// Sky model used to split irradiance into direct and diffuse parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyCondition {
    Clear,
    Overcast,
}

impl SkyCondition {
    /// Ratio of diffuse to direct irradiance
    pub fn diffuse_fraction(&self) -> Real {
        match self {
            SkyCondition::Clear => 1.0 / 6.0,
            SkyCondition::Overcast => 1.0,
        }
    }
}

/// Apparent solar position, radians
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    /// Elevation above the horizon (no refraction correction)
    pub elevation: Real,
    /// Azimuth clockwise from north, in [0, 2pi)
    pub azimuth: Real,
}

/// Solar position at `time` seen from `latitude`/`longitude` (degrees), NOAA algorithm
pub fn sun_position(time: &DateTime<Utc>, latitude: Real, longitude: Real) -> SunPosition {
    let unix_seconds = time.timestamp() as Real + time.timestamp_subsec_nanos() as Real * 1e-9;
    let julian_day = unix_seconds / 86400.0 + 2440587.5;
    let jc = (julian_day - 2451545.0) / 36525.0;

    let mean_long = (280.46646 + jc * (36000.76983 + jc * 0.0003032)).rem_euclid(360.0);
    let mean_anom = 357.52911 + jc * (35999.05029 - 0.0001537 * jc);
    let ecc = 0.016708634 - jc * (0.000042037 + 0.0000001267 * jc);

    let m = mean_anom.to_radians();
    let center = m.sin() * (1.914602 - jc * (0.004817 + 0.000014 * jc))
        + (2.0 * m).sin() * (0.019993 - 0.000101 * jc)
        + (3.0 * m).sin() * 0.000289;
    let omega = (125.04 - 1934.136 * jc).to_radians();
    let apparent_long = (mean_long + center - 0.00569 - 0.00478 * omega.sin()).to_radians();

    let mean_obliq = 23.0 + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
    let obliq = (mean_obliq + 0.00256 * omega.cos()).to_radians();
    let declination = (obliq.sin() * apparent_long.sin()).asin();

    let l = mean_long.to_radians();
    let var_y = (obliq / 2.0).tan().powi(2);
    let eq_of_time = 4.0
        * (var_y * (2.0 * l).sin() - 2.0 * ecc * m.sin() + 4.0 * ecc * var_y * m.sin() * (2.0 * l).cos()
            - 0.5 * var_y * var_y * (4.0 * l).sin()
            - 1.25 * ecc * ecc * (2.0 * m).sin())
        .to_degrees();

    let minutes = time.num_seconds_from_midnight() as Real / 60.0 + time.nanosecond() as Real * 1e-9 / 60.0;
    let true_solar = (minutes + eq_of_time + 4.0 * longitude).rem_euclid(1440.0);
    // true_solar is wrapped into [0, 1440) minutes
    let hour_angle = (true_solar / 4.0 - 180.0).to_radians();

    let lat = latitude.to_radians();
    let cos_zenith = lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();
    let elevation = std::f64::consts::FRAC_PI_2 - cos_zenith.clamp(-1.0, 1.0).acos();
    let azimuth = (hour_angle
        .sin()
        .atan2(hour_angle.cos() * lat.sin() - declination.tan() * lat.cos())
        .to_degrees()
        + 180.0)
        .rem_euclid(360.0)
        .to_radians();

    SunPosition { elevation, azimuth }
}

/// Unit vector towards the sun in north-east-down coordinates
pub fn ned_from_sun(sun: &SunPosition) -> Vector3<Real> {
    Vector3::new(
        sun.azimuth.cos() * sun.elevation.cos(),
        sun.azimuth.sin() * sun.elevation.cos(),
        -sun.elevation.sin(),
    )
}

/// Rotate a body-frame vector into NED using the sensor's yaw/pitch/roll
pub fn sensor_orientation(pose: &DlsPose, body: Vector3<Real>) -> Vector3<Real> {
    let (s1, c1) = (-pose.yaw).sin_cos();
    let (s2, c2) = (-pose.pitch).sin_cos();
    let (s3, c3) = (-pose.roll).sin_cos();

    #[rustfmt::skip]
    let yaw = Matrix3::new(
        c1, s1, 0.0,
        -s1, c1, 0.0,
        0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let pitch = Matrix3::new(
        c2, 0.0, -s2,
        0.0, 1.0, 0.0,
        s2, 0.0, c2,
    );
    #[rustfmt::skip]
    let roll = Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, c3, s3,
        0.0, -s3, c3,
    );
    yaw * pitch * roll * body
}

/// Angle between the sensor normal and the sun vector, radians
pub fn sun_sensor_angle(sensor: &Vector3<Real>, sun: &Vector3<Real>) -> Real {
    let cos_angle = sensor.dot(sun) / (sensor.norm() * sun.norm());
    cos_angle.clamp(-1.0, 1.0).acos()
}

fn single_interface_transmission(phi: Real, n1: Real, n2: Real) -> Real {
    let f1 = phi.cos();
    let f2 = (1.0 - (n1 / n2 * phi.sin()).powi(2)).sqrt();
    let rs = ((n1 * f1 - n2 * f2) / (n1 * f1 + n2 * f2)).powi(2);
    let rp = ((n1 * f2 - n2 * f1) / (n1 * f2 + n2 * f1)).powi(2);
    let t = 1.0 - 0.5 * rs - 0.5 * rp;
    if t.is_nan() || !(0.0..=1.0).contains(&t) {
        0.0
    } else {
        t
    }
}

/// Unpolarized transmission through the diffuser stack at incidence `phi`
pub fn fresnel(phi: Real) -> Real {
    let mut transmission = 1.0;
    let mut phi_eff = phi;
    for pair in DIFFUSER_INDICES.windows(2) {
        let (n1, n2) = (pair[0], pair[1]);
        phi_eff = (phi_eff.sin() / n1).asin();
        transmission *= single_interface_transmission(phi_eff, n1, n2);
    }
    transmission
}

/// Geometry of one DLS reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DlsGeometry {
    pub sun: SunPosition,
    pub sun_vector: Vector3<Real>,
    pub sensor_vector: Vector3<Real>,
    pub sun_sensor_angle: Real,
}

impl DlsGeometry {
    pub fn compute(time: &DateTime<Utc>, position: &GeoPosition, pose: &DlsPose) -> Self {
        let sun = sun_position(time, position.latitude, position.longitude);
        let sun_vector = ned_from_sun(&sun);
        let sensor_vector = sensor_orientation(pose, Vector3::from(SENSOR_ORIENTATION));
        let angle = sun_sensor_angle(&sensor_vector, &sun_vector);
        log::debug!(
            "Sun elevation {:.4} rad, azimuth {:.4} rad, sun-sensor angle {:.4} rad",
            sun.elevation,
            sun.azimuth,
            angle
        );
        Self {
            sun,
            sun_vector,
            sensor_vector,
            sun_sensor_angle: angle,
        }
    }

    /// Horizontal ground irradiance from a raw (tilted) sensor reading
    pub fn ground_irradiance(&self, raw_irradiance: Real, sky: SkyCondition) -> CalResult<Real> {
        let transmission = fresnel(self.sun_sensor_angle);
        if transmission == 0.0 {
            return Err(CalError::DegenerateCalibration(format!(
                "no diffuser transmission at sun-sensor angle {:.4}",
                self.sun_sensor_angle
            )));
        }
        let diffuse = sky.diffuse_fraction();
        let sensor_irradiance = raw_irradiance / transmission;
        let direct = sensor_irradiance / (diffuse + self.sun_sensor_angle.cos());
        Ok(direct * (diffuse + self.sun.elevation.cos()))
    }
}

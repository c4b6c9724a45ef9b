//! WGS-84 → GCJ-02 datum conversion
//!
//! GPS receivers report WGS-84 coordinates, but Chinese mapping authorities
//! use the GCJ-02 datum ("Mars coordinates"), which obfuscates WGS-84 by a
//! non-linear offset of up to ~500 m. Positions that fall inside mainland
//! China must be converted before publication; everywhere else the
//! conversion is the identity.
//!
//! - [Algorithm background][1]
//!
//! [1]: https://en.wikipedia.org/wiki/Restrictions_on_geographic_data_in_China

use std::f64::consts::PI;

/// Semi-major axis of the Krasovsky 1940 ellipsoid.
const A: f64 = 6378245.0;

/// First eccentricity squared of the Krasovsky 1940 ellipsoid.
const EE: f64 = 0.00669342162296594323;

const CHINA_LON_MIN: f64 = 73.33;
const CHINA_LON_MAX: f64 = 135.05;
const CHINA_LAT_MIN: f64 = 3.51;
const CHINA_LAT_MAX: f64 = 53.33;

/// Converts a WGS-84 point to GCJ-02.
///
/// Returns `(latitude, longitude)`. Points outside the China bounding
/// rectangle (or non-finite inputs) are returned unchanged.
pub fn wgs84_to_gcj02(lat: f64, lon: f64) -> (f64, f64) {
    if out_of_china(lat, lon) {
        return (lat, lon);
    }

    let mut d_lat = transform_lat(lon - 105.0, lat - 35.0);
    let mut d_lon = transform_lon(lon - 105.0, lat - 35.0);
    let rad_lat = lat / 180.0 * PI;
    let magic = 1.0 - EE * rad_lat.sin() * rad_lat.sin();
    let sqrt_magic = magic.sqrt();
    d_lat = (d_lat * 180.0) / ((A * (1.0 - EE)) / (magic * sqrt_magic) * PI);
    d_lon = (d_lon * 180.0) / (A / sqrt_magic * rad_lat.cos() * PI);

    (lat + d_lat, lon + d_lon)
}

/// Whether a point falls outside the rectangle where the GCJ-02 offset
/// applies. Non-finite coordinates count as outside.
pub fn out_of_china(lat: f64, lon: f64) -> bool {
    if !lat.is_finite() || !lon.is_finite() {
        return true;
    }

    !(lon >= CHINA_LON_MIN && lon <= CHINA_LON_MAX && lat >= CHINA_LAT_MIN && lat <= CHINA_LAT_MAX)
}

fn transform_lat(x: f64, y: f64) -> f64 {
    let mut ret = -100.0 + 2.0 * x + 3.0 * y + 0.2 * y * y + 0.1 * x * y + 0.2 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (y * PI).sin() + 40.0 * (y / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (160.0 * (y / 12.0 * PI).sin() + 320.0 * (y * PI / 30.0).sin()) * 2.0 / 3.0;
    ret
}

fn transform_lon(x: f64, y: f64) -> f64 {
    let mut ret = 300.0 + x + 2.0 * y + 0.1 * x * x + 0.1 * x * y + 0.1 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (x * PI).sin() + 40.0 * (x / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (150.0 * (x / 12.0 * PI).sin() + 300.0 * (x / 30.0 * PI).sin()) * 2.0 / 3.0;
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_converts_beijing() {
        let (lat, lon) = wgs84_to_gcj02(39.90, 116.40);
        assert!((lat - 39.901404).abs() < 1e-5, "lat {lat}");
        assert!((lon - 116.406243).abs() < 1e-5, "lon {lon}");
    }

    #[test]
    fn it_bounds_the_offset() {
        for (lat, lon) in [(39.90, 116.40), (22.54, 114.06), (31.23, 121.47)] {
            let (out_lat, out_lon) = wgs84_to_gcj02(lat, lon);
            assert!((out_lat - lat).abs() < 0.01);
            assert!((out_lon - lon).abs() < 0.01);
        }
    }

    #[test]
    fn it_is_identity_outside_china() {
        assert_eq!(wgs84_to_gcj02(0.0, 0.0), (0.0, 0.0));
        assert_eq!(wgs84_to_gcj02(52.52, 13.40), (52.52, 13.40));
        assert_eq!(wgs84_to_gcj02(-22.0, 114.0), (-22.0, 114.0));
    }

    #[test]
    fn it_treats_non_finite_as_outside() {
        assert!(out_of_china(f64::NAN, 116.40));
        assert!(out_of_china(39.90, f64::INFINITY));
    }
}

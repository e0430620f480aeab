//! Utility functions for the helpbeacon-ble crate.

/// Mean Earth radius in meters used by [`haversine_distance_m`].
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters.
///
/// Uses the haversine formula with a spherical Earth of radius
/// [`EARTH_RADIUS_M`].
///
/// # Example
///
/// ```
/// use helpbeacon_ble::haversine_distance_m;
///
/// let d = haversine_distance_m(48.1351, 11.5820, 48.1355, 11.5824);
/// assert!(d > 50.0 && d < 60.0);
/// ```
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Turn a peripheral identifier into a backend record key.
///
/// Path-unsafe characters (`:` `.` `#` `$` `[` `]`) become `_`, and an empty
/// identifier maps to `"unknown"`.
///
/// # Example
///
/// ```
/// use helpbeacon_ble::sanitize_device_id;
///
/// assert_eq!(sanitize_device_id("AA:BB:CC"), "AA_BB_CC");
/// assert_eq!(sanitize_device_id(""), "unknown");
/// ```
pub fn sanitize_device_id(device_id: &str) -> String {
    if device_id.is_empty() {
        return "unknown".to_string();
    }

    device_id
        .chars()
        .map(|c| match c {
            ':' | '.' | '#' | '$' | '[' | ']' => '_',
            other => other,
        })
        .collect()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Great-circle distance between two node positions.

/// WGS-84 equatorial radius approximation, in meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Distance in meters between two lat/lon pairs, spherical law of cosines.
///
/// Returns 0.0 when any coordinate is absent. Callers only ask for a
/// distance once both pairs are known; the guard is duplicated here so a
/// missing coordinate can never produce a bogus movement figure.
pub fn distance(
    lat1: Option<f64>,
    lon1: Option<f64>,
    lat2: Option<f64>,
    lon2: Option<f64>,
) -> f64 {
    let (lat1, lon1, lat2, lon2) = match (lat1, lon1, lat2, lon2) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return 0.0,
    };

    let phi1 = (90.0 - lat1).to_radians();
    let phi2 = (90.0 - lat2).to_radians();
    let theta1 = lon1.to_radians();
    let theta2 = lon2.to_radians();

    let cos = phi1.sin() * phi2.sin() * (theta1 - theta2).cos() + phi1.cos() * phi2.cos();
    // Rounding can push identical points marginally past 1.0, which would
    // turn acos into NaN.
    let arc = cos.clamp(-1.0, 1.0).acos();

    arc * EARTH_RADIUS_M
}

//! Geodesic measurements for lines and areas.
//!
//! Lengths use the haversine formula on a sphere of the mean Earth radius.
//! Areas use the spherical-excess ring formula on the WGS84 equatorial
//! radius. Both are reported in kilometres (km²) rounded to two decimals.

use crate::error::SyncError;
use crate::model::ObjectKind;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;
/// WGS84 equatorial radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    #[must_use]
    pub fn from_pair(pair: [f64; 2]) -> Self {
        Self { lat: pair[0], lng: pair[1] }
    }

    #[must_use]
    pub fn to_pair(self) -> [f64; 2] {
        [self.lat, self.lng]
    }
}

/// Reject coordinates outside [-90, 90] × [-180, 180] or non-finite ones.
///
/// # Errors
///
/// `Validation` naming the offending coordinate.
pub fn validate(p: LatLng) -> Result<(), SyncError> {
    let ok = p.lat.is_finite() && p.lng.is_finite() && (-90.0..=90.0).contains(&p.lat) && (-180.0..=180.0).contains(&p.lng);
    if ok {
        Ok(())
    } else {
        Err(SyncError::validation(format!("coordinate out of range: [{}, {}]", p.lat, p.lng)))
    }
}

#[must_use]
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Great-circle distance in kilometres.
#[must_use]
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lng - a.lng).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Sum of segment lengths along an open path.
#[must_use]
pub fn path_length_km(path: &[[f64; 2]]) -> f64 {
    path.windows(2)
        .map(|w| haversine_km(LatLng::from_pair(w[0]), LatLng::from_pair(w[1])))
        .sum()
}

/// Length of the ring, including the closing segment back to the start.
#[must_use]
pub fn ring_perimeter_km(ring: &[[f64; 2]]) -> f64 {
    let ring = open_ring(ring);
    if ring.len() < 2 {
        return 0.0;
    }
    let closing = haversine_km(LatLng::from_pair(ring[ring.len() - 1]), LatLng::from_pair(ring[0]));
    path_length_km(ring) + closing
}

/// Enclosed area of a ring in km². Fewer than three distinct vertices
/// enclose nothing.
#[must_use]
pub fn ring_area_km2(ring: &[[f64; 2]]) -> f64 {
    let ring = open_ring(ring);
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let prev = ring[(i + n - 1) % n];
        let here = ring[i];
        let next = ring[(i + 1) % n];
        total += (next[1] - prev[1]).to_radians() * here[0].to_radians().sin();
    }
    let m2 = (total * EARTH_RADIUS_M * EARTH_RADIUS_M / 2.0).abs();
    m2 * 1e-6
}

/// Drop an explicit closing vertex equal to the first one.
fn open_ring(ring: &[[f64; 2]]) -> &[[f64; 2]] {
    match ring {
        [first, .., last] if first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// Rounded `(distance_km, area_km2)` for a finished shape. Lines and free
/// drawings measure length; areas measure perimeter and enclosed area;
/// markers measure nothing.
#[must_use]
pub fn metrics_for(kind: ObjectKind, path: &[[f64; 2]]) -> (f64, f64) {
    match kind {
        ObjectKind::Marker => (0.0, 0.0),
        ObjectKind::Line | ObjectKind::Draw => (round2(path_length_km(path)), 0.0),
        ObjectKind::Area => (round2(ring_perimeter_km(path)), round2(ring_area_km2(path))),
    }
}

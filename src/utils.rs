use itertools::Itertools;

use crate::LatLon;

pub const EARTH_RADIUS: f64 = 6371000.0; // unit: meter

// great-circle distance in meters
pub fn haversine_distance(a: LatLon, b: LatLon) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Closest point to `p` on the segment `a`-`b`, computed in plain lat/lon
/// space with the projection parameter clamped to [0, 1].
pub fn closest_point_on_segment(p: LatLon, a: LatLon, b: LatLon) -> LatLon {
    let d_lat = b.lat - a.lat;
    let d_lon = b.lon - a.lon;
    let len_sq = d_lat * d_lat + d_lon * d_lon;
    if len_sq <= 0.0 {
        return a;
    }
    let t = (((p.lat - a.lat) * d_lat + (p.lon - a.lon) * d_lon) / len_sq).clamp(0.0, 1.0);
    LatLon {
        lat: a.lat + t * d_lat,
        lon: a.lon + t * d_lon,
    }
}

/// Minimum distance in meters from `p` to a polyline. `None` when the
/// polyline has fewer than two points.
pub fn distance_to_polyline(p: LatLon, polyline: &[LatLon]) -> Option<f64> {
    if polyline.len() < 2 {
        return None;
    }
    polyline
        .iter()
        .tuple_windows()
        .map(|(a, b)| haversine_distance(p, closest_point_on_segment(p, *a, *b)))
        .min_by(|x, y| x.total_cmp(y))
}

pub fn format_distance(distance_m: u32) -> String {
    if distance_m >= 1000 {
        format!("{:.1} km", distance_m as f64 / 1000.0)
    } else {
        format!("{} m", distance_m)
    }
}

pub fn format_eta_minutes(eta_min: u32) -> String {
    if eta_min >= 60 {
        if eta_min % 60 == 0 {
            format!("{} h", eta_min / 60)
        } else {
            format!("{} h {} min", eta_min / 60, eta_min % 60)
        }
    } else {
        format!("{} min", eta_min)
    }
}

/// Truncates to at most `max_chars` characters and swaps double quotes for
/// single ones. The device has fixed-size buffers for every string field.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .map(|c| if c == '"' { '\'' } else { c })
        .collect()
}

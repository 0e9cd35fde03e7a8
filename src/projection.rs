//! Web Mercator projection onto the device screen, polyline simplification
//! and heading-up rotation. Everything here is pure.
use std::f64::consts::PI;

use crate::config::ScreenConfig;
use crate::LatLon;

/// Screen pixel, origin at the top-left corner, y pointing down.
pub type Pixel = (i32, i32);

fn mercator_y(lat: f64) -> f64 {
    -(PI / 4.0 + lat.to_radians() / 2.0).tan().ln()
}

/// Where the map is looked at from: the current position and zoom. The
/// position always lands on the screen's marker anchor.
#[derive(Clone, Debug)]
pub struct Viewport<'a> {
    pub center: LatLon,
    pub zoom: f64,
    pub screen: &'a ScreenConfig,
}

impl<'a> Viewport<'a> {
    pub fn new(center: LatLon, zoom: f64, screen: &'a ScreenConfig) -> Self {
        Viewport {
            center,
            zoom,
            screen,
        }
    }

    pub fn project(&self, point: LatLon) -> Pixel {
        project(
            point.lat,
            point.lon,
            self.center.lat,
            self.center.lon,
            self.zoom,
            self.screen,
        )
    }

    pub fn project_all(&self, points: &[LatLon]) -> Vec<Pixel> {
        points.iter().map(|p| self.project(*p)).collect()
    }
}

// https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames
pub fn project(
    lat: f64,
    lon: f64,
    center_lat: f64,
    center_lon: f64,
    zoom: f64,
    screen: &ScreenConfig,
) -> Pixel {
    let scale = 256.0 * f64::powf(2.0, zoom) / (2.0 * PI);
    let dx = (lon - center_lon).to_radians() * scale;
    let dy = (mercator_y(lat) - mercator_y(center_lat)) * scale;
    let (marker_x, marker_y) = screen.marker();
    (
        (marker_x as f64 + dx).round() as i32,
        (marker_y as f64 + dy).round() as i32,
    )
}

fn perpendicular_distance(p: Pixel, a: Pixel, b: Pixel) -> f64 {
    let dx = (b.0 - a.0) as f64;
    let dy = (b.1 - a.1) as f64;
    let px = (p.0 - a.0) as f64;
    let py = (p.1 - a.1) as f64;
    if dx == 0.0 && dy == 0.0 {
        return px.hypot(py);
    }
    let t = (px * dx + py * dy) / (dx * dx + dy * dy);
    (px - t * dx).hypot(py - t * dy)
}

/// Ramer-Douglas-Peucker. Walks an explicit stack of ranges instead of
/// recursing; the kept points are the same as the recursive formulation
/// (first index wins on equal distances).
pub fn simplify(points: &[Pixel], epsilon: f64) -> Vec<Pixel> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut ranges = vec![(0, points.len() - 1)];
    while let Some((first, last)) = ranges.pop() {
        let mut max_dist = 0.0;
        let mut max_idx = first;
        for (i, p) in points.iter().enumerate().take(last).skip(first + 1) {
            let d = perpendicular_distance(*p, points[first], points[last]);
            if d > max_dist {
                max_dist = d;
                max_idx = i;
            }
        }
        if max_dist > epsilon {
            keep[max_idx] = true;
            ranges.push((max_idx, last));
            ranges.push((first, max_idx));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

/// Rotates by `-bearing_deg` around the pivot so that the direction of
/// travel points to the top of the screen.
pub fn rotate(points: &[Pixel], bearing_deg: f64, pivot: Pixel) -> Vec<Pixel> {
    let (sin, cos) = (-bearing_deg).to_radians().sin_cos();
    points
        .iter()
        .map(|&(x, y)| {
            let dx = (x - pivot.0) as f64;
            let dy = (y - pivot.1) as f64;
            (
                (pivot.0 as f64 + dx * cos - dy * sin).round() as i32,
                (pivot.1 as f64 + dx * sin + dy * cos).round() as i32,
            )
        })
        .collect()
}

use std::collections::HashSet;

use crate::config::ScreenConfig;
use crate::projection::{self, Pixel, Viewport};
use crate::protocol::{DeviceMessage, RoadPath, StreetLabel, VectorFrame, HEADING_UNKNOWN};
use crate::utils::sanitize;
use crate::LatLon;

/// A road already in screen space for the current frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedRoad {
    pub path: Vec<Pixel>,
    pub width: u8,
    pub name: Option<String>,
}

/// Serializes one frame. Same input, same bytes.
pub fn encode_frame(
    roads: &[ProjectedRoad],
    route: &[Pixel],
    labels: &[StreetLabel],
    position: Pixel,
    heading: i32,
) -> String {
    DeviceMessage::VectorFrame(VectorFrame {
        roads: roads
            .iter()
            .map(|r| RoadPath {
                path: r.path.clone(),
                width: r.width,
            })
            .collect(),
        route: route.to_vec(),
        labels: labels.to_vec(),
        position,
        heading,
    })
    .to_json()
}

/// Picks street labels: widest roads first (stable among equal widths), one
/// per name, anchored at the middle vertex and only when that vertex is on
/// screen.
pub fn select_labels(roads: &[ProjectedRoad], screen: &ScreenConfig) -> Vec<StreetLabel> {
    let mut candidates: Vec<(&ProjectedRoad, &str)> = roads
        .iter()
        .filter_map(|r| match r.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some((r, name)),
            _ => None,
        })
        .collect();
    candidates.sort_by(|a, b| b.0.width.cmp(&a.0.width));

    let mut seen = HashSet::new();
    let mut labels = Vec::new();
    for (road, name) in candidates {
        if labels.len() >= screen.max_labels {
            break;
        }
        if seen.contains(name) {
            continue;
        }
        let Some(&mid) = road.path.get(road.path.len() / 2) else {
            continue;
        };
        if screen.in_label_bounds(mid) {
            seen.insert(name);
            labels.push(StreetLabel {
                pos: mid,
                name: sanitize(name, screen.max_label_chars),
            });
        }
    }
    labels
}

pub fn project_route(route: &[LatLon], viewport: &Viewport, epsilon: f64) -> Vec<Pixel> {
    projection::simplify(&viewport.project_all(route), epsilon)
}

/// Turns projected roads and route into the frame the device draws: rotated
/// heading-up when a bearing is known, north-up otherwise.
pub fn build_frame(
    roads: Vec<ProjectedRoad>,
    route: Vec<Pixel>,
    bearing: Option<f64>,
    screen: &ScreenConfig,
) -> VectorFrame {
    let marker = screen.marker();
    let (roads, route, heading) = match bearing {
        Some(bearing) if bearing.is_finite() && bearing >= 0.0 => {
            let roads: Vec<ProjectedRoad> = roads
                .into_iter()
                .map(|r| ProjectedRoad {
                    path: projection::rotate(&r.path, bearing, marker),
                    ..r
                })
                .collect();
            let route = projection::rotate(&route, bearing, marker);
            (roads, route, (bearing as i32).rem_euclid(360))
        }
        _ => (roads, route, HEADING_UNKNOWN),
    };

    let labels = select_labels(&roads, screen);
    VectorFrame {
        roads: roads
            .into_iter()
            .map(|r| RoadPath {
                path: r.path,
                width: r.width,
            })
            .collect(),
        route,
        labels,
        position: marker,
        heading,
    }
}

use std::sync::{Arc, RwLock};

use crate::config::ScreenConfig;
use crate::frame::ProjectedRoad;
use crate::overpass::{RawRoadSegment, RoadSource};
use crate::projection::{self, Viewport};
use crate::utils::haversine_distance;
use crate::LatLon;

/// One fetch worth of streets and where it was fetched around.
#[derive(Debug, Default)]
pub struct RoadBatch {
    pub segments: Vec<RawRoadSegment>,
    pub query_point: Option<LatLon>,
}

/// Streets around the last query point. Readers always see a whole batch:
/// a refresh builds the new batch aside and swaps it in.
pub struct RoadCache {
    refresh_distance_m: f64,
    query_radius_m: f64,
    batch: RwLock<Arc<RoadBatch>>,
}

impl RoadCache {
    pub fn new(refresh_distance_m: f64, query_radius_m: f64) -> Self {
        RoadCache {
            refresh_distance_m,
            query_radius_m,
            batch: RwLock::new(Arc::new(RoadBatch::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RoadBatch> {
        self.batch.read().unwrap().clone()
    }

    /// Distance moved is the only staleness signal; a device standing still
    /// never re-queries.
    pub fn needs_refresh(&self, position: LatLon) -> bool {
        match self.snapshot().query_point {
            None => true,
            Some(query_point) => haversine_distance(query_point, position) > self.refresh_distance_m,
        }
    }

    /// Returns whether the cache was replaced. Failures leave the current
    /// batch in place.
    pub async fn refresh(&self, source: &dyn RoadSource, center: LatLon) -> bool {
        match source.fetch_nearby(center, self.query_radius_m).await {
            Ok(segments) => {
                info!(
                    "road cache refreshed around {:.5},{:.5}: {} segments",
                    center.lat,
                    center.lon,
                    segments.len()
                );
                self.replace(segments, center);
                true
            }
            Err(e) => {
                warn!("road refresh failed, keeping cached roads: {:?}", e);
                false
            }
        }
    }

    pub fn replace(&self, segments: Vec<RawRoadSegment>, query_point: LatLon) {
        let batch = Arc::new(RoadBatch {
            segments,
            query_point: Some(query_point),
        });
        *self.batch.write().unwrap() = batch;
    }

    /// Projects, culls and simplifies the cached streets for one frame.
    pub fn get_projected(&self, zoom: f64, center: LatLon, screen: &ScreenConfig) -> Vec<ProjectedRoad> {
        let batch = self.snapshot();
        let viewport = Viewport::new(center, zoom, screen);
        batch
            .segments
            .iter()
            .filter_map(|segment| {
                let pixels = viewport.project_all(&segment.points);
                if !pixels.iter().any(|p| screen.in_cull_bounds(*p)) {
                    return None;
                }
                let path = projection::simplify(&pixels, screen.simplify_epsilon);
                if path.len() < 2 {
                    return None;
                }
                Some(ProjectedRoad {
                    path,
                    width: segment.width,
                    name: segment.name.clone(),
                })
            })
            .collect()
    }
}

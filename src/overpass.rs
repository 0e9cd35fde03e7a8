//! Nearby street geometry from an Overpass API endpoint.
use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::config::NavConfig;
use crate::network::{NetworkHandle, UplinkClient};
use crate::LatLon;

pub const ROAD_CATEGORIES: [&str; 7] = [
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "residential",
    "service",
];

/// A street as fetched, before any projection.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRoadSegment {
    pub points: Vec<LatLon>,
    pub width: u8,
    pub name: Option<String>,
}

pub fn width_for_category(highway: &str) -> u8 {
    match highway {
        "motorway" | "trunk" => 3,
        "primary" | "secondary" => 2,
        _ => 1,
    }
}

/// Where the road cache gets its streets from.
pub trait RoadSource: Send + Sync {
    fn fetch_nearby(&self, center: LatLon, radius_m: f64)
        -> BoxFuture<'_, Result<Vec<RawRoadSegment>>>;

    fn set_uplink(&self, _uplink: Option<&NetworkHandle>) {}
}

pub fn build_query(center: LatLon, radius_m: f64) -> String {
    format!(
        "[out:json][timeout:10];(way[\"highway\"~\"^({})$\"](around:{},{:.5},{:.5}););out geom qt;",
        ROAD_CATEGORIES.join("|"),
        radius_m.round() as i64,
        center.lat,
        center.lon
    )
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Deserialize)]
struct Element {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    geometry: Vec<GeometryNode>,
    #[serde(default)]
    tags: Tags,
}

#[derive(Deserialize)]
struct GeometryNode {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize, Default)]
struct Tags {
    highway: Option<String>,
    name: Option<String>,
}

/// Ways with fewer than two nodes and non-way elements are skipped.
pub fn parse_response(body: &str) -> Result<Vec<RawRoadSegment>> {
    let response: OverpassResponse =
        serde_json::from_str(body).context("malformed Overpass response")?;
    Ok(response
        .elements
        .into_iter()
        .filter(|e| e.kind == "way" && e.geometry.len() >= 2)
        .map(|e| RawRoadSegment {
            points: e
                .geometry
                .iter()
                .map(|n| LatLon::new(n.lat, n.lon))
                .collect(),
            width: width_for_category(e.tags.highway.as_deref().unwrap_or_default()),
            name: e.tags.name.filter(|n| !n.trim().is_empty()),
        })
        .collect())
}

pub struct OverpassClient {
    endpoint: String,
    http: UplinkClient,
}

impl OverpassClient {
    pub fn new(config: &NavConfig) -> Result<Self> {
        Ok(OverpassClient {
            endpoint: config.overpass_url.clone(),
            http: UplinkClient::new(config)?,
        })
    }

    async fn fetch(&self, center: LatLon, radius_m: f64) -> Result<Vec<RawRoadSegment>> {
        let query = build_query(center, radius_m);
        let response = self
            .http
            .client()
            .post(&self.endpoint)
            .form(&[("data", query.as_str())])
            .send()
            .await
            .context("Overpass request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Overpass returned {}", status);
        }
        let body = response.text().await?;
        let roads = parse_response(&body)?;
        debug!("fetched {} roads around {:?}", roads.len(), center);
        Ok(roads)
    }
}

impl RoadSource for OverpassClient {
    fn fetch_nearby(
        &self,
        center: LatLon,
        radius_m: f64,
    ) -> BoxFuture<'_, Result<Vec<RawRoadSegment>>> {
        Box::pin(self.fetch(center, radius_m))
    }

    fn set_uplink(&self, uplink: Option<&NetworkHandle>) {
        self.http.set_uplink(uplink);
    }
}

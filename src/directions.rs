//! Client for the geocoding/routing backend.
//!
//! Both calls fail soft: `suggest` returns an empty list and `route` returns
//! `None` on any transport error, non-success status or malformed payload.
//! The reason is logged, never returned.
use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::NavConfig;
use crate::network::{NetworkHandle, UplinkClient};
use crate::polyline;
use crate::LatLon;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeocodeSuggestion {
    pub label: String,
    pub lat: f64,
    pub lon: f64,
}

impl GeocodeSuggestion {
    pub fn lat_lon(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteStep {
    pub instruction: String,
    pub distance_m: u32,
    // where this step becomes the current one
    pub anchor: LatLon,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub steps: Vec<RouteStep>,
    pub distance_m: u32,
    pub duration_s: u32,
    pub geometry: Vec<LatLon>,
}

impl Route {
    pub fn eta_min(&self) -> u32 {
        self.duration_s / 60
    }

    pub fn destination(&self) -> Option<LatLon> {
        self.geometry.last().copied()
    }
}

pub trait Directions: Send + Sync {
    fn suggest<'a>(
        &'a self,
        query: &'a str,
        origin: Option<LatLon>,
    ) -> BoxFuture<'a, Vec<GeocodeSuggestion>>;

    fn route(&self, from: LatLon, to: LatLon) -> BoxFuture<'_, Option<Route>>;

    fn set_uplink(&self, _uplink: Option<&NetworkHandle>) {}
}

#[derive(Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    hits: Vec<GeocodeSuggestion>,
}

fn default_multiplier() -> f64 {
    1e6
}

fn default_elevation() -> bool {
    true
}

#[derive(Deserialize)]
struct RouteResponse {
    distance: f64,
    // milliseconds
    time: f64,
    points: String,
    #[serde(default = "default_multiplier")]
    points_encoded_multiplier: f64,
    #[serde(default = "default_elevation")]
    elevation: bool,
    #[serde(default)]
    instructions: Vec<Instruction>,
}

#[derive(Deserialize)]
struct Instruction {
    text: String,
    distance: f64,
    interval: (usize, usize),
}

pub fn parse_geocode(body: &str) -> Result<Vec<GeocodeSuggestion>> {
    let response: GeocodeResponse =
        serde_json::from_str(body).context("malformed geocode response")?;
    Ok(response.hits)
}

pub fn parse_route(body: &str) -> Result<Route> {
    let response: RouteResponse = serde_json::from_str(body).context("malformed route response")?;
    let geometry = polyline::decode(
        &response.points,
        response.points_encoded_multiplier,
        response.elevation,
    )?;
    if geometry.len() < 2 {
        bail!("route geometry has {} points", geometry.len());
    }
    let steps = response
        .instructions
        .into_iter()
        .map(|instruction| {
            let start = instruction.interval.0;
            // an index past the end anchors the step at the destination
            let anchor = geometry
                .get(start)
                .or_else(|| geometry.last())
                .copied()
                .unwrap_or(LatLon::new(0.0, 0.0));
            RouteStep {
                instruction: instruction.text,
                distance_m: instruction.distance.max(0.0).round() as u32,
                anchor,
            }
        })
        .collect();
    Ok(Route {
        steps,
        distance_m: response.distance.max(0.0).round() as u32,
        duration_s: (response.time.max(0.0) / 1000.0) as u32,
        geometry,
    })
}

pub struct RouteClient {
    base_url: String,
    http: UplinkClient,
}

impl RouteClient {
    pub fn new(config: &NavConfig) -> Result<Self> {
        Ok(RouteClient {
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            http: UplinkClient::new(config)?,
        })
    }

    async fn fetch_suggestions(
        &self,
        query: &str,
        origin: Option<LatLon>,
    ) -> Result<Vec<GeocodeSuggestion>> {
        let mut params = vec![("q", query.to_string())];
        if let Some(origin) = origin {
            params.push(("lat", origin.lat.to_string()));
            params.push(("lon", origin.lon.to_string()));
        }
        let response = self
            .http
            .client()
            .get(format!("{}/geocode", self.base_url))
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("geocode returned {}", status);
        }
        parse_geocode(&response.text().await?)
    }

    async fn fetch_route(&self, from: LatLon, to: LatLon) -> Result<Route> {
        let body = json!({
            "from": [from.lon, from.lat],
            "to": [to.lon, to.lat],
            "profile": "car",
        });
        let response = self
            .http
            .client()
            .post(format!("{}/route", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("route returned {}", status);
        }
        parse_route(&response.text().await?)
    }
}

impl Directions for RouteClient {
    fn suggest<'a>(
        &'a self,
        query: &'a str,
        origin: Option<LatLon>,
    ) -> BoxFuture<'a, Vec<GeocodeSuggestion>> {
        Box::pin(async move {
            let query = query.trim();
            if query.is_empty() {
                return Vec::new();
            }
            match self.fetch_suggestions(query, origin).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("geocode for {:?} failed: {:?}", query, e);
                    Vec::new()
                }
            }
        })
    }

    fn route(&self, from: LatLon, to: LatLon) -> BoxFuture<'_, Option<Route>> {
        Box::pin(async move {
            match self.fetch_route(from, to).await {
                Ok(route) => {
                    info!(
                        "route: {} m, {} s, {} steps",
                        route.distance_m,
                        route.duration_s,
                        route.steps.len()
                    );
                    Some(route)
                }
                Err(e) => {
                    warn!("routing failed: {:?}", e);
                    None
                }
            }
        })
    }

    fn set_uplink(&self, uplink: Option<&NetworkHandle>) {
        self.http.set_uplink(uplink);
    }
}

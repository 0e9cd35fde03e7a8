use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const MIN_ZOOM: u8 = 10;
pub const MAX_ZOOM: u8 = 19;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub width: i32,
    pub height: i32,
    // how far the frame keeps geometry around before culling it
    pub cull_margin: i32,
    pub label_margin: i32,
    pub simplify_epsilon: f64,
    pub max_labels: usize,
    pub max_label_chars: usize,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 480,
            cull_margin: 60,
            label_margin: 10,
            simplify_epsilon: 1.5,
            max_labels: 20,
            max_label_chars: 20,
        }
    }
}

impl ScreenConfig {
    /// The user marker is pinned here: horizontally centered, 3/4 of the way down.
    pub fn marker(&self) -> (i32, i32) {
        (self.width / 2, self.height * 3 / 4)
    }

    pub fn in_cull_bounds(&self, (x, y): (i32, i32)) -> bool {
        let m = self.cull_margin;
        (-m..=self.width + m).contains(&x) && (-m..=self.height + m).contains(&y)
    }

    pub fn in_label_bounds(&self, (x, y): (i32, i32)) -> bool {
        let m = self.label_margin;
        (-m..=self.width + m).contains(&x) && (-m..=self.height + m).contains(&y)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub screen: ScreenConfig,
    pub default_zoom: u8,
    pub frame_interval_ms: u64,

    pub road_refresh_distance_m: f64,
    pub road_query_radius_m: f64,

    pub arrival_radius_m: f64,
    pub off_route_tolerance_m: f64,
    pub recalc_cooldown_ms: u64,
    pub arrived_clear_delay_ms: u64,

    pub transport_retry_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_step_ms: u64,
    pub reconnect_max_ms: u64,
    pub device_connect_timeout_ms: u64,
    pub outbound_queue: usize,

    pub http_connect_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub user_agent: String,

    pub backend_url: String,
    pub overpass_url: String,
    pub device_url: String,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            screen: ScreenConfig::default(),
            default_zoom: 17,
            frame_interval_ms: 500,
            road_refresh_distance_m: 150.0,
            road_query_radius_m: 500.0,
            arrival_radius_m: 30.0,
            off_route_tolerance_m: 100.0,
            recalc_cooldown_ms: 60_000,
            arrived_clear_delay_ms: 6_000,
            transport_retry_ms: 5_000,
            reconnect_initial_ms: 5_000,
            reconnect_step_ms: 5_000,
            reconnect_max_ms: 15_000,
            device_connect_timeout_ms: 10_000,
            outbound_queue: 16,
            http_connect_timeout_ms: 10_000,
            http_timeout_ms: 15_000,
            user_agent: "ESP32Nav/1.0".to_string(),
            backend_url: "https://maps.tomasschuster.com".to_string(),
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            device_url: "ws://192.168.4.1:8080/ws".to_string(),
        }
    }
}

impl NavConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NavConfig = serde_json::from_str(json).context("invalid config json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.screen;
        if s.width <= 0 || s.height <= 0 {
            bail!("screen size must be positive: {}x{}", s.width, s.height);
        }
        if s.cull_margin < 0 || s.label_margin < 0 || s.simplify_epsilon < 0.0 {
            bail!("screen margins and simplify epsilon must not be negative");
        }
        if !(MIN_ZOOM..=MAX_ZOOM).contains(&self.default_zoom) {
            bail!(
                "default_zoom {} is outside {}..={}",
                self.default_zoom,
                MIN_ZOOM,
                MAX_ZOOM
            );
        }
        if self.frame_interval_ms == 0 {
            bail!("frame_interval_ms must be positive");
        }
        for (name, value) in [
            ("road_refresh_distance_m", self.road_refresh_distance_m),
            ("road_query_radius_m", self.road_query_radius_m),
            ("arrival_radius_m", self.arrival_radius_m),
            ("off_route_tolerance_m", self.off_route_tolerance_m),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{} must be a positive distance, got {}", name, value);
            }
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            bail!(
                "reconnect backoff must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect_initial_ms,
                self.reconnect_max_ms
            );
        }
        if self.outbound_queue == 0 {
            bail!("outbound_queue must hold at least one message");
        }
        for url in [&self.backend_url, &self.overpass_url] {
            reqwest::Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
        }
        let device_url =
            reqwest::Url::parse(&self.device_url).context("invalid device websocket url")?;
        if device_url.scheme() != "ws" || device_url.host_str().is_none() {
            bail!("device_url must be a ws:// url, got {}", self.device_url);
        }
        Ok(())
    }

    pub fn clamp_zoom(zoom: i32) -> u8 {
        zoom.clamp(MIN_ZOOM as i32, MAX_ZOOM as i32) as u8
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn recalc_cooldown(&self) -> Duration {
        Duration::from_millis(self.recalc_cooldown_ms)
    }

    pub fn arrived_clear_delay(&self) -> Duration {
        Duration::from_millis(self.arrived_clear_delay_ms)
    }

    pub fn transport_retry(&self) -> Duration {
        Duration::from_millis(self.transport_retry_ms)
    }

    pub fn device_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.device_connect_timeout_ms)
    }

    /// Delays between silent reconnection attempts: initial, then growing by
    /// one step per attempt until the ceiling.
    pub fn reconnect_delays(&self) -> impl Iterator<Item = Duration> {
        let step = self.reconnect_step_ms;
        let max = self.reconnect_max_ms;
        std::iter::successors(Some(self.reconnect_initial_ms), move |d| {
            Some((d + step).min(max))
        })
        .map(Duration::from_millis)
    }
}

//! Messages sent to the display device. One JSON object per WebSocket text
//! message, discriminated by `type`. String fields are capped because the
//! device copies them into fixed-size buffers.
use serde::Serialize;

use crate::projection::Pixel;
use crate::utils::{format_distance, format_eta_minutes, sanitize};
use crate::Position;

pub const NOTIF_APP_CHARS: usize = 24;
pub const NOTIF_TITLE_CHARS: usize = 32;
pub const NOTIF_TEXT_CHARS: usize = 60;
pub const MEDIA_APP_CHARS: usize = 24;
pub const MEDIA_TITLE_CHARS: usize = 48;
pub const MEDIA_ARTIST_CHARS: usize = 32;

pub const HEADING_UNKNOWN: i32 = -1;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeviceMessage {
    Gps(GpsUpdate),
    Nav(NavStatus),
    VectorFrame(VectorFrame),
    Notif(Notification),
    Media(MediaState),
}

impl DeviceMessage {
    pub fn to_json(&self) -> String {
        // every field is a plain number, string or array of those
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GpsUpdate {
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "speedKmh")]
    pub speed_kmh: i32,
}

impl GpsUpdate {
    pub fn from_position(position: &Position) -> Self {
        let round6 = |v: f64| (v * 1e6).round() / 1e6;
        GpsUpdate {
            lat: round6(position.latitude),
            lon: round6(position.longitude),
            speed_kmh: position.speed_kmh(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NavStatus {
    pub step: String,
    pub dist: String,
    pub eta: String,
}

impl NavStatus {
    pub fn new(instruction: &str, distance_m: u32, eta_min: u32) -> Self {
        NavStatus {
            step: instruction.replace('"', "'"),
            dist: format_distance(distance_m),
            eta: format_eta_minutes(eta_min),
        }
    }

    pub fn arrived() -> Self {
        Self::new("You have arrived", 0, 0)
    }

    pub fn no_navigation() -> Self {
        Self::new("No navigation", 0, 0)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RoadPath {
    pub path: Vec<Pixel>,
    pub width: u8,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StreetLabel {
    pub pos: Pixel,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VectorFrame {
    pub roads: Vec<RoadPath>,
    pub route: Vec<Pixel>,
    pub labels: Vec<StreetLabel>,
    pub position: Pixel,
    pub heading: i32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub app: String,
    pub title: String,
    pub text: String,
}

impl Notification {
    pub fn new(app: &str, title: &str, text: &str) -> Self {
        Notification {
            app: sanitize(app, NOTIF_APP_CHARS),
            title: sanitize(title, NOTIF_TITLE_CHARS),
            text: sanitize(text, NOTIF_TEXT_CHARS),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MediaState {
    pub app: String,
    pub title: String,
    pub artist: String,
    pub playing: bool,
    pub vol: u8,
}

impl MediaState {
    pub fn new(app: &str, title: &str, artist: &str, playing: bool, vol: i32) -> Self {
        MediaState {
            app: sanitize(app, MEDIA_APP_CHARS),
            title: sanitize(title, MEDIA_TITLE_CHARS),
            artist: sanitize(artist, MEDIA_ARTIST_CHARS),
            playing,
            vol: vol.clamp(0, 100) as u8,
        }
    }
}

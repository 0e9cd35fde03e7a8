#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod config;
pub mod directions;
pub mod frame;
pub mod logs;
pub mod navigation;
pub mod network;
pub mod overpass;
pub mod polyline;
mod position;
pub mod projection;
pub mod protocol;
pub mod road_cache;
pub mod session;
pub mod trace_recorder;
pub mod transport;
pub mod utils;

pub use position::{LatLon, Position};

//! GraphHopper flavour of the encoded polyline format: zig-zag signed deltas
//! in 5-bit chunks offset by 63, with a configurable multiplier and an
//! optional third (elevation) value per point.
use anyhow::Result;

use crate::LatLon;

fn read_value(bytes: &[u8], index: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let Some(&c) = bytes.get(*index) else {
            bail!("truncated polyline at byte {}", *index);
        };
        *index += 1;
        if !(63..=126).contains(&c) {
            bail!("invalid polyline character {:?}", c as char);
        }
        if shift > 60 {
            bail!("polyline value too long");
        }
        let b = (c - 63) as i64;
        result |= (b & 0x1f) << shift;
        shift += 5;
        if b < 0x20 {
            break;
        }
    }
    Ok(if result & 1 != 0 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

pub fn decode(encoded: &str, multiplier: f64, with_elevation: bool) -> Result<Vec<LatLon>> {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        bail!("invalid polyline multiplier {}", multiplier);
    }
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;
    let mut points = Vec::new();
    while index < bytes.len() {
        lat += read_value(bytes, &mut index)?;
        lon += read_value(bytes, &mut index)?;
        if with_elevation {
            // elevation is not used, but has to be consumed
            read_value(bytes, &mut index)?;
        }
        points.push(LatLon {
            lat: lat as f64 / multiplier,
            lon: lon as f64 / multiplier,
        });
    }
    Ok(points)
}

fn write_value(value: i64, out: &mut String) {
    let mut v = if value < 0 { !(value << 1) } else { value << 1 };
    while v >= 0x20 {
        out.push((((v & 0x1f) | 0x20) as u8 + 63) as char);
        v >>= 5;
    }
    out.push((v as u8 + 63) as char);
}

/// Inverse of [`decode`]. Elevations, when given, must match `points` in length.
pub fn encode(points: &[LatLon], elevations: Option<&[f64]>, multiplier: f64) -> String {
    let mut out = String::new();
    let (mut prev_lat, mut prev_lon, mut prev_ele) = (0i64, 0i64, 0i64);
    for (i, p) in points.iter().enumerate() {
        let lat = (p.lat * multiplier).round() as i64;
        let lon = (p.lon * multiplier).round() as i64;
        write_value(lat - prev_lat, &mut out);
        write_value(lon - prev_lon, &mut out);
        (prev_lat, prev_lon) = (lat, lon);
        if let Some(elevations) = elevations {
            // GraphHopper stores elevation with a fixed factor of 100
            let ele = (elevations.get(i).copied().unwrap_or(0.0) * 100.0).round() as i64;
            write_value(ele - prev_ele, &mut out);
            prev_ele = ele;
        }
    }
    out
}

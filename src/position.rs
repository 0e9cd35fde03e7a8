use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        LatLon { lat, lon }
    }
}

/// One fix from the phone's location provider.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f32>,
    // m/s
    pub speed: Option<f32>,
    // degrees clockwise from north, `None` when unknown
    pub bearing: Option<f32>,
    pub timestamp_ms: Option<i64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Position {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
            bearing: None,
            timestamp_ms: None,
        }
    }

    pub fn with_bearing(mut self, bearing: f32) -> Self {
        self.bearing = Some(bearing);
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn lat_lon(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }

    pub fn speed_kmh(&self) -> i32 {
        self.speed.map(|s| (s * 3.6) as i32).unwrap_or(0)
    }

    /// Integer heading for the wire: 0..=359, or -1 when the bearing is unknown.
    pub fn heading(&self) -> i32 {
        match self.bearing {
            Some(b) if b.is_finite() && b >= 0.0 => (b as i32).rem_euclid(360),
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Position;

    #[test]
    fn heading() {
        assert_eq!(Position::new(0.0, 0.0).heading(), -1);
        assert_eq!(Position::new(0.0, 0.0).with_bearing(90.7).heading(), 90);
        assert_eq!(Position::new(0.0, 0.0).with_bearing(360.0).heading(), 0);
        assert_eq!(Position::new(0.0, 0.0).with_bearing(-1.0).heading(), -1);
    }

    #[test]
    fn speed_kmh() {
        assert_eq!(Position::new(0.0, 0.0).speed_kmh(), 0);
        assert_eq!(Position::new(0.0, 0.0).with_speed(10.0).speed_kmh(), 36);
        assert_eq!(Position::new(0.0, 0.0).with_speed(0.6028665).speed_kmh(), 2);
    }
}

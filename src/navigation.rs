//! Progress along one route: which step is current, arrival, and whether the
//! position has left the route. No I/O and no clock of its own; callers pass
//! the time in.
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::directions::{Route, RouteStep};
use crate::utils::{distance_to_polyline, haversine_distance};
use crate::LatLon;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepEvent {
    Advanced(usize),
    Arrived,
}

#[derive(Clone, Debug)]
pub struct RouteProgress {
    route: Arc<Route>,
    step_index: usize,
    arrival_radius_m: f64,
    off_route_tolerance_m: f64,
    recalc_cooldown: Duration,
    last_recalculation: Option<Instant>,
}

impl RouteProgress {
    pub fn new(
        route: Arc<Route>,
        arrival_radius_m: f64,
        off_route_tolerance_m: f64,
        recalc_cooldown: Duration,
    ) -> Self {
        RouteProgress {
            route,
            step_index: 0,
            arrival_radius_m,
            off_route_tolerance_m,
            recalc_cooldown,
            last_recalculation: None,
        }
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn current_step(&self) -> Option<&RouteStep> {
        self.route.steps.get(self.step_index)
    }

    pub fn is_arrived(&self) -> bool {
        self.step_index >= self.route.steps.len()
    }

    /// Moves to the next step once within the arrival radius of the current
    /// step's anchor. At most one step per call, never past the end.
    pub fn advance(&mut self, position: LatLon) -> Option<StepEvent> {
        let step = self.current_step()?;
        if haversine_distance(position, step.anchor) > self.arrival_radius_m {
            return None;
        }
        self.step_index += 1;
        if self.is_arrived() {
            Some(StepEvent::Arrived)
        } else {
            Some(StepEvent::Advanced(self.step_index))
        }
    }

    /// True when a recalculation should start now: the position is farther
    /// than the tolerance from every route segment, none is in flight and the
    /// cooldown since the last one has passed. A `true` result starts a new
    /// cooldown.
    pub fn check_off_route(
        &mut self,
        position: LatLon,
        now: Instant,
        recalculation_in_flight: bool,
    ) -> bool {
        if recalculation_in_flight || self.is_arrived() {
            return false;
        }
        if let Some(last) = self.last_recalculation {
            if now.saturating_duration_since(last) < self.recalc_cooldown {
                return false;
            }
        }
        let Some(distance) = distance_to_polyline(position, &self.route.geometry) else {
            return false;
        };
        if distance <= self.off_route_tolerance_m {
            return false;
        }
        info!("off route by {:.0} m", distance);
        self.last_recalculation = Some(now);
        true
    }

    /// Swaps in a recalculated route. The cooldown carries over.
    pub fn replace_route(&mut self, route: Arc<Route>) {
        self.route = route;
        self.step_index = 0;
    }
}

//! The navigation session: one task owns the position, the route and the
//! device link, takes every input from its command channel, and publishes an
//! immutable snapshot after each change. Network work runs in spawned tasks
//! that report back through the same loop.
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use strum_macros::{Display, EnumIter};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::{NavConfig, ScreenConfig};
use crate::directions::{Directions, GeocodeSuggestion, Route, RouteClient};
use crate::frame::{build_frame, project_route};
use crate::navigation::{RouteProgress, StepEvent};
use crate::network::NetworkHandle;
use crate::overpass::{OverpassClient, RoadSource};
use crate::projection::Viewport;
use crate::protocol::{
    DeviceMessage, GpsUpdate, MediaState, NavStatus, Notification, VectorFrame,
};
use crate::road_cache::RoadCache;
use crate::trace_recorder::TraceRecorder;
use crate::transport::{DeviceTransport, LinkState};
use crate::{LatLon, Position};

pub const DROPPED_PIN_LABEL: &str = "Dropped pin";
const RECENT_DESTINATIONS: usize = 3;

/// The platform's WiFi manager. Joining the device's access point is its
/// business; once joined it reports the network through
/// `SessionCommand::DeviceNetwork`.
pub trait DeviceLinkManager: Send + Sync {
    fn request_connect(&self, device_id: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    ReconnectWait,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RouteState {
    None,
    Routing,
    Active,
    Recalculating,
    Arrived,
}

/// Something the user can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum UserNotice {
    #[strum(serialize = "No location yet")]
    NoLocationYet,
    #[strum(serialize = "Couldn't compute route")]
    RouteUnavailable,
    #[strum(serialize = "Device unreachable")]
    DeviceUnreachable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub link: LinkState,
    pub route_state: RouteState,
    pub position: Option<Position>,
    pub route: Option<Arc<Route>>,
    pub step_index: usize,
    pub zoom: u8,
    pub destination: Option<GeocodeSuggestion>,
    pub suggestions: Vec<GeocodeSuggestion>,
    pub recent_destinations: Vec<GeocodeSuggestion>,
    pub notice: Option<UserNotice>,
    pub uplink: Option<String>,
}

#[derive(Debug)]
pub enum SessionCommand {
    Position(Position),
    /// The network that reaches the device, `None` once it is gone.
    DeviceNetwork(Option<NetworkHandle>),
    Uplink(Option<NetworkHandle>),
    ConnectDevice(String),
    DisconnectDevice,
    Search(String),
    RouteTo(GeocodeSuggestion),
    RouteToPoint {
        lat: f64,
        lon: f64,
    },
    ClearRoute,
    SetZoom(i32),
    Notify {
        app: String,
        title: String,
        text: String,
    },
    Media {
        app: String,
        title: String,
        artist: String,
        playing: bool,
        vol: i32,
    },
    DismissNotice,
    Shutdown,
}

enum Event {
    RoadsRefreshed,
    RouteReady {
        generation: u64,
        route: Option<Route>,
        recalculation: bool,
    },
    SuggestionsReady {
        generation: u64,
        suggestions: Vec<GeocodeSuggestion>,
    },
    ArrivalTimeout {
        generation: u64,
    },
    ReconnectAttempt,
    TransportRetry,
}

enum Input {
    Command(Option<SessionCommand>),
    Event(Event),
    Link(LinkState),
    Tick,
}

/// Builds the frame for one position: cached roads and the route projected
/// around it, rotated heading-up when the fix has a bearing.
pub fn compose_frame(
    roads: &RoadCache,
    route: Option<&Route>,
    position: &Position,
    zoom: u8,
    screen: &ScreenConfig,
) -> VectorFrame {
    let center = position.lat_lon();
    let zoom = zoom as f64;
    let projected_roads = roads.get_projected(zoom, center, screen);
    let projected_route = route
        .map(|r| {
            project_route(
                &r.geometry,
                &Viewport::new(center, zoom, screen),
                screen.simplify_epsilon,
            )
        })
        .unwrap_or_default();
    build_frame(
        projected_roads,
        projected_route,
        position.bearing.map(f64::from),
        screen,
    )
}

fn cancel(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}

fn in_flight(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub struct NavigationSession {
    config: NavConfig,
    road_source: Arc<dyn RoadSource>,
    directions: Arc<dyn Directions>,
    link_manager: Arc<dyn DeviceLinkManager>,
    recorder: Option<TraceRecorder>,
}

impl NavigationSession {
    pub fn new(
        config: NavConfig,
        road_source: Arc<dyn RoadSource>,
        directions: Arc<dyn Directions>,
        link_manager: Arc<dyn DeviceLinkManager>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(NavigationSession {
            config,
            road_source,
            directions,
            link_manager,
            recorder: None,
        })
    }

    /// A session talking to the configured Overpass endpoint and routing
    /// backend.
    pub fn with_default_backends(
        config: NavConfig,
        link_manager: Arc<dyn DeviceLinkManager>,
    ) -> Result<Self> {
        let road_source = Arc::new(OverpassClient::new(&config)?);
        let directions = Arc::new(RouteClient::new(&config)?);
        Self::new(config, road_source, directions, link_manager)
    }

    pub fn with_trace_recorder(mut self, recorder: TraceRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Starts the session task. Must be called within a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = DeviceTransport::new(&self.config);
        let link_rx = transport.state_changes();
        let device_inbound = transport.inbound_sender();
        let roads = Arc::new(RoadCache::new(
            self.config.road_refresh_distance_m,
            self.config.road_query_radius_m,
        ));

        let actor = SessionActor {
            zoom: NavConfig::clamp_zoom(self.config.default_zoom as i32),
            config: self.config,
            road_source: self.road_source,
            directions: self.directions,
            link_manager: self.link_manager,
            recorder: self.recorder,
            transport,
            roads,
            commands: commands_rx,
            events_tx,
            events_rx,
            link_rx,
            snapshots: watch::channel(SessionSnapshot::initial(0)).0,
            ticker: None,
            state: SessionState::Idle,
            device_id: None,
            device_network: None,
            uplink: None,
            position: None,
            progress: None,
            route_state: RouteState::None,
            route_generation: 0,
            destination: None,
            recent_destinations: Vec::new(),
            suggestions: Vec::new(),
            search_generation: 0,
            notice: None,
            refresh_task: None,
            route_task: None,
            search_task: None,
            arrival_task: None,
            reconnect_task: None,
            retry_task: None,
        };
        actor.snapshots.send_replace(actor.snapshot());
        let snapshots = actor.snapshots.subscribe();
        let task = tokio::spawn(actor.run());
        SessionHandle {
            commands: commands_tx,
            snapshots,
            device_inbound,
            task,
        }
    }
}

impl SessionSnapshot {
    fn initial(zoom: u8) -> Self {
        SessionSnapshot {
            state: SessionState::Idle,
            link: LinkState::Disconnected,
            route_state: RouteState::None,
            position: None,
            route: None,
            step_index: 0,
            zoom,
            destination: None,
            suggestions: Vec::new(),
            recent_destinations: Vec::new(),
            notice: None,
            uplink: None,
        }
    }
}

pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    device_inbound: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false once the session has stopped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Raw text from the device (media buttons and the like).
    pub fn device_inbound(&self) -> broadcast::Receiver<String> {
        self.device_inbound.subscribe()
    }

    /// Stops the session and waits until every task it started is gone.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Err(e) = self.task.await {
            error!("session task ended abnormally: {:?}", e);
        }
    }
}

struct SessionActor {
    config: NavConfig,
    road_source: Arc<dyn RoadSource>,
    directions: Arc<dyn Directions>,
    link_manager: Arc<dyn DeviceLinkManager>,
    recorder: Option<TraceRecorder>,
    transport: DeviceTransport,
    roads: Arc<RoadCache>,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    link_rx: watch::Receiver<LinkState>,
    snapshots: watch::Sender<SessionSnapshot>,
    ticker: Option<Interval>,

    state: SessionState,
    device_id: Option<String>,
    device_network: Option<NetworkHandle>,
    uplink: Option<NetworkHandle>,
    position: Option<Position>,
    zoom: u8,

    progress: Option<RouteProgress>,
    route_state: RouteState,
    // bumped whenever the route is replaced or cleared; late results of an
    // older generation are ignored
    route_generation: u64,
    destination: Option<GeocodeSuggestion>,
    recent_destinations: Vec<GeocodeSuggestion>,
    suggestions: Vec<GeocodeSuggestion>,
    search_generation: u64,
    notice: Option<UserNotice>,

    refresh_task: Option<JoinHandle<()>>,
    route_task: Option<JoinHandle<()>>,
    search_task: Option<JoinHandle<()>>,
    arrival_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self) {
        info!("navigation session started");
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                Some(event) = self.events_rx.recv() => Input::Event(event),
                Ok(()) = self.link_rx.changed() => Input::Link(*self.link_rx.borrow_and_update()),
                _ = next_tick(&mut self.ticker) => Input::Tick,
            };
            match input {
                Input::Command(None) | Input::Command(Some(SessionCommand::Shutdown)) => break,
                Input::Command(Some(command)) => self.handle_command(command),
                Input::Event(event) => self.handle_event(event),
                Input::Link(state) => self.handle_link_state(state),
                Input::Tick => self.send_frame(),
            }
            self.publish();
        }
        self.teardown();
        info!("navigation session stopped");
    }

    fn teardown(&mut self) {
        self.ticker = None;
        for task in [
            &mut self.refresh_task,
            &mut self.route_task,
            &mut self.search_task,
            &mut self.arrival_task,
            &mut self.reconnect_task,
            &mut self.retry_task,
        ] {
            cancel(task);
        }
        self.transport.disconnect();
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.flush() {
                error!("failed to flush gps trace: {:?}", e);
            }
        }
        self.state = SessionState::Idle;
        self.publish();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            link: self.transport.state(),
            route_state: self.route_state,
            position: self.position.clone(),
            route: self.progress.as_ref().map(|p| p.route().clone()),
            step_index: self.progress.as_ref().map_or(0, |p| p.step_index()),
            zoom: self.zoom,
            destination: self.destination.clone(),
            suggestions: self.suggestions.clone(),
            recent_destinations: self.recent_destinations.clone(),
            notice: self.notice,
            uplink: self.uplink.as_ref().map(|u| u.name.clone()),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn notify_user(&mut self, notice: UserNotice) {
        info!("user notice: {}", notice);
        self.notice = Some(notice);
    }

    fn clear_notice(&mut self, notice: UserNotice) {
        if self.notice == Some(notice) {
            self.notice = None;
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Position(position) => self.on_position(position),
            SessionCommand::DeviceNetwork(network) => self.on_device_network(network),
            SessionCommand::Uplink(uplink) => {
                self.road_source.set_uplink(uplink.as_ref());
                self.directions.set_uplink(uplink.as_ref());
                self.uplink = uplink;
            }
            SessionCommand::ConnectDevice(device_id) => self.connect_device(device_id),
            SessionCommand::DisconnectDevice => self.disconnect_device(),
            SessionCommand::Search(query) => self.search(query),
            SessionCommand::RouteTo(destination) => self.route_to(destination),
            SessionCommand::RouteToPoint { lat, lon } => self.route_to(GeocodeSuggestion {
                label: DROPPED_PIN_LABEL.to_string(),
                lat,
                lon,
            }),
            SessionCommand::ClearRoute => self.clear_route(),
            SessionCommand::SetZoom(zoom) => {
                self.zoom = NavConfig::clamp_zoom(zoom);
            }
            SessionCommand::Notify { app, title, text } => {
                self.transport
                    .send(&DeviceMessage::Notif(Notification::new(&app, &title, &text)));
            }
            SessionCommand::Media {
                app,
                title,
                artist,
                playing,
                vol,
            } => {
                self.transport.send(&DeviceMessage::Media(MediaState::new(
                    &app, &title, &artist, playing, vol,
                )));
            }
            SessionCommand::DismissNotice => self.notice = None,
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RoadsRefreshed => self.refresh_task = None,
            Event::RouteReady {
                generation,
                route,
                recalculation,
            } => {
                if generation != self.route_generation
                    || (recalculation && self.route_state != RouteState::Recalculating)
                {
                    debug!("ignoring route of an older request");
                    return;
                }
                self.route_task = None;
                self.on_route(route, recalculation);
            }
            Event::SuggestionsReady {
                generation,
                suggestions,
            } => {
                if generation == self.search_generation {
                    self.search_task = None;
                    self.suggestions = suggestions;
                }
            }
            Event::ArrivalTimeout { generation } => {
                if generation == self.route_generation && self.route_state == RouteState::Arrived {
                    info!("clearing route after arrival");
                    self.clear_route();
                }
            }
            Event::ReconnectAttempt => {
                if self.state == SessionState::ReconnectWait {
                    if let Some(device_id) = &self.device_id {
                        debug!("reconnect attempt to {}", device_id);
                        self.link_manager.request_connect(device_id);
                    }
                }
            }
            Event::TransportRetry => {
                self.retry_task = None;
                if self.state == SessionState::Connecting
                    && self.transport.state() == LinkState::Error
                {
                    if let Some(network) = &self.device_network {
                        info!("retrying device link");
                        self.transport.connect(network);
                    }
                }
            }
        }
    }

    fn on_position(&mut self, position: Position) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.record(&position) {
                error!("failed to record gps fix: {:?}", e);
            }
        }
        self.transport
            .send(&DeviceMessage::Gps(GpsUpdate::from_position(&position)));
        self.clear_notice(UserNotice::NoLocationYet);
        let here = position.lat_lon();
        self.position = Some(position);

        if !matches!(
            self.route_state,
            RouteState::Active | RouteState::Recalculating
        ) {
            return;
        }
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        match progress.advance(here) {
            Some(StepEvent::Advanced(index)) => {
                info!("advanced to step {}", index);
                self.send_current_step();
            }
            Some(StepEvent::Arrived) => {
                self.on_arrival();
                return;
            }
            None => {}
        }

        let recalculating = in_flight(&self.route_task);
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        if progress.check_off_route(here, Instant::now(), recalculating) {
            self.start_recalculation();
        }
    }

    fn send_current_step(&self) {
        let Some(progress) = &self.progress else {
            return;
        };
        if let Some(step) = progress.current_step() {
            self.transport.send(&DeviceMessage::Nav(NavStatus::new(
                &step.instruction,
                step.distance_m,
                progress.route().eta_min(),
            )));
        }
    }

    fn on_arrival(&mut self) {
        info!("arrived at destination");
        self.route_state = RouteState::Arrived;
        cancel(&mut self.route_task);
        self.transport.send(&DeviceMessage::Nav(NavStatus::arrived()));

        cancel(&mut self.arrival_task);
        let events = self.events_tx.clone();
        let generation = self.route_generation;
        let delay = self.config.arrived_clear_delay();
        self.arrival_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ArrivalTimeout { generation });
        }));
    }

    fn route_to(&mut self, destination: GeocodeSuggestion) {
        let Some(from) = self.position.as_ref().map(Position::lat_lon) else {
            self.notify_user(UserNotice::NoLocationYet);
            return;
        };
        info!("routing to {}", destination.label);

        cancel(&mut self.route_task);
        cancel(&mut self.arrival_task);
        self.route_generation += 1;
        self.progress = None;
        self.route_state = RouteState::Routing;
        self.remember_destination(&destination);
        self.spawn_route(from, destination.lat_lon(), false);
        self.destination = Some(destination);
    }

    fn remember_destination(&mut self, destination: &GeocodeSuggestion) {
        self.recent_destinations
            .retain(|d| d.label != destination.label);
        self.recent_destinations.insert(0, destination.clone());
        self.recent_destinations.truncate(RECENT_DESTINATIONS);
    }

    fn start_recalculation(&mut self) {
        let Some(from) = self.position.as_ref().map(Position::lat_lon) else {
            return;
        };
        // the end of the routed line, which may sit off the geocoded point
        let Some(to) = self.progress.as_ref().and_then(|p| p.route().destination()) else {
            return;
        };
        info!("recalculating route to {:?}", to);
        self.route_state = RouteState::Recalculating;
        self.spawn_route(from, to, true);
    }

    fn spawn_route(&mut self, from: LatLon, to: LatLon, recalculation: bool) {
        let directions = self.directions.clone();
        let events = self.events_tx.clone();
        let generation = self.route_generation;
        self.route_task = Some(tokio::spawn(async move {
            let route = directions.route(from, to).await;
            let _ = events.send(Event::RouteReady {
                generation,
                route,
                recalculation,
            });
        }));
    }

    fn on_route(&mut self, route: Option<Route>, recalculation: bool) {
        let Some(route) = route else {
            if recalculation {
                // keep following the old route; the cooldown paces the next try
                warn!("recalculation failed, keeping the current route");
                self.route_state = RouteState::Active;
            } else {
                self.route_state = RouteState::None;
                self.destination = None;
                self.notify_user(UserNotice::RouteUnavailable);
            }
            return;
        };

        let route = Arc::new(route);
        match self.progress.as_mut() {
            Some(progress) if recalculation => progress.replace_route(route),
            _ => {
                self.progress = Some(RouteProgress::new(
                    route,
                    self.config.arrival_radius_m,
                    self.config.off_route_tolerance_m,
                    self.config.recalc_cooldown(),
                ))
            }
        }
        self.route_state = RouteState::Active;
        self.clear_notice(UserNotice::RouteUnavailable);
        self.clear_notice(UserNotice::NoLocationYet);

        if self.progress.as_ref().is_some_and(|p| p.is_arrived()) {
            self.on_arrival();
        } else {
            self.send_current_step();
        }
    }

    fn clear_route(&mut self) {
        cancel(&mut self.route_task);
        cancel(&mut self.arrival_task);
        self.route_generation += 1;
        let had_route = self.progress.is_some() || self.route_state != RouteState::None;
        self.progress = None;
        self.destination = None;
        self.route_state = RouteState::None;
        if had_route {
            self.transport
                .send(&DeviceMessage::Nav(NavStatus::no_navigation()));
        }
    }

    fn search(&mut self, query: String) {
        cancel(&mut self.search_task);
        self.search_generation += 1;
        let query = query.trim().to_string();
        if query.is_empty() {
            self.suggestions.clear();
            return;
        }
        let directions = self.directions.clone();
        let events = self.events_tx.clone();
        let generation = self.search_generation;
        let origin = self.position.as_ref().map(Position::lat_lon);
        self.search_task = Some(tokio::spawn(async move {
            let suggestions = directions.suggest(&query, origin).await;
            let _ = events.send(Event::SuggestionsReady {
                generation,
                suggestions,
            });
        }));
    }

    fn connect_device(&mut self, device_id: String) {
        info!("connecting to device {}", device_id);
        cancel(&mut self.reconnect_task);
        cancel(&mut self.retry_task);
        self.stop_frames();
        self.transport.disconnect();
        self.state = SessionState::Connecting;
        self.link_manager.request_connect(&device_id);
        self.device_id = Some(device_id);
    }

    fn disconnect_device(&mut self) {
        info!("disconnecting from device");
        cancel(&mut self.reconnect_task);
        cancel(&mut self.retry_task);
        self.stop_frames();
        self.transport.disconnect();
        self.device_id = None;
        self.state = SessionState::Idle;
        self.clear_notice(UserNotice::DeviceUnreachable);
    }

    fn on_device_network(&mut self, network: Option<NetworkHandle>) {
        self.device_network = network.clone();
        match network {
            Some(network) => {
                if self.state == SessionState::Idle {
                    return;
                }
                cancel(&mut self.reconnect_task);
                self.state = SessionState::Connecting;
                self.transport.connect(&network);
            }
            None => {
                if self.state != SessionState::Idle {
                    self.link_lost();
                }
            }
        }
    }

    fn link_lost(&mut self) {
        if self.state == SessionState::ReconnectWait {
            return;
        }
        warn!("device link lost, reconnecting in the background");
        self.stop_frames();
        self.transport.disconnect();
        cancel(&mut self.retry_task);
        self.state = SessionState::ReconnectWait;
        self.notify_user(UserNotice::DeviceUnreachable);

        let events = self.events_tx.clone();
        let delays = self.config.reconnect_delays();
        cancel(&mut self.reconnect_task);
        self.reconnect_task = Some(tokio::spawn(async move {
            for delay in delays {
                tokio::time::sleep(delay).await;
                if events.send(Event::ReconnectAttempt).is_err() {
                    break;
                }
            }
        }));
    }

    fn handle_link_state(&mut self, link: LinkState) {
        debug!("device link is {}", link);
        match link {
            LinkState::Connected => {
                if self.state == SessionState::Idle {
                    return;
                }
                cancel(&mut self.reconnect_task);
                cancel(&mut self.retry_task);
                self.state = SessionState::Streaming;
                self.clear_notice(UserNotice::DeviceUnreachable);
                self.start_frames();
                // the device starts blank; tell it where we are in the route
                match self.route_state {
                    RouteState::Arrived => {
                        self.transport
                            .send(&DeviceMessage::Nav(NavStatus::arrived()));
                    }
                    RouteState::Active | RouteState::Recalculating => self.send_current_step(),
                    _ => {}
                }
            }
            LinkState::Error => {
                if !matches!(
                    self.state,
                    SessionState::Streaming | SessionState::Connecting
                ) {
                    return;
                }
                self.stop_frames();
                self.state = SessionState::Connecting;
                self.notify_user(UserNotice::DeviceUnreachable);
                cancel(&mut self.retry_task);
                let events = self.events_tx.clone();
                let delay = self.config.transport_retry();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::TransportRetry);
                }));
            }
            LinkState::Connecting | LinkState::Disconnected => {}
        }
    }

    fn start_frames(&mut self) {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    fn stop_frames(&mut self) {
        self.ticker = None;
    }

    fn send_frame(&mut self) {
        let Some(position) = &self.position else {
            return;
        };
        let here = position.lat_lon();
        if self.roads.needs_refresh(here) && !in_flight(&self.refresh_task) {
            let roads = self.roads.clone();
            let source = self.road_source.clone();
            let events = self.events_tx.clone();
            self.refresh_task = Some(tokio::spawn(async move {
                roads.refresh(source.as_ref(), here).await;
                let _ = events.send(Event::RoadsRefreshed);
            }));
        }

        let route = self.progress.as_ref().map(|p| p.route().as_ref());
        let frame = compose_frame(&self.roads, route, position, self.zoom, &self.config.screen);
        debug!(
            "frame: {} roads, {} route points, {} labels",
            frame.roads.len(),
            frame.route.len(),
            frame.labels.len()
        );
        self.transport.send(&DeviceMessage::VectorFrame(frame));
    }
}

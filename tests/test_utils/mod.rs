#![allow(dead_code)]

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use esp32nav_core::config::NavConfig;
use esp32nav_core::session::{DeviceLinkManager, SessionSnapshot};
use esp32nav_core::LatLon;

pub const OBELISCO: (f64, f64) = (-34.6037, -58.3816);
pub const PLAZA_DE_MAYO: (f64, f64) = (-34.6083, -58.3712);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

/// Canned bodies per endpoint. `None` answers 503.
#[derive(Default)]
pub struct BackendScript {
    pub geocode: Option<String>,
    pub route: Option<String>,
    pub overpass: Option<String>,
    pub route_delay: Duration,
}

struct BackendState {
    script: Arc<Mutex<BackendScript>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl BackendState {
    fn record(&self, req: &HttpRequest, body: String) {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: req.method().to_string(),
            path: req.path().to_string(),
            query: req.query_string().to_string(),
            body,
        });
    }
}

fn reply(body: Option<String>) -> HttpResponse {
    match body {
        Some(body) => HttpResponse::Ok()
            .content_type("application/json")
            .body(body),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

async fn geocode(req: HttpRequest, state: web::Data<BackendState>) -> HttpResponse {
    state.record(&req, String::new());
    let body = state.script.lock().unwrap().geocode.clone();
    reply(body)
}

async fn route(req: HttpRequest, body: String, state: web::Data<BackendState>) -> HttpResponse {
    state.record(&req, body);
    let (body, delay) = {
        let script = state.script.lock().unwrap();
        (script.route.clone(), script.route_delay)
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    reply(body)
}

async fn interpreter(req: HttpRequest, body: String, state: web::Data<BackendState>) -> HttpResponse {
    state.record(&req, body);
    let body = state.script.lock().unwrap().overpass.clone();
    reply(body)
}

/// Routing backend and Overpass endpoint on one local actix server, running
/// on its own thread and runtime.
pub struct MockBackend {
    port: u16,
    pub script: Arc<Mutex<BackendScript>>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockBackend {
    pub fn start() -> MockBackend {
        let script = Arc::new(Mutex::new(BackendScript::default()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();

        let server_script = script.clone();
        let server_requests = requests.clone();
        thread::spawn(move || {
            let state = web::Data::new(BackendState {
                script: server_script,
                requests: server_requests,
            });
            let runtime = Runtime::new().expect("Failed to create Tokio runtime");
            runtime.block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(state.clone())
                        .route("/geocode", web::get().to(geocode))
                        .route("/route", web::post().to(route))
                        .route("/interpreter", web::post().to(interpreter))
                })
                .workers(1)
                .bind(("127.0.0.1", 0))
                .expect("Failed to bind server");
                let port = server.addrs()[0].port();
                tx.send(port).expect("Failed to send port");
                server.run().await.expect("Server failed to run");
            });
        });

        let port = rx.recv().expect("Failed to receive port");
        MockBackend {
            port,
            script,
            requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn overpass_url(&self) -> String {
        format!("{}/interpreter", self.url())
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn set_route(&self, body: Option<String>) {
        self.script.lock().unwrap().route = body;
    }

    pub fn set_geocode(&self, body: Option<String>) {
        self.script.lock().unwrap().geocode = body;
    }

    pub fn set_overpass(&self, body: Option<String>) {
        self.script.lock().unwrap().overpass = body;
    }
}

#[derive(Clone, Debug)]
enum DeviceControl {
    Text(String),
    Drop,
}

/// A stand-in for the display: accepts WebSocket clients and records every
/// text message they send.
pub struct MockDevice {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    control: broadcast::Sender<DeviceControl>,
    accept_task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> MockDevice {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(16);
        let control_tx = control.clone();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let received_tx = received_tx.clone();
                let mut control_rx = control_tx.subscribe();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            incoming = stream.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text);
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            control = control_rx.recv() => match control {
                                Ok(DeviceControl::Text(text)) => {
                                    let _ = sink.send(Message::text(text)).await;
                                }
                                Ok(DeviceControl::Drop) | Err(_) => break,
                            },
                        }
                    }
                });
            }
        });

        MockDevice {
            addr,
            received,
            control,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Sends text from the device to every connected client.
    pub fn push(&self, text: &str) {
        let _ = self.control.send(DeviceControl::Text(text.to_string()));
    }

    /// Drops every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.control.send(DeviceControl::Drop);
    }

    /// Stops accepting new connections.
    pub fn stop_listening(&self) {
        self.accept_task.abort();
    }

    pub async fn next_message(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next message whose `type` is `kind`, skipping others.
    pub async fn next_of_type(&mut self, kind: &str, timeout: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let text = self.next_message(left).await?;
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return Some(value);
            }
        }
    }

    pub fn drain(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(message) = self.received.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Records connect requests; the test plays the WiFi manager's part by
/// sending `DeviceNetwork` itself.
#[derive(Default)]
pub struct RecordingLinkManager {
    pub requests: Mutex<Vec<String>>,
}

impl RecordingLinkManager {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl DeviceLinkManager for RecordingLinkManager {
    fn request_connect(&self, device_id: &str) {
        self.requests.lock().unwrap().push(device_id.to_string());
    }
}

/// Short timings so that session tests run in well under a second per step.
pub fn fast_config(backend_url: &str, overpass_url: &str, device_url: &str) -> NavConfig {
    NavConfig {
        frame_interval_ms: 50,
        arrived_clear_delay_ms: 300,
        transport_retry_ms: 200,
        reconnect_initial_ms: 100,
        reconnect_step_ms: 100,
        reconnect_max_ms: 300,
        device_connect_timeout_ms: 2_000,
        http_connect_timeout_ms: 2_000,
        http_timeout_ms: 5_000,
        backend_url: backend_url.to_string(),
        overpass_url: overpass_url.to_string(),
        device_url: device_url.to_string(),
        ..NavConfig::default()
    }
}

pub async fn wait_for_snapshot(
    snapshots: &mut tokio::sync::watch::Receiver<SessionSnapshot>,
    what: &str,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let result = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(predicate))
        .await
        .map(|r| r.map(|snapshot| snapshot.clone()));
    match result {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(_)) => panic!("session stopped while waiting for {what}"),
        Err(_) => panic!(
            "timed out waiting for {what}, last snapshot: {:?}",
            *snapshots.borrow()
        ),
    }
}

/// Overpass body with one way per entry.
pub fn overpass_body(ways: &[(&str, Option<&str>, &[(f64, f64)])]) -> String {
    let elements: Vec<serde_json::Value> = ways
        .iter()
        .enumerate()
        .map(|(i, (highway, name, points))| {
            let mut tags = serde_json::json!({ "highway": highway });
            if let Some(name) = name {
                tags["name"] = serde_json::json!(name);
            }
            serde_json::json!({
                "type": "way",
                "id": i + 1,
                "tags": tags,
                "geometry": points
                    .iter()
                    .map(|(lat, lon)| serde_json::json!({ "lat": lat, "lon": lon }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::json!({ "version": 0.6, "elements": elements }).to_string()
}

/// Route body with one instruction anchored at each geometry point after the
/// first, encoded with elevation like the real backend does.
pub fn route_body(geometry: &[LatLon], instructions: &[&str]) -> String {
    let elevations: Vec<f64> = geometry.iter().map(|_| 25.0).collect();
    let points = esp32nav_core::polyline::encode(geometry, Some(&elevations), 1e6);
    let instructions: Vec<serde_json::Value> = instructions
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let start = (i + 1).min(geometry.len() - 1);
            serde_json::json!({
                "text": text,
                "distance": 120.0,
                "interval": [start, (start + 1).min(geometry.len() - 1)],
            })
        })
        .collect();
    serde_json::json!({
        "distance": 1500.0,
        "time": 300000,
        "points": points,
        "points_encoded_multiplier": 1e6,
        "elevation": true,
        "instructions": instructions,
    })
    .to_string()
}

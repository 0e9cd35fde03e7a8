//! WebSocket link to the display device.
//!
//! Delivery is at-most-once. Nothing is queued while the link is down, a
//! newer vector frame replaces one the writer has not picked up yet, and a
//! full status queue drops the message. Failures show up as `LinkState::Error`,
//! never as an error from `send`.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::NavConfig;
use crate::network::NetworkHandle;
use crate::protocol::DeviceMessage;

const INBOUND_CAPACITY: usize = 32;
// how long a closing link may take to send its close frame
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    frames: watch::Sender<Option<String>>,
    worker: JoinHandle<()>,
}

struct Inner {
    url: String,
    connect_timeout: Duration,
    queue_depth: usize,
    state: watch::Sender<LinkState>,
    inbound: broadcast::Sender<String>,
    link: Mutex<Option<Link>>,
    next_generation: Mutex<u64>,
}

impl Inner {
    // Workers of a replaced link must not overwrite the state of the new one.
    fn set_state(&self, generation: u64, state: LinkState) {
        let link = self.link.lock().unwrap();
        if link.as_ref().map(|l| l.generation) == Some(generation) {
            self.state.send_replace(state);
        }
    }
}

pub struct DeviceTransport {
    inner: Arc<Inner>,
}

impl DeviceTransport {
    pub fn new(config: &NavConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        DeviceTransport {
            inner: Arc::new(Inner {
                url: config.device_url.clone(),
                connect_timeout: config.device_connect_timeout(),
                queue_depth: config.outbound_queue.max(1),
                state,
                inbound,
                link: Mutex::new(None),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Text sent by the device, e.g. media button presses. Not interpreted here.
    pub fn inbound(&self) -> broadcast::Receiver<String> {
        self.inner.inbound.subscribe()
    }

    pub(crate) fn inbound_sender(&self) -> broadcast::Sender<String> {
        self.inner.inbound.clone()
    }

    /// Drops any current link and starts a new one over `network`. Must be
    /// called within a tokio runtime.
    pub fn connect(&self, network: &NetworkHandle) {
        self.disconnect();

        let generation = {
            let mut next = self.inner.next_generation.lock().unwrap();
            *next += 1;
            *next
        };
        let (outbound_tx, outbound_rx) = mpsc::channel(self.inner.queue_depth);
        let (frames_tx, frames_rx) = watch::channel(None);

        let mut link = self.inner.link.lock().unwrap();
        let worker = tokio::spawn(run_link(
            self.inner.clone(),
            generation,
            network.clone(),
            outbound_rx,
            frames_rx,
        ));
        *link = Some(Link {
            generation,
            outbound: outbound_tx,
            frames: frames_tx,
            worker,
        });
        self.inner.state.send_replace(LinkState::Connecting);
        info!("connecting to device at {} over {}", self.inner.url, network.name);
    }

    pub fn disconnect(&self) {
        let mut link = self.inner.link.lock().unwrap();
        let Some(Link {
            outbound,
            frames,
            worker,
            ..
        }) = link.take()
        else {
            return;
        };
        // An established link sends its close frame once the senders are
        // gone; one still handshaking has nothing worth finishing.
        drop(outbound);
        drop(frames);
        let connecting = *self.inner.state.borrow() == LinkState::Connecting;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !connecting => {
                runtime.spawn(reap(worker));
            }
            _ => worker.abort(),
        }
        self.inner.state.send_replace(LinkState::Disconnected);
        info!("device link closed");
    }

    /// Returns whether the message was handed to the link.
    pub fn send(&self, message: &DeviceMessage) -> bool {
        let state = self.state();
        if state != LinkState::Connected {
            debug!("device link is {}, dropping message", state);
            return false;
        }
        let link = self.inner.link.lock().unwrap();
        let Some(link) = link.as_ref() else {
            return false;
        };
        match message {
            DeviceMessage::VectorFrame(_) => link.frames.send(Some(message.to_json())).is_ok(),
            _ => try_enqueue(&link.outbound, Message::text(message.to_json())),
        }
    }

    pub fn send_binary(&self, payload: Vec<u8>) -> bool {
        if self.state() != LinkState::Connected {
            return false;
        }
        let link = self.inner.link.lock().unwrap();
        match link.as_ref() {
            Some(link) => try_enqueue(&link.outbound, Message::Binary(payload)),
            None => false,
        }
    }
}

impl Drop for DeviceTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// A device that stopped reading must not keep the worker alive.
async fn reap(mut worker: JoinHandle<()>) {
    if tokio::time::timeout(CLOSE_GRACE, &mut worker).await.is_err() {
        debug!("device link did not close within {:?}, aborting", CLOSE_GRACE);
        worker.abort();
    }
}

fn try_enqueue(outbound: &mpsc::Sender<Message>, message: Message) -> bool {
    match outbound.try_send(message) {
        Ok(()) => true,
        Err(e) => {
            warn!("device queue rejected message: {}", e);
            false
        }
    }
}

async fn open(
    url: &str,
    network: &NetworkHandle,
) -> Result<WebSocketStream<tokio::net::TcpStream>> {
    let parsed = reqwest::Url::parse(url).context("invalid device url")?;
    let host = parsed.host_str().context("device url has no host")?;
    let port = parsed.port_or_known_default().unwrap_or(80);
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .with_context(|| format!("cannot resolve {}", host))?;
    let stream = network.connect_tcp(addr).await?;
    let (ws, _) = tokio_tungstenite::client_async(url, stream)
        .await
        .context("websocket handshake failed")?;
    Ok(ws)
}

async fn run_link(
    inner: Arc<Inner>,
    generation: u64,
    network: NetworkHandle,
    outbound: mpsc::Receiver<Message>,
    frames: watch::Receiver<Option<String>>,
) {
    let ws = match tokio::time::timeout(inner.connect_timeout, open(&inner.url, &network)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("device connect failed: {:?}", e);
            inner.set_state(generation, LinkState::Error);
            return;
        }
        Err(_) => {
            warn!("device connect timed out after {:?}", inner.connect_timeout);
            inner.set_state(generation, LinkState::Error);
            return;
        }
    };
    inner.set_state(generation, LinkState::Connected);
    info!("device link up");

    if let Err(e) = pump(ws, outbound, frames, &inner.inbound, inner.connect_timeout).await {
        warn!("device link lost: {:?}", e);
        inner.set_state(generation, LinkState::Error);
    }
}

async fn write<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    limit: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, sink.send(message)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => bail!("device has not read anything for {:?}", limit),
    }
}

/// Runs until the local side closes (all senders dropped) or the link fails.
/// A write that does not complete within `write_timeout` fails the link.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Message>,
    mut frames: watch::Receiver<Option<String>>,
    inbound: &broadcast::Sender<String>,
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => write(&mut sink, message, write_timeout).await?,
                None => break,
            },
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    write(&mut sink, Message::text(frame), write_timeout).await?;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // no subscribers is fine
                    let _ = inbound.send(text);
                }
                Some(Ok(Message::Close(_))) | None => bail!("device closed the connection"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
    let _ = write(&mut sink, Message::Close(None), CLOSE_GRACE).await;
    Ok(())
}

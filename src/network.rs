//! The phone has two networks on one WiFi radio: the local link to the
//! device (no internet) and an uplink (cellular or other) for everything else.
//! How a handle is obtained is the platform's business; the core only needs a
//! way to open sockets over it.
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::NavConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
    // sockets are bound to this address so the OS routes them over the
    // matching interface; `None` means the default route
    pub local_address: Option<IpAddr>,
}

impl NetworkHandle {
    pub fn default_route(name: &str) -> Self {
        NetworkHandle {
            name: name.to_string(),
            local_address: None,
        }
    }

    pub fn bound_to(name: &str, local_address: IpAddr) -> Self {
        NetworkHandle {
            name: name.to_string(),
            local_address: Some(local_address),
        }
    }

    pub async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_address {
            socket
                .bind(SocketAddr::new(local, 0))
                .with_context(|| format!("failed to bind to {} ({})", local, self.name))?;
        }
        let stream = socket
            .connect(addr)
            .await
            .with_context(|| format!("failed to connect to {} over {}", addr, self.name))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn http_client_builder(config: &NavConfig, local_address: Option<IpAddr>) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.http_connect_timeout_ms))
        .timeout(Duration::from_millis(config.http_timeout_ms))
        .user_agent(config.user_agent.clone())
        .local_address(local_address)
}

/// HTTP client for uplink traffic, rebuilt whenever the uplink changes.
/// Requests made without an uplink go over the default route.
pub struct UplinkClient {
    config: NavConfig,
    client: RwLock<reqwest::Client>,
}

impl UplinkClient {
    pub fn new(config: &NavConfig) -> Result<Self> {
        let client = http_client_builder(config, None)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(UplinkClient {
            config: config.clone(),
            client: RwLock::new(client),
        })
    }

    pub fn set_uplink(&self, uplink: Option<&NetworkHandle>) {
        let local_address = uplink.and_then(|u| u.local_address);
        match http_client_builder(&self.config, local_address).build() {
            Ok(client) => {
                info!(
                    "uplink client now uses {}",
                    uplink.map(|u| u.name.as_str()).unwrap_or("the default route")
                );
                *self.client.write().unwrap() = client;
            }
            Err(e) => error!("failed to rebuild uplink client: {:?}", e),
        }
    }

    /// `reqwest::Client` is a handle; cloning it out keeps the lock short.
    pub fn client(&self) -> reqwest::Client {
        self.client.read().unwrap().clone()
    }
}

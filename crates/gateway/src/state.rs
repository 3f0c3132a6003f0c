use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Instant};

use tokio::sync::{RwLock, mpsc};

use portico_config::{CanvasConfig, HooksConfig, PorticoConfig, ViewerConfig};

use crate::{
    auth::{ResolvedAuth, resolve_auth},
    rate_limit::AuthRateLimiter,
    services::GatewayServices,
};

// ── Connected client ─────────────────────────────────────────────────────────

/// A long-lived authenticated WebSocket connection.
///
/// An entry exists in the registry iff the underlying connection is open:
/// the upgrade handler inserts after a successful handshake, the connection's
/// teardown removes. The machine-scoped authorizer reads the registry to
/// answer "is there already an authorized sibling from this IP?".
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// Client IP resolved at upgrade time (trusted-proxy aware).
    pub client_ip: IpAddr,
    /// Channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl ConnectedClient {
    /// Send a serialized JSON frame to this client.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Auth configuration.
    pub auth: ResolvedAuth,
    /// Failure limiter backing the general authorizer.
    pub limiter: AuthRateLimiter,
    /// Failure table backing the hook handler.
    pub hook_failures: AuthRateLimiter,
    /// Webhook ingress configuration (absent → hooks disabled).
    pub hooks: Option<HooksConfig>,
    /// Framebuffer viewer subtree configuration.
    pub viewer: ViewerConfig,
    /// Canvas host subtree configuration.
    pub canvas: CanvasConfig,
    /// Path prefix routed to the channel plugin after full auth.
    pub channels_prefix: String,
    /// Domain services and external leaf handlers.
    pub services: GatewayServices,
    /// Server version string.
    pub version: String,
}

impl GatewayState {
    pub fn new(config: &PorticoConfig, services: GatewayServices) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            auth: resolve_auth(&config.gateway),
            limiter: AuthRateLimiter::default(),
            hook_failures: AuthRateLimiter::default(),
            hooks: config.hooks.clone(),
            viewer: config.viewer.clone(),
            canvas: config.canvas.clone(),
            channels_prefix: config.gateway.channels_prefix.clone(),
            services,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Register a freshly authenticated connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client);
    }

    /// Remove a connection on close.
    pub async fn remove_client(&self, conn_id: &str) {
        self.clients.write().await.remove(conn_id);
    }

    /// Whether any live authenticated connection originates from `ip`.
    pub async fn has_live_client_from(&self, ip: IpAddr) -> bool {
        self.clients
            .read()
            .await
            .values()
            .any(|c| c.client_ip == ip)
    }

    /// Send a serialized frame to every connected client, pruning any whose
    /// write loop has gone away.
    pub async fn broadcast(&self, frame: &str) {
        let mut clients = self.clients.write().await;
        clients.retain(|_, c| c.send(frame));
    }
}

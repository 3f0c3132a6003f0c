//! Config schema types (gateway, hooks, viewer, canvas, display, browser).

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PorticoConfig {
    pub gateway: GatewayConfig,
    pub hooks: Option<HooksConfig>,
    pub viewer: ViewerConfig,
    pub canvas: CanvasConfig,
    pub display: DisplayConfig,
    pub browser: BrowserConfig,
}

/// Listener and authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
    /// Shared bearer token. `PORTICO_TOKEN` overrides.
    pub token: Option<String>,
    /// Shared password. `PORTICO_PASSWORD` overrides.
    pub password: Option<String>,
    /// When true, requests arriving from a mesh (overlay VPN) address are
    /// accepted without credentials.
    pub allow_mesh: bool,
    /// Reverse-proxy CIDRs whose forwarded headers are trusted.
    pub trusted_proxies: Vec<String>,
    /// When false, machine-scoped endpoints never fall back to the
    /// sibling-connection check (required behind shared-IP NAT).
    pub machine_fallback: bool,
    /// Path prefix that routes to the channel plugin after full auth.
    pub channels_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7878,
            token: None,
            password: None,
            allow_mesh: false,
            trusted_proxies: Vec::new(),
            machine_fallback: true,
            channels_prefix: "/channels".into(),
        }
    }
}

/// Webhook ingress configuration. Absent section disables hooks entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// URL prefix the hook handler claims.
    pub base_path: String,
    /// Shared secret webhook callers must present.
    pub token: String,
    /// Alternative header name for the token (besides `Authorization: Bearer`).
    pub token_header: String,
    /// Maximum accepted body size in bytes.
    pub max_body_bytes: usize,
    /// Body read timeout in milliseconds.
    pub body_timeout_ms: u64,
    /// When set, only these agent ids may be targeted by `agent` hooks.
    pub allowed_agents: Option<Vec<String>>,
    /// Agent id used when the payload names none.
    pub default_agent_id: Option<String>,
    /// Alias → canonical agent id mapping.
    pub agent_aliases: HashMap<String, String>,
    /// Session key used when the payload carries none.
    pub default_session_key: Option<String>,
    /// When true, `agent` hooks without a resolvable session key are rejected.
    pub require_session_key: bool,
    /// Declarative mapping rules for sub-paths other than `wake`/`agent`.
    pub mappings: Vec<HookMapping>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            base_path: "/hooks".into(),
            token: String::new(),
            token_header: "x-portico-token".into(),
            max_body_bytes: 256 * 1024,
            body_timeout_ms: 10_000,
            allowed_agents: None,
            default_agent_id: None,
            agent_aliases: HashMap::new(),
            default_session_key: None,
            require_session_key: false,
            mappings: Vec::new(),
        }
    }
}

/// One declarative hook mapping rule. All present matchers must hold for the
/// rule to fire; rules are evaluated in config order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookMapping {
    /// Sub-path (after the base path) this rule applies to. `None` matches any.
    pub path: Option<String>,
    /// Required request header.
    pub header: Option<HeaderMatch>,
    /// Required payload field.
    pub payload: Option<PayloadMatch>,
    /// What to do on match.
    pub action: MappingAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMatch {
    /// JSON pointer into the payload, e.g. `/action` or `/issue/state`.
    pub pointer: String,
    pub equals: serde_json::Value,
}

/// Normalized action a mapping rule produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MappingAction {
    /// Wake the main session. `text` may contain `{{payload.<path>}}`
    /// placeholders.
    Wake {
        text: String,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Dispatch an isolated agent turn.
    Agent {
        message: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        session_key: Option<String>,
    },
    /// Swallow the delivery with `204 No Content`.
    #[default]
    Drop,
}

/// Framebuffer viewer subtree configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub enabled: bool,
    /// URL prefix for the viewer subtree.
    pub base_path: String,
    /// Upstream framebuffer server host.
    pub upstream_host: String,
    /// Upstream framebuffer server port.
    pub upstream_port: u16,
    /// Directory holding the bundled viewer library assets.
    pub assets_dir: PathBuf,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: "/vnc".into(),
            upstream_host: "127.0.0.1".into(),
            upstream_port: 5900,
            assets_dir: PathBuf::from("novnc"),
        }
    }
}

/// Canvas host subtree configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    /// URL prefix for the canvas subtree.
    pub base_path: String,
    /// WebSocket path for canvas connections.
    pub ws_path: String,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            base_path: "/canvas".into(),
            ws_path: "/canvas/ws".into(),
        }
    }
}

/// Virtual display configuration for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Display number to use. `None` picks the first free one.
    pub display: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Port the framebuffer server binds on the virtual display.
    pub rfb_port: u16,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            display: None,
            width: 1280,
            height: 800,
            depth: 24,
            rfb_port: 5900,
        }
    }
}

/// Controlled browser configuration for the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Explicit executable path; discovery runs when unset.
    pub executable: Option<String>,
    /// User-data directory; a per-profile default is derived when unset.
    pub user_data_dir: Option<PathBuf>,
    /// Debugging endpoint port.
    pub cdp_port: u16,
    pub headless: bool,
    pub no_sandbox: bool,
    /// Upstream proxy URL passed to the browser.
    pub proxy: Option<String>,
    /// Unpacked extension directories to load.
    pub extensions: Vec<String>,
    /// Apply fingerprint-randomization flags.
    pub stealth: bool,
    /// Cosmetic profile name written during decoration.
    pub profile_name: Option<String>,
    /// Cosmetic profile color written during decoration.
    pub profile_color: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            user_data_dir: None,
            cdp_port: 9222,
            headless: false,
            no_sandbox: false,
            proxy: None,
            extensions: Vec::new(),
            stealth: true,
            profile_name: None,
            profile_color: None,
        }
    }
}

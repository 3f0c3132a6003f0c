//! Domain services and external leaf handlers consumed by the router.
//!
//! Everything the gateway does not own (wake delivery, agent dispatch, the
//! display stack, tool invocation, Slack, plugins, protocol translation, the
//! canvas host) is reached through the trait objects bundled here. `noop()`
//! builds a bundle that accepts nothing and reports nothing handled, which
//! keeps tests and minimal deployments honest.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
};

use crate::router::RouteHandler;

// ── Wake ─────────────────────────────────────────────────────────────────────

/// When a wake delivery should interrupt the main session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeMode {
    #[serde(rename = "now")]
    Now,
    #[serde(rename = "next-heartbeat")]
    NextHeartbeat,
}

impl WakeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::NextHeartbeat => "next-heartbeat",
        }
    }
}

/// Sink for normalized wake events.
#[async_trait]
pub trait WakeSink: Send + Sync {
    async fn wake(&self, text: Option<String>, mode: WakeMode) -> anyhow::Result<()>;
}

// ── Agent dispatch ───────────────────────────────────────────────────────────

/// A normalized agent invocation. Only this shape crosses the hook boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub message: String,
    pub name: Option<String>,
    pub agent_id: Option<String>,
    pub wake_mode: Option<WakeMode>,
    pub session_key: Option<String>,
    pub deliver: Option<bool>,
    pub channel: Option<String>,
    pub to: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub allow_unsafe_external_content: Option<bool>,
}

/// Dispatches normalized agent invocations; returns a run id.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: AgentRequest) -> anyhow::Result<String>;
}

// ── Display control ──────────────────────────────────────────────────────────

/// Control surface the viewer API exposes over the display stack.
#[async_trait]
pub trait DisplayControl: Send + Sync {
    async fn status(&self) -> Value;
    async fn start(&self) -> anyhow::Result<Value>;
    async fn stop(&self) -> anyhow::Result<Value>;
    async fn restart(&self) -> anyhow::Result<Value>;
}

// ── Canvas WebSocket delegate ────────────────────────────────────────────────

/// Receives canvas WebSocket connections after machine-scoped auth. The
/// protocol carried is opaque to the gateway.
#[async_trait]
pub trait WsDelegate: Send + Sync {
    async fn attach(&self, socket: axum::extract::ws::WebSocket);
}

// ── Service bundle ───────────────────────────────────────────────────────────

/// All pluggable collaborators, with no-op defaults.
#[derive(Clone)]
pub struct GatewayServices {
    pub wake: Arc<dyn WakeSink>,
    pub agent: Arc<dyn AgentDispatcher>,
    pub display: Arc<dyn DisplayControl>,
    pub canvas_ws: Option<Arc<dyn WsDelegate>>,
    // External leaf handlers, invoked in router order when present.
    pub tool_invoke: Option<Arc<dyn RouteHandler>>,
    pub slack: Option<Arc<dyn RouteHandler>>,
    pub plugin: Option<Arc<dyn RouteHandler>>,
    pub openai_compat: Option<Arc<dyn RouteHandler>>,
    pub responses_compat: Option<Arc<dyn RouteHandler>>,
    pub canvas_host: Option<Arc<dyn RouteHandler>>,
    pub control_ui: Option<Arc<dyn RouteHandler>>,
    pub avatar: Option<Arc<dyn RouteHandler>>,
}

impl GatewayServices {
    pub fn noop() -> Self {
        Self {
            wake: Arc::new(NoopWakeSink),
            agent: Arc::new(NoopAgentDispatcher),
            display: Arc::new(NoopDisplayControl),
            canvas_ws: None,
            tool_invoke: None,
            slack: None,
            plugin: None,
            openai_compat: None,
            responses_compat: None,
            canvas_host: None,
            control_ui: None,
            avatar: None,
        }
    }

    pub fn with_wake(mut self, wake: Arc<dyn WakeSink>) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentDispatcher>) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayControl>) -> Self {
        self.display = display;
        self
    }
}

// ── No-op implementations ────────────────────────────────────────────────────

struct NoopWakeSink;

#[async_trait]
impl WakeSink for NoopWakeSink {
    async fn wake(&self, text: Option<String>, mode: WakeMode) -> anyhow::Result<()> {
        tracing::debug!(?text, mode = mode.as_str(), "wake discarded (no sink wired)");
        Ok(())
    }
}

struct NoopAgentDispatcher;

#[async_trait]
impl AgentDispatcher for NoopAgentDispatcher {
    async fn dispatch(&self, request: AgentRequest) -> anyhow::Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            run_id = %run_id,
            message_len = request.message.len(),
            "agent dispatch discarded (no dispatcher wired)"
        );
        Ok(run_id)
    }
}

struct NoopDisplayControl;

#[async_trait]
impl DisplayControl for NoopDisplayControl {
    async fn status(&self) -> Value {
        json!({ "running": false })
    }

    async fn start(&self) -> anyhow::Result<Value> {
        anyhow::bail!("display service not available")
    }

    async fn stop(&self) -> anyhow::Result<Value> {
        Ok(json!({ "ok": true, "running": false }))
    }

    async fn restart(&self) -> anyhow::Result<Value> {
        anyhow::bail!("display service not available")
    }
}

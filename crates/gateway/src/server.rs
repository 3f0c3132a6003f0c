use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        body::Body,
        extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
        http::{HeaderMap, Request, StatusCode, header, request::Parts},
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    serde_json::json,
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use {portico_browser::BrowserLauncher, portico_config::PorticoConfig, portico_display::DisplaySupervisor};

use portico_common::net::resolve_client_ip;

use crate::{
    auth::{self, Credential, bearer_token},
    display_control::LiveDisplayControl,
    fb_proxy,
    hooks::HookRoute,
    router::{
        FullAuthGate, MachineAuthGate, RequestContext, RouteHandler, auth_failure_response,
        dispatch_chain, text_response,
    },
    services::GatewayServices,
    state::GatewayState,
    viewer::ViewerRoute,
    ws,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub handlers: Arc<Vec<Arc<dyn RouteHandler>>>,
}

// ── Handler chain ────────────────────────────────────────────────────────────

/// Assemble the ordered handler chain. Order is the contract: hooks run
/// before any other authorization-bearing handler; the fallback 404 lives in
/// the chain walker.
pub fn build_handler_chain(state: &Arc<GatewayState>) -> Vec<Arc<dyn RouteHandler>> {
    let services = &state.services;
    let mut chain: Vec<Arc<dyn RouteHandler>> = vec![Arc::new(HookRoute)];

    if let Some(handler) = &services.tool_invoke {
        chain.push(Arc::clone(handler));
    }
    if let Some(handler) = &services.slack {
        chain.push(Arc::clone(handler));
    }
    if let Some(handler) = &services.plugin {
        chain.push(Arc::new(FullAuthGate {
            prefix: state.channels_prefix.clone(),
            inner: Arc::clone(handler),
        }));
    }
    if let Some(handler) = &services.openai_compat {
        chain.push(Arc::clone(handler));
    }
    if let Some(handler) = &services.responses_compat {
        chain.push(Arc::clone(handler));
    }
    chain.push(Arc::new(ViewerRoute));
    if let Some(handler) = &services.canvas_host {
        chain.push(Arc::new(MachineAuthGate {
            prefix: state.canvas.base_path.clone(),
            inner: Arc::clone(handler),
        }));
    }
    if let Some(handler) = &services.control_ui {
        chain.push(Arc::clone(handler));
    }
    if let Some(handler) = &services.avatar {
        chain.push(Arc::clone(handler));
    }
    chain
}

// ── App assembly ─────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = AppState {
        handlers: Arc::new(build_handler_chain(&state)),
        gateway: state,
    };

    Router::new()
        .route("/health", get(health_handler))
        .fallback(dispatch)
        .layer(cors)
        .with_state(app_state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": state.gateway.version }))
}

/// Top-level dispatcher: upgrades peel off before the HTTP chain runs.
async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    if is_websocket_upgrade(&parts.headers) {
        return handle_upgrade(state, remote, parts).await;
    }

    let ctx = RequestContext::new(parts.method, &parts.uri, parts.headers, remote, body);
    dispatch_chain(&state.gateway, &state.handlers, &ctx).await
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

// ── Upgrade dispatcher ───────────────────────────────────────────────────────

/// Demux a WebSocket upgrade:
/// - framebuffer path → proxy directly (the HTTP viewer gate already ran for
///   the asset fetches that precede it)
/// - canvas path → machine-scoped auth, then the canvas delegate
/// - everything else → the main WebSocket server under full auth
async fn handle_upgrade(state: AppState, remote: SocketAddr, mut parts: Parts) -> Response {
    let path = parts.uri.path().to_string();
    let headers = parts.headers.clone();

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let gateway = state.gateway;

    let viewer_ws_path = format!("{}/ws", gateway.viewer.base_path);
    if gateway.viewer.enabled && path == viewer_ws_path {
        let upstream = format!(
            "{}:{}",
            gateway.viewer.upstream_host, gateway.viewer.upstream_port
        );
        return upgrade.on_upgrade(move |socket| async move {
            fb_proxy::run_session(socket, &upstream).await;
        });
    }

    if path == gateway.canvas.ws_path {
        let decision = auth::authorize_machine(&gateway, &headers, remote).await;
        if let Some(response) = auth_failure_response(decision) {
            return response;
        }
        let Some(delegate) = gateway.services.canvas_ws.clone() else {
            return text_response(StatusCode::NOT_FOUND, "canvas not available");
        };
        return upgrade.on_upgrade(move |socket| async move {
            delegate.attach(socket).await;
        });
    }

    let credential = Credential {
        token: bearer_token(&headers),
        password: None,
    };
    let decision = auth::authorize(
        &gateway.auth,
        &headers,
        remote,
        credential,
        Some(&gateway.limiter),
    );
    if let Some(response) = auth_failure_response(decision) {
        return response;
    }
    let client_ip = resolve_client_ip(&headers, remote, &gateway.auth.trusted_proxies);
    upgrade.on_upgrade(move |socket| ws::handle_connection(socket, gateway, client_ip))
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Wire default services from config: the display stack behind the viewer
/// API when the viewer is enabled and the required binaries exist.
pub fn build_services(config: &PorticoConfig) -> GatewayServices {
    let mut services = GatewayServices::noop();

    if config.viewer.enabled {
        match DisplaySupervisor::new(config.display.clone()) {
            Ok(supervisor) => {
                let launcher = Arc::new(BrowserLauncher::new(config.browser.clone()));
                services = services
                    .with_display(Arc::new(LiveDisplayControl::new(supervisor, launcher)));
            },
            Err(e) => {
                warn!(error = %e, "display stack disabled");
            },
        }
    }

    services
}

/// Start the gateway HTTP + WebSocket server and serve until shutdown.
pub async fn start_gateway(config: PorticoConfig) -> anyhow::Result<()> {
    let services = build_services(&config);
    let state = GatewayState::new(&config, services);

    let bind_addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        hooks = config.hooks.is_some(),
        viewer = config.viewer.enabled,
        "gateway listening"
    );

    let app = build_gateway_app(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        assert!(!is_websocket_upgrade(&HeaderMap::new()));

        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn chain_order_starts_with_hooks_and_contains_viewer() {
        let state = GatewayState::new(&PorticoConfig::default(), GatewayServices::noop());
        let chain = build_handler_chain(&state);
        assert_eq!(chain[0].name(), "hooks");
        assert!(chain.iter().any(|h| h.name() == "viewer"));
    }

    #[test]
    fn external_handlers_slot_in_documented_order() {
        use crate::router::Outcome;
        use async_trait::async_trait;

        struct Named(&'static str);

        #[async_trait]
        impl RouteHandler for Named {
            fn name(&self) -> &str {
                self.0
            }

            async fn handle(
                &self,
                _state: &Arc<GatewayState>,
                _ctx: &RequestContext,
            ) -> anyhow::Result<Outcome> {
                Ok(Outcome::Pass)
            }
        }

        let mut services = GatewayServices::noop();
        services.tool_invoke = Some(Arc::new(Named("tool-invoke")));
        services.slack = Some(Arc::new(Named("slack")));
        services.plugin = Some(Arc::new(Named("plugin")));
        services.canvas_host = Some(Arc::new(Named("canvas")));

        let state = GatewayState::new(&PorticoConfig::default(), services);
        let chain = build_handler_chain(&state);
        let names: Vec<&str> = chain.iter().map(|h| h.name()).collect();
        assert_eq!(
            names,
            [
                "hooks",
                "tool-invoke",
                "slack",
                "full-auth-gate",
                "viewer",
                "machine-auth-gate",
            ]
        );
    }
}

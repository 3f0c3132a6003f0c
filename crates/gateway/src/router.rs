//! Ordered handler chain and the sum-type boundary around it.
//!
//! Each handler reports `Handled` (with the response) or `Pass`; the chain
//! walks in documented order and short-circuits on the first `Handled`. A
//! handler error never crosses the boundary: the outermost adapter converts
//! it to a bare `500` with no exception detail.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    axum::{
        body::Body,
        http::{HeaderMap, Method, StatusCode, Uri, header},
        response::{IntoResponse, Response},
    },
    tracing::error,
};

use crate::{
    auth::{self, AuthDecision, Credential},
    state::GatewayState,
};

// ── Request context ──────────────────────────────────────────────────────────

/// Everything a handler may inspect about the in-flight request. The body is
/// held unread so the claiming handler applies its own size and time caps.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub remote: SocketAddr,
    body: tokio::sync::Mutex<Option<Body>>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        remote: SocketAddr,
        body: Body,
    ) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            remote,
            body: tokio::sync::Mutex::new(Some(body)),
        }
    }

    /// Take the unread body. Returns `None` if another handler already did.
    pub async fn take_body(&self) -> Option<Body> {
        self.body.lock().await.take()
    }

    /// Look up a query parameter by name (no percent-decoding; the gateway
    /// only inspects opaque machine-generated values).
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if k == name {
                return Some(v);
            }
        }
        None
    }
}

/// Whether `path` lies inside the subtree rooted at `prefix`.
pub fn path_under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(prefix) && path[prefix.len()..].starts_with('/')
}

// ── Handler contract ─────────────────────────────────────────────────────────

/// What a handler did with the request.
pub enum Outcome {
    Handled(Response),
    Pass,
}

impl Outcome {
    pub fn handled(response: impl IntoResponse) -> Self {
        Self::Handled(response.into_response())
    }
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        state: &Arc<GatewayState>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Outcome>;
}

// ── Chain dispatch ───────────────────────────────────────────────────────────

/// Walk the chain until a handler claims the request; unclaimed → 404, a
/// handler error → 500.
pub async fn dispatch_chain(
    state: &Arc<GatewayState>,
    handlers: &[Arc<dyn RouteHandler>],
    ctx: &RequestContext,
) -> Response {
    for handler in handlers {
        match handler.handle(state, ctx).await {
            Ok(Outcome::Handled(response)) => return response,
            Ok(Outcome::Pass) => continue,
            Err(e) => {
                error!(handler = handler.name(), path = %ctx.path, error = %e, "handler failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            },
        }
    }
    text_response(StatusCode::NOT_FOUND, "not found")
}

// ── Response helpers ─────────────────────────────────────────────────────────

pub fn text_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response()
}

pub fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        value.to_string(),
    )
        .into_response()
}

/// `429` with a `Retry-After` header, seconds rounded up and at least 1.
pub fn rate_limited_response(retry_after: Duration) -> Response {
    let secs = retry_after.as_millis().div_ceil(1000).max(1);
    let mut response = text_response(
        StatusCode::TOO_MANY_REQUESTS,
        &format!("rate limited, retry after {secs}s"),
    );
    if let Ok(value) = secs.to_string().parse() {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Convert a failed auth decision into its response. `Ok` has no response.
pub fn auth_failure_response(decision: AuthDecision) -> Option<Response> {
    match decision {
        AuthDecision::Ok => None,
        AuthDecision::Unauthorized => {
            Some(text_response(StatusCode::UNAUTHORIZED, "unauthorized"))
        },
        AuthDecision::RateLimited { retry_after } => Some(rate_limited_response(retry_after)),
    }
}

// ── Auth gates ───────────────────────────────────────────────────────────────

/// Full-authorizer gate in front of an external handler, applied only to the
/// subtree rooted at `prefix` (the rest of the handler's surface is its own
/// business).
pub struct FullAuthGate {
    pub prefix: String,
    pub inner: Arc<dyn RouteHandler>,
}

#[async_trait]
impl RouteHandler for FullAuthGate {
    fn name(&self) -> &str {
        "full-auth-gate"
    }

    async fn handle(
        &self,
        state: &Arc<GatewayState>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Outcome> {
        if path_under(&ctx.path, &self.prefix) {
            let credential = Credential {
                token: auth::bearer_token(&ctx.headers),
                password: None,
            };
            let decision = auth::authorize(
                &state.auth,
                &ctx.headers,
                ctx.remote,
                credential,
                Some(&state.limiter),
            );
            if let Some(response) = auth_failure_response(decision) {
                return Ok(Outcome::Handled(response));
            }
        }
        self.inner.handle(state, ctx).await
    }
}

/// Machine-scoped gate in front of an external handler, applied only to the
/// subtree rooted at `prefix`.
pub struct MachineAuthGate {
    pub prefix: String,
    pub inner: Arc<dyn RouteHandler>,
}

#[async_trait]
impl RouteHandler for MachineAuthGate {
    fn name(&self) -> &str {
        "machine-auth-gate"
    }

    async fn handle(
        &self,
        state: &Arc<GatewayState>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Outcome> {
        if path_under(&ctx.path, &self.prefix) {
            let decision = auth::authorize_machine(state, &ctx.headers, ctx.remote).await;
            if let Some(response) = auth_failure_response(decision) {
                return Ok(Outcome::Handled(response));
            }
        }
        self.inner.handle(state, ctx).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::GatewayServices;
    use portico_config::PorticoConfig;

    fn test_ctx(path: &str) -> RequestContext {
        RequestContext::new(
            Method::GET,
            &path.parse::<Uri>().unwrap(),
            HeaderMap::new(),
            "127.0.0.1:4000".parse().unwrap(),
            Body::empty(),
        )
    }

    fn test_state() -> Arc<GatewayState> {
        GatewayState::new(&PorticoConfig::default(), GatewayServices::noop())
    }

    struct Fixed {
        name: &'static str,
        outcome: fn() -> anyhow::Result<Outcome>,
    }

    #[async_trait]
    impl RouteHandler for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(
            &self,
            _state: &Arc<GatewayState>,
            _ctx: &RequestContext,
        ) -> anyhow::Result<Outcome> {
            (self.outcome)()
        }
    }

    fn passing(name: &'static str) -> Arc<dyn RouteHandler> {
        Arc::new(Fixed {
            name,
            outcome: || Ok(Outcome::Pass),
        })
    }

    fn claiming(name: &'static str) -> Arc<dyn RouteHandler> {
        Arc::new(Fixed {
            name,
            outcome: || Ok(Outcome::handled((StatusCode::OK, "claimed"))),
        })
    }

    fn failing(name: &'static str) -> Arc<dyn RouteHandler> {
        Arc::new(Fixed {
            name,
            outcome: || anyhow::bail!("secret detail that must not leak"),
        })
    }

    #[tokio::test]
    async fn first_claiming_handler_wins() {
        let state = test_state();
        let chain = vec![passing("a"), claiming("b"), failing("never-reached")];
        let response = dispatch_chain(&state, &chain, &test_ctx("/x")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_chain_is_404() {
        let state = test_state();
        let response = dispatch_chain(&state, &[], &test_ctx("/x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_error_becomes_opaque_500() {
        let state = test_state();
        let chain = vec![failing("boom")];
        let response = dispatch_chain(&state, &chain, &test_ctx("/x")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("secret detail"));
    }

    #[test]
    fn path_under_respects_boundaries() {
        assert!(path_under("/hooks", "/hooks"));
        assert!(path_under("/hooks/wake", "/hooks"));
        assert!(!path_under("/hooksler", "/hooks"));
        assert!(!path_under("/other", "/hooks"));
    }

    #[test]
    fn retry_after_rounds_up_to_at_least_one() {
        let response = rate_limited_response(Duration::from_millis(1));
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let response = rate_limited_response(Duration::from_millis(1500));
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let response = rate_limited_response(Duration::ZERO);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn query_param_lookup() {
        let ctx = RequestContext::new(
            Method::POST,
            &"/hooks/wake?token=abc&x=1".parse::<Uri>().unwrap(),
            HeaderMap::new(),
            "127.0.0.1:4000".parse().unwrap(),
            Body::empty(),
        );
        assert_eq!(ctx.query_param("token"), Some("abc"));
        assert_eq!(ctx.query_param("x"), Some("1"));
        assert_eq!(ctx.query_param("missing"), None);
    }

    #[tokio::test]
    async fn full_auth_gate_only_guards_prefix() {
        // Token configured via state auth; no credential presented.
        let mut config = PorticoConfig::default();
        config.gateway.token = Some("tok".into());
        let state = GatewayState::new(&config, GatewayServices::noop());

        let gate = FullAuthGate {
            prefix: "/channels".into(),
            inner: claiming("plugin"),
        };

        // Outside the prefix: straight through to the inner handler.
        let out = gate.handle(&state, &test_ctx("/other")).await.unwrap();
        assert!(matches!(out, Outcome::Handled(ref r) if r.status() == StatusCode::OK));

        // Under the prefix without credentials: 401 before the plugin runs.
        let out = gate.handle(&state, &test_ctx("/channels/x")).await.unwrap();
        assert!(matches!(out, Outcome::Handled(ref r) if r.status() == StatusCode::UNAUTHORIZED));
    }
}

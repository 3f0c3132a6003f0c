//! Webhook ingress ("hooks").
//!
//! The hook handler is the first authorization-bearing handler in the chain,
//! so webhook callers never collide with the gateway's general-purpose 401s.
//! Inbound payloads are duck-typed JSON; explicit normalization functions
//! produce the only shapes that cross the dispatch boundary.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    axum::{
        http::{HeaderMap, Method, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde_json::{Value, json},
    tracing::{info, warn},
};

use portico_common::{net::resolve_client_ip, secrets::constant_time_eq};

use portico_config::{HookMapping, HooksConfig, MappingAction};

use crate::{
    auth::bearer_token,
    body::{BodyError, read_json_body},
    router::{
        Outcome, RequestContext, RouteHandler, json_response, path_under, rate_limited_response,
        text_response,
    },
    services::{AgentRequest, WakeMode},
    state::GatewayState,
};

pub struct HookRoute;

#[async_trait]
impl RouteHandler for HookRoute {
    fn name(&self) -> &str {
        "hooks"
    }

    async fn handle(
        &self,
        state: &Arc<GatewayState>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Outcome> {
        let Some(ref cfg) = state.hooks else {
            return Ok(Outcome::Pass);
        };
        if !path_under(&ctx.path, &cfg.base_path) {
            return Ok(Outcome::Pass);
        }
        Ok(Outcome::Handled(process(state, cfg, ctx).await))
    }
}

/// The full pipeline. Every 4xx return happens before any dispatch; every
/// 2xx return is preceded by a completed dispatch call.
async fn process(state: &GatewayState, cfg: &HooksConfig, ctx: &RequestContext) -> Response {
    // Tokens must never travel in the query string (they end up in access
    // logs and referrers).
    if ctx.query_param("token").is_some() || ctx.query_param("access_token").is_some() {
        return text_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "tokens are not accepted in the query string; send `Authorization: Bearer <token>` or the `{}` header",
                cfg.token_header
            ),
        );
    }

    let client_key =
        resolve_client_ip(&ctx.headers, ctx.remote, &state.auth.trusted_proxies).to_string();
    let presented = hook_token(&ctx.headers, &cfg.token_header);
    let authorized =
        presented.is_some_and(|t| !cfg.token.is_empty() && constant_time_eq(t, &cfg.token));
    if !authorized {
        let throttle = state.hook_failures.record_failure(&client_key);
        if throttle.throttled {
            warn!(client = %client_key, "hook auth throttled");
            return rate_limited_response(throttle.retry_after.unwrap_or(Duration::from_secs(1)));
        }
        return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    state.hook_failures.clear(&client_key);

    if ctx.method != Method::POST {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(header::ALLOW, header::HeaderValue::from_static("POST"));
        return response;
    }

    let sub = subpath(&ctx.path, &cfg.base_path);
    if sub.is_empty() {
        return text_response(StatusCode::NOT_FOUND, "missing hook path");
    }

    let body = ctx.take_body().await.unwrap_or_default();
    let payload = match read_json_body(
        body,
        cfg.max_body_bytes,
        Duration::from_millis(cfg.body_timeout_ms),
    )
    .await
    {
        Ok(value) => value,
        Err(BodyError::TooLarge) => {
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        },
        Err(BodyError::Timeout) => {
            return text_response(StatusCode::REQUEST_TIMEOUT, "body read timed out");
        },
        Err(BodyError::Malformed) => {
            return text_response(StatusCode::BAD_REQUEST, "malformed JSON body");
        },
    };

    match sub {
        "wake" => handle_wake(state, &payload).await,
        "agent" => handle_agent(state, cfg, &payload).await,
        other => handle_mapped(state, cfg, other, &ctx.headers, &payload).await,
    }
}

fn hook_token<'a>(headers: &'a HeaderMap, token_header: &str) -> Option<&'a str> {
    bearer_token(headers).or_else(|| headers.get(token_header).and_then(|v| v.to_str().ok()))
}

fn subpath<'a>(path: &'a str, base: &str) -> &'a str {
    path.strip_prefix(base)
        .unwrap_or("")
        .trim_start_matches('/')
}

// ── wake ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakePayload {
    pub text: Option<String>,
    pub mode: WakeMode,
}

/// Normalize a duck-typed wake payload.
pub fn normalize_wake(payload: &Value) -> Result<WakePayload, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "payload must be a JSON object".to_string())?;

    let text = match obj.get("text") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err("`text` must be a string".into()),
    };
    let mode = match obj.get("mode") {
        None | Some(Value::Null) => WakeMode::Now,
        Some(Value::String(s)) => parse_wake_mode(s)?,
        Some(_) => return Err("`mode` must be a string".into()),
    };
    Ok(WakePayload { text, mode })
}

fn parse_wake_mode(raw: &str) -> Result<WakeMode, String> {
    match raw {
        "now" => Ok(WakeMode::Now),
        "next-heartbeat" => Ok(WakeMode::NextHeartbeat),
        other => Err(format!(
            "`mode` must be \"now\" or \"next-heartbeat\", got \"{other}\""
        )),
    }
}

async fn handle_wake(state: &GatewayState, payload: &Value) -> Response {
    let wake = match normalize_wake(payload) {
        Ok(w) => w,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, json!({ "ok": false, "error": e })),
    };
    if let Err(e) = state.services.wake.wake(wake.text, wake.mode).await {
        warn!(error = %e, "wake dispatch failed");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "ok": false, "error": "wake dispatch failed" }),
        );
    }
    info!(mode = wake.mode.as_str(), "hook wake dispatched");
    json_response(StatusCode::OK, json!({ "ok": true, "mode": wake.mode.as_str() }))
}

// ── agent ────────────────────────────────────────────────────────────────────

/// Normalize a duck-typed agent payload. Does not resolve defaults or policy;
/// that happens against config afterwards.
pub fn normalize_agent(payload: &Value) -> Result<AgentRequest, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "payload must be a JSON object".to_string())?;

    let message = match obj.get("message") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) => return Err("`message` must not be empty".into()),
        Some(_) => return Err("`message` must be a string".into()),
        None => return Err("`message` is required".into()),
    };

    let string_field = |key: &str| -> Result<Option<String>, String> {
        match obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(format!("`{key}` must be a string")),
        }
    };
    let bool_field = |key: &str| -> Result<Option<bool>, String> {
        match obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(format!("`{key}` must be a boolean")),
        }
    };

    let wake_mode = match obj.get("wakeMode") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(parse_wake_mode(s)?),
        Some(_) => return Err("`wakeMode` must be a string".into()),
    };
    let timeout_seconds = match obj.get("timeoutSeconds") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(
            n.as_u64()
                .ok_or_else(|| "`timeoutSeconds` must be a non-negative integer".to_string())?,
        ),
        Some(_) => return Err("`timeoutSeconds` must be a number".into()),
    };

    Ok(AgentRequest {
        message,
        name: string_field("name")?,
        agent_id: string_field("agentId")?,
        wake_mode,
        session_key: string_field("sessionKey")?,
        deliver: bool_field("deliver")?,
        channel: string_field("channel")?,
        to: string_field("to")?,
        model: string_field("model")?,
        thinking: string_field("thinking")?,
        timeout_seconds,
        allow_unsafe_external_content: bool_field("allowUnsafeExternalContent")?,
    })
}

/// Apply configured identity and policy to a normalized agent request.
/// Returns an error message suitable for a 400 body when policy rejects it.
fn resolve_agent_request(cfg: &HooksConfig, mut request: AgentRequest) -> Result<AgentRequest, String> {
    let mut agent_id = request
        .agent_id
        .take()
        .or_else(|| cfg.default_agent_id.clone());
    if let Some(canonical) = agent_id
        .as_deref()
        .and_then(|id| cfg.agent_aliases.get(id).cloned())
    {
        agent_id = Some(canonical);
    }

    if let Some(ref allowed) = cfg.allowed_agents {
        match agent_id {
            Some(ref id) if allowed.iter().any(|a| a == id) => {},
            Some(ref id) => return Err(format!("agent id \"{id}\" is not allowed by policy")),
            None => return Err("an agent id is required by policy".into()),
        }
    }
    request.agent_id = agent_id;

    let session_key = request
        .session_key
        .take()
        .or_else(|| cfg.default_session_key.clone());
    if cfg.require_session_key && session_key.is_none() {
        return Err("a session key is required and none was provided or configured".into());
    }
    request.session_key = session_key;

    Ok(request)
}

async fn handle_agent(state: &GatewayState, cfg: &HooksConfig, payload: &Value) -> Response {
    let request = match normalize_agent(payload).and_then(|r| resolve_agent_request(cfg, r)) {
        Ok(r) => r,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, json!({ "ok": false, "error": e })),
    };
    dispatch_agent(state, request).await
}

async fn dispatch_agent(state: &GatewayState, request: AgentRequest) -> Response {
    match state.services.agent.dispatch(request).await {
        Ok(run_id) => {
            info!(run_id = %run_id, "hook agent dispatched");
            json_response(StatusCode::ACCEPTED, json!({ "ok": true, "runId": run_id }))
        },
        Err(e) => {
            warn!(error = %e, "agent dispatch failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "ok": false, "error": "agent dispatch failed" }),
            )
        },
    }
}

// ── Mapping rules ────────────────────────────────────────────────────────────

fn mapping_matches(rule: &HookMapping, sub: &str, headers: &HeaderMap, payload: &Value) -> bool {
    if let Some(ref path) = rule.path
        && path != sub
    {
        return false;
    }
    if let Some(ref header) = rule.header {
        let present = headers
            .get(header.name.as_str())
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == header.value);
        if !present {
            return false;
        }
    }
    if let Some(ref field) = rule.payload {
        let matches = payload
            .pointer(&field.pointer)
            .is_some_and(|v| *v == field.equals);
        if !matches {
            return false;
        }
    }
    true
}

/// Substitute `{{payload.<dot.path>}}` placeholders with stringified payload
/// fields. Missing fields render as the empty string.
pub fn render_template(template: &str, payload: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{payload.") {
        result.push_str(&rest[..start]);
        let after = &rest[start + "{{payload.".len()..];
        let Some(end) = after.find("}}") else {
            // Unterminated placeholder: emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };
        let path = &after[..end];
        let mut value = Some(payload);
        for segment in path.split('.') {
            value = value.and_then(|v| v.get(segment));
        }
        match value {
            Some(Value::String(s)) => result.push_str(s),
            Some(Value::Null) | None => {},
            Some(other) => result.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    result
}

async fn handle_mapped(
    state: &GatewayState,
    cfg: &HooksConfig,
    sub: &str,
    headers: &HeaderMap,
    payload: &Value,
) -> Response {
    let Some(rule) = cfg
        .mappings
        .iter()
        .find(|rule| mapping_matches(rule, sub, headers, payload))
    else {
        return text_response(StatusCode::NOT_FOUND, "no hook mapping matched");
    };

    match &rule.action {
        MappingAction::Drop => {
            info!(hook = sub, "hook delivery dropped by mapping");
            StatusCode::NO_CONTENT.into_response()
        },
        MappingAction::Wake { text, mode } => {
            let mode = match mode.as_deref().map(parse_wake_mode).transpose() {
                Ok(mode) => mode.unwrap_or(WakeMode::Now),
                Err(e) => {
                    warn!(hook = sub, error = %e, "hook mapping misconfigured");
                    return json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "ok": false, "error": "hook mapping misconfigured" }),
                    );
                },
            };
            let text = render_template(text, payload);
            if let Err(e) = state.services.wake.wake(Some(text), mode).await {
                warn!(hook = sub, error = %e, "mapped wake dispatch failed");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "ok": false, "error": "wake dispatch failed" }),
                );
            }
            info!(hook = sub, mode = mode.as_str(), "mapped hook wake dispatched");
            json_response(StatusCode::OK, json!({ "ok": true, "mode": mode.as_str() }))
        },
        MappingAction::Agent {
            message,
            name,
            agent_id,
            session_key,
        } => {
            let request = AgentRequest {
                message: render_template(message, payload),
                name: name.clone(),
                agent_id: agent_id.clone(),
                session_key: session_key.clone(),
                ..AgentRequest::default()
            };
            let request = match resolve_agent_request(cfg, request) {
                Ok(r) => r,
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        json!({ "ok": false, "error": e }),
                    );
                },
            };
            dispatch_agent(state, request).await
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_normalization_defaults_mode() {
        let wake = normalize_wake(&json!({ "text": "hi" })).unwrap();
        assert_eq!(wake.text.as_deref(), Some("hi"));
        assert_eq!(wake.mode, WakeMode::Now);
    }

    #[test]
    fn wake_normalization_accepts_heartbeat_mode() {
        let wake = normalize_wake(&json!({ "mode": "next-heartbeat" })).unwrap();
        assert_eq!(wake.text, None);
        assert_eq!(wake.mode, WakeMode::NextHeartbeat);
    }

    #[test]
    fn wake_normalization_rejects_bad_shapes() {
        assert!(normalize_wake(&json!("string")).is_err());
        assert!(normalize_wake(&json!({ "text": 7 })).is_err());
        assert!(normalize_wake(&json!({ "mode": "later" })).is_err());
    }

    #[test]
    fn agent_normalization_requires_message() {
        assert!(normalize_agent(&json!({})).is_err());
        assert!(normalize_agent(&json!({ "message": "" })).is_err());
        assert!(normalize_agent(&json!({ "message": 3 })).is_err());

        let req = normalize_agent(&json!({
            "message": "do it",
            "agentId": "ops",
            "wakeMode": "next-heartbeat",
            "deliver": true,
            "timeoutSeconds": 30
        }))
        .unwrap();
        assert_eq!(req.message, "do it");
        assert_eq!(req.agent_id.as_deref(), Some("ops"));
        assert_eq!(req.wake_mode, Some(WakeMode::NextHeartbeat));
        assert_eq!(req.deliver, Some(true));
        assert_eq!(req.timeout_seconds, Some(30));
    }

    #[test]
    fn agent_policy_allowlist_enforced() {
        let cfg = HooksConfig {
            allowed_agents: Some(vec!["ops".into()]),
            ..HooksConfig::default()
        };

        let allowed = AgentRequest {
            message: "m".into(),
            agent_id: Some("ops".into()),
            ..AgentRequest::default()
        };
        assert!(resolve_agent_request(&cfg, allowed).is_ok());

        let denied = AgentRequest {
            message: "m".into(),
            agent_id: Some("rogue".into()),
            ..AgentRequest::default()
        };
        let err = resolve_agent_request(&cfg, denied).unwrap_err();
        assert!(err.contains("rogue"));

        let missing = AgentRequest {
            message: "m".into(),
            ..AgentRequest::default()
        };
        assert!(resolve_agent_request(&cfg, missing).is_err());
    }

    #[test]
    fn agent_aliases_resolve_before_policy() {
        let cfg = HooksConfig {
            allowed_agents: Some(vec!["ops".into()]),
            agent_aliases: [("o".to_string(), "ops".to_string())].into_iter().collect(),
            ..HooksConfig::default()
        };
        let req = AgentRequest {
            message: "m".into(),
            agent_id: Some("o".into()),
            ..AgentRequest::default()
        };
        let resolved = resolve_agent_request(&cfg, req).unwrap();
        assert_eq!(resolved.agent_id.as_deref(), Some("ops"));
    }

    #[test]
    fn session_key_requirement() {
        let cfg = HooksConfig {
            require_session_key: true,
            ..HooksConfig::default()
        };
        let req = AgentRequest {
            message: "m".into(),
            ..AgentRequest::default()
        };
        assert!(resolve_agent_request(&cfg, req).is_err());

        let cfg = HooksConfig {
            require_session_key: true,
            default_session_key: Some("main".into()),
            ..HooksConfig::default()
        };
        let req = AgentRequest {
            message: "m".into(),
            ..AgentRequest::default()
        };
        let resolved = resolve_agent_request(&cfg, req).unwrap();
        assert_eq!(resolved.session_key.as_deref(), Some("main"));
    }

    #[test]
    fn template_substitutes_payload_fields() {
        let payload = json!({ "pusher": { "name": "ada" }, "commits": 3 });
        assert_eq!(
            render_template("push by {{payload.pusher.name}} ({{payload.commits}})", &payload),
            "push by ada (3)"
        );
        assert_eq!(
            render_template("missing: <{{payload.nope.deep}}>", &payload),
            "missing: <>"
        );
        assert_eq!(render_template("no placeholders", &payload), "no placeholders");
        assert_eq!(
            render_template("unterminated {{payload.x", &payload),
            "unterminated {{payload.x"
        );
    }

    #[test]
    fn mapping_matchers_compose() {
        let payload = json!({ "action": "opened" });
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "issues".parse().unwrap());

        let rule = HookMapping {
            path: Some("github".into()),
            header: Some(portico_config::HeaderMatch {
                name: "x-github-event".into(),
                value: "issues".into(),
            }),
            payload: Some(portico_config::PayloadMatch {
                pointer: "/action".into(),
                equals: json!("opened"),
            }),
            action: MappingAction::Drop,
        };

        assert!(mapping_matches(&rule, "github", &headers, &payload));
        assert!(!mapping_matches(&rule, "gitlab", &headers, &payload));
        assert!(!mapping_matches(&rule, "github", &HeaderMap::new(), &payload));
        assert!(!mapping_matches(&rule, "github", &headers, &json!({ "action": "closed" })));
    }

    #[test]
    fn subpath_extraction() {
        assert_eq!(subpath("/hooks/wake", "/hooks"), "wake");
        assert_eq!(subpath("/hooks/github/push", "/hooks"), "github/push");
        assert_eq!(subpath("/hooks", "/hooks"), "");
        assert_eq!(subpath("/hooks/", "/hooks"), "");
    }
}

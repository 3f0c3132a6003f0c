//! Tiered request authorization.
//!
//! The full authorizer backs externally reachable surfaces: mesh override,
//! constant-time credential check, then the per-IP failure limiter. The
//! machine-scoped variant backs the framebuffer viewer and canvas subtrees,
//! where a direct loopback connection or a live authenticated sibling from
//! the same private address is proof enough.

use std::{net::SocketAddr, time::Duration};

use {
    axum::http::HeaderMap,
    ipnet::IpNet,
    secrecy::{ExposeSecret, Secret},
    tracing::warn,
};

use portico_common::{
    net::{is_direct_local, is_mesh_ip, is_private_or_loopback, resolve_client_ip},
    secrets::constant_time_eq,
};

use portico_config::GatewayConfig;

use crate::{rate_limit::AuthRateLimiter, state::GatewayState};

// ── Resolved auth ────────────────────────────────────────────────────────────

/// Immutable per-process authentication configuration.
#[derive(Clone)]
pub struct ResolvedAuth {
    pub token: Option<Secret<String>>,
    pub password: Option<Secret<String>>,
    /// Accept requests from mesh (overlay VPN) addresses without credentials.
    pub allow_mesh: bool,
    /// Reverse proxies whose forwarded headers are trusted.
    pub trusted_proxies: Vec<IpNet>,
    /// Permit the sibling-connection fallback on machine-scoped endpoints.
    pub machine_fallback: bool,
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("allow_mesh", &self.allow_mesh)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("machine_fallback", &self.machine_fallback)
            .finish()
    }
}

impl ResolvedAuth {
    fn has_secret(&self) -> bool {
        self.token.is_some() || self.password.is_some()
    }
}

/// Resolve auth from environment (`PORTICO_TOKEN` / `PORTICO_PASSWORD`) and
/// config. Env vars win; malformed trusted-proxy entries are skipped with a
/// warning.
pub fn resolve_auth(config: &GatewayConfig) -> ResolvedAuth {
    let token = std::env::var("PORTICO_TOKEN")
        .ok()
        .or_else(|| config.token.clone());
    let password = std::env::var("PORTICO_PASSWORD")
        .ok()
        .or_else(|| config.password.clone());

    let trusted_proxies = config
        .trusted_proxies
        .iter()
        .filter_map(|raw| match raw.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                warn!(cidr = %raw, error = %e, "ignoring malformed trusted proxy CIDR");
                None
            },
        })
        .collect();

    ResolvedAuth {
        token: token.map(Secret::new),
        password: password.map(Secret::new),
        allow_mesh: config.allow_mesh,
        trusted_proxies,
        machine_fallback: config.machine_fallback,
    }
}

// ── Decision ─────────────────────────────────────────────────────────────────

/// Outcome of an authorization attempt. Carried in return position only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Ok,
    Unauthorized,
    RateLimited { retry_after: Duration },
}

/// Credential presented on a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credential<'a> {
    pub token: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl Credential<'_> {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.password.is_none()
    }
}

/// Pull the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn credential_matches(auth: &ResolvedAuth, credential: Credential<'_>) -> bool {
    if let (Some(presented), Some(expected)) = (credential.token, auth.token.as_ref())
        && constant_time_eq(presented, expected.expose_secret())
    {
        return true;
    }
    if let (Some(presented), Some(expected)) = (credential.password, auth.password.as_ref())
        && constant_time_eq(presented, expected.expose_secret())
    {
        return true;
    }
    false
}

// ── Full authorizer ──────────────────────────────────────────────────────────

/// Authorize a request against the shared secret, in policy order:
/// mesh override, presented credential, failure limiter.
pub fn authorize(
    auth: &ResolvedAuth,
    headers: &HeaderMap,
    remote: SocketAddr,
    credential: Credential<'_>,
    limiter: Option<&AuthRateLimiter>,
) -> AuthDecision {
    let client_ip = resolve_client_ip(headers, remote, &auth.trusted_proxies);

    if auth.allow_mesh && is_mesh_ip(client_ip) {
        return AuthDecision::Ok;
    }

    // No secret configured: the gateway is open by explicit choice.
    if !auth.has_secret() {
        return AuthDecision::Ok;
    }

    if !credential.is_empty() && credential_matches(auth, credential) {
        if let Some(limiter) = limiter {
            limiter.clear(&client_ip.to_string());
        }
        return AuthDecision::Ok;
    }

    match limiter {
        Some(limiter) => {
            let throttle = limiter.record_failure(&client_ip.to_string());
            if throttle.throttled {
                AuthDecision::RateLimited {
                    retry_after: throttle.retry_after.unwrap_or(Duration::from_secs(1)),
                }
            } else {
                AuthDecision::Unauthorized
            }
        },
        None => AuthDecision::Unauthorized,
    }
}

// ── Machine-scoped authorizer ────────────────────────────────────────────────

/// Authorize a request for a machine-scoped endpoint (framebuffer viewer,
/// canvas):
///
/// 1. Direct loopback connections pass.
/// 2. Bearer-token auth as usual (mesh override suppressed).
/// 3. If the effective client IP is private/loopback and the registry holds
///    a live authenticated connection from the same IP, pass.
///
/// The sibling fallback is sound only because the address space is
/// machine-scoped; `machine_fallback: false` disables it for deployments
/// behind shared-IP NAT.
pub async fn authorize_machine(
    state: &GatewayState,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> AuthDecision {
    if is_direct_local(headers, remote) {
        return AuthDecision::Ok;
    }

    let auth = &state.auth;
    let credential = Credential {
        token: bearer_token(headers),
        password: None,
    };
    let suppressed = ResolvedAuth {
        allow_mesh: false,
        ..auth.clone()
    };
    match authorize(&suppressed, headers, remote, credential, Some(&state.limiter)) {
        AuthDecision::Ok => return AuthDecision::Ok,
        limited @ AuthDecision::RateLimited { .. } => return limited,
        AuthDecision::Unauthorized => {},
    }

    if !auth.machine_fallback {
        return AuthDecision::Unauthorized;
    }
    let client_ip = resolve_client_ip(headers, remote, &auth.trusted_proxies);
    if !is_private_or_loopback(client_ip) {
        return AuthDecision::Unauthorized;
    }
    if state.has_live_client_from(client_ip).await {
        return AuthDecision::Ok;
    }
    AuthDecision::Unauthorized
}

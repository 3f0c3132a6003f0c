//! Framebuffer viewer subtree: viewer page, supervisor API, bundled assets.
//!
//! Everything under the viewer base path is machine-scope-authorized. Asset
//! serving refuses traversal outright: NUL bytes, `..` components, absolute
//! paths, and any resolved path that escapes the bundled root.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    axum::{
        http::{Method, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::warn,
};

use crate::{
    auth::authorize_machine,
    router::{
        Outcome, RequestContext, RouteHandler, auth_failure_response, json_response, text_response,
    },
    state::GatewayState,
};

/// Minimal viewer page: bootstraps the bundled client against the `/ws`
/// endpoint next to it.
const VIEWER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Display viewer</title>
<style>
  html, body { margin: 0; height: 100%; background: #111; }
  #screen { width: 100%; height: 100%; }
</style>
</head>
<body>
<div id="screen"></div>
<script type="module">
  import RFB from './novnc/core/rfb.js';
  const url = (location.protocol === 'https:' ? 'wss://' : 'ws://')
    + location.host + location.pathname.replace(/\/$/, '') + '/ws';
  const rfb = new RFB(document.getElementById('screen'), url);
  rfb.scaleViewport = true;
  rfb.resizeSession = true;
</script>
</body>
</html>
"#;

pub struct ViewerRoute;

#[async_trait]
impl RouteHandler for ViewerRoute {
    fn name(&self) -> &str {
        "viewer"
    }

    async fn handle(
        &self,
        state: &Arc<GatewayState>,
        ctx: &RequestContext,
    ) -> anyhow::Result<Outcome> {
        let cfg = &state.viewer;
        if !cfg.enabled {
            return Ok(Outcome::Pass);
        }
        let base = cfg.base_path.as_str();
        let rest = if ctx.path == base {
            ""
        } else if let Some(rest) = ctx.path.strip_prefix(base)
            && rest.starts_with('/')
        {
            rest
        } else {
            return Ok(Outcome::Pass);
        };

        let decision = authorize_machine(state, &ctx.headers, ctx.remote).await;
        if let Some(response) = auth_failure_response(decision) {
            return Ok(Outcome::Handled(response));
        }

        Ok(Outcome::Handled(route(state, ctx, base, rest).await))
    }
}

async fn route(state: &Arc<GatewayState>, ctx: &RequestContext, base: &str, rest: &str) -> Response {
    let get = ctx.method == Method::GET;
    let post = ctx.method == Method::POST;

    match rest {
        // Bare base path: permanent redirect to the slash form, query intact.
        "" if get => {
            let location = match ctx.query.as_deref() {
                Some(q) => format!("{base}/?{q}"),
                None => format!("{base}/"),
            };
            redirect(&location)
        },
        "/" if get => viewer_page(),
        "/api/status" if get => {
            json_response(StatusCode::OK, state.services.display.status().await)
        },
        "/api/start" if post => control(state.services.display.start().await),
        "/api/stop" if post => control(state.services.display.stop().await),
        "/api/restart" if post => control(state.services.display.restart().await),
        _ if get && rest.starts_with("/novnc/") => {
            serve_asset(&state.viewer.assets_dir, &rest["/novnc/".len()..])
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn viewer_page() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        VIEWER_HTML,
    )
        .into_response()
}

fn redirect(location: &str) -> Response {
    match location.parse::<header::HeaderValue>() {
        Ok(value) => {
            let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        },
        Err(_) => text_response(StatusCode::BAD_REQUEST, "bad request"),
    }
}

fn control(result: anyhow::Result<serde_json::Value>) -> Response {
    match result {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(e) => {
            warn!(error = %e, "display control failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            )
        },
    }
}

// ── Asset serving ────────────────────────────────────────────────────────────

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "js" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Resolve `rel` inside `root`, refusing anything that could escape it.
/// Returns the canonical path only when the file exists under the canonical
/// root.
fn safe_asset_path(root: &Path, rel: &str) -> Option<PathBuf> {
    if rel.is_empty() || rel.contains('\0') {
        return None;
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return None;
    }
    // Only plain components: no `..`, no `.`, no prefixes.
    if !rel_path
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let root_canon = root.canonicalize().ok()?;
    let resolved = root.join(rel_path).canonicalize().ok()?;
    resolved.starts_with(&root_canon).then_some(resolved)
}

fn serve_asset(root: &Path, rel: &str) -> Response {
    let Some(path) = safe_asset_path(root, rel) else {
        return text_response(StatusCode::NOT_FOUND, "not found");
    };
    match std::fs::read(&path) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type_for(rel)),
                (header::CACHE_CONTROL, "public, max-age=300"),
            ],
            body,
        )
            .into_response(),
        Err(_) => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("core/rfb.js"), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for("app/styles.css"), "text/css; charset=utf-8");
        assert_eq!(content_type_for("package.json"), "application/json");
        assert_eq!(content_type_for("icons/x.svg"), "image/svg+xml");
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a.webp"), "image/webp");
        assert_eq!(content_type_for("f.ttf"), "font/ttf");
        assert_eq!(content_type_for("f.woff"), "font/woff");
        assert_eq!(content_type_for("f.woff2"), "font/woff2");
        assert_eq!(content_type_for("LICENSE"), "application/octet-stream");
    }

    #[test]
    fn safe_path_accepts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("core")).unwrap();
        std::fs::write(dir.path().join("core/rfb.js"), "export default 1;").unwrap();

        let resolved = safe_asset_path(dir.path(), "core/rfb.js").unwrap();
        assert!(resolved.ends_with("core/rfb.js"));
    }

    #[test]
    fn safe_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.js"), "x").unwrap();

        assert!(safe_asset_path(dir.path(), "../../etc/passwd").is_none());
        assert!(safe_asset_path(dir.path(), "..").is_none());
        assert!(safe_asset_path(dir.path(), "core/../../etc/passwd").is_none());
        assert!(safe_asset_path(dir.path(), "/etc/passwd").is_none());
        assert!(safe_asset_path(dir.path(), "ok.js\0").is_none());
        assert!(safe_asset_path(dir.path(), "").is_none());
        // Plain missing file resolves to None too (canonicalize fails).
        assert!(safe_asset_path(dir.path(), "missing.js").is_none());
    }

    #[test]
    fn safe_path_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret"), "s").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.join("secret"), root.join("link")).unwrap();
            assert!(safe_asset_path(&root, "link").is_none());
        }
    }

    #[test]
    fn serve_asset_reads_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.css"), "body{}").unwrap();

        let response = serve_asset(dir.path(), "app.css");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/css; charset=utf-8"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=300"
        );

        let response = serve_asset(dir.path(), "../app.css");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

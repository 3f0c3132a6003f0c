//! Gateway: single-listener HTTP/WebSocket multiplexer.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, bind address
//! 3. Build the ordered handler chain (hooks first, 404 last)
//! 4. Attach the WebSocket upgrade dispatcher (framebuffer proxy, canvas,
//!    main WS server)
//! 5. Serve until shutdown
//!
//! Leaf functionality (tool invocation, Slack, plugins, protocol translation,
//! the canvas host) plugs in through the trait objects in `services.rs`; the
//! crate owns routing, authorization, webhook ingress, the framebuffer
//! proxy, and the connected-client registry.

pub mod auth;
pub mod body;
pub mod display_control;
pub mod fb_proxy;
pub mod hooks;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod services;
pub mod state;
pub mod viewer;
pub mod ws;

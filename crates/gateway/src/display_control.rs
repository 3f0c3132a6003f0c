//! Live display control: wires the viewer API onto the display supervisor
//! and the browser launcher.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tracing::info,
};

use {portico_browser::BrowserLauncher, portico_display::DisplaySupervisor};

use crate::services::DisplayControl;

pub struct LiveDisplayControl {
    supervisor: Arc<DisplaySupervisor>,
    launcher: Arc<BrowserLauncher>,
}

impl LiveDisplayControl {
    pub fn new(supervisor: Arc<DisplaySupervisor>, launcher: Arc<BrowserLauncher>) -> Self {
        Self {
            supervisor,
            launcher,
        }
    }

    async fn start_stack(&self) -> anyhow::Result<Value> {
        let display = self.supervisor.start().await?;
        let display_env = display
            .display
            .map(|n| format!(":{n}"))
            .ok_or_else(|| anyhow::anyhow!("display did not come up"))?;
        let handle = self.launcher.launch(Some(display_env.as_str())).await?;
        info!(display = %display_env, pid = handle.pid, "display stack started");
        Ok(json!({
            "ok": true,
            "running": true,
            "pid": handle.pid,
            "cdpPort": handle.cdp_port,
            "display": display_env,
        }))
    }

    async fn stop_stack(&self) -> anyhow::Result<Value> {
        self.launcher.stop().await?;
        self.supervisor.stop().await;
        Ok(json!({ "ok": true, "running": false }))
    }
}

#[async_trait]
impl DisplayControl for LiveDisplayControl {
    async fn status(&self) -> Value {
        let browser = self.launcher.status().await;
        json!({
            "running": browser.running,
            "pid": browser.pid,
            "cdpPort": browser.cdp_port,
            "tabs": browser.tabs,
            "stealth": browser.stealth,
        })
    }

    async fn start(&self) -> anyhow::Result<Value> {
        self.start_stack().await
    }

    async fn stop(&self) -> anyhow::Result<Value> {
        self.stop_stack().await
    }

    async fn restart(&self) -> anyhow::Result<Value> {
        self.stop_stack().await?;
        self.start_stack().await
    }
}

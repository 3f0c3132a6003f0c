use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "portico", about = "Portico: multiplexing gateway for machine-local agent surfaces")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Custom config directory (overrides default ~/.config/portico/).
    #[arg(long, global = true, env = "PORTICO_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is provided).
    Gateway,
    /// Print the display stack status and exit.
    Doctor,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,tower_http=warn")));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    if let Some(dir) = cli.config_dir.clone() {
        portico_config::set_config_dir(dir);
    }

    let mut config = portico_config::discover_and_load();
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    match cli.command.unwrap_or(Commands::Gateway) {
        Commands::Gateway => {
            info!(version = env!("CARGO_PKG_VERSION"), "starting portico");
            portico_gateway::server::start_gateway(config).await
        },
        Commands::Doctor => doctor(&config).await,
    }
}

/// Check the display stack prerequisites and report what would run.
async fn doctor(config: &portico_config::PorticoConfig) -> anyhow::Result<()> {
    let detection = portico_browser::detect_browser(config.browser.executable.as_deref());
    match detection.path {
        Some(path) => println!("browser: {}", path.display()),
        None => println!("browser: not found\n{}", detection.install_hint),
    }

    match portico_display::DisplaySupervisor::new(config.display.clone()) {
        Ok(supervisor) => {
            let status = supervisor.status().await;
            println!("display service: available ({})", serde_json::to_string(&status)?);
        },
        Err(e) => println!("display service: disabled ({e})"),
    }

    println!(
        "gateway: {}:{} (hooks {}, viewer {})",
        config.gateway.bind,
        config.gateway.port,
        if config.hooks.is_some() { "on" } else { "off" },
        if config.viewer.enabled { "on" } else { "off" },
    );
    Ok(())
}

//! Configuration loading for the portico gateway.
//!
//! Config is discovered from `portico.{toml,yaml,yml,json}` (project-local,
//! then `~/.config/portico/`), parsed with serde, and `${ENV_VAR}`
//! placeholders in string values are substituted before parsing.

mod env_subst;
mod loader;
mod schema;

pub use {
    env_subst::substitute_env,
    loader::{config_dir, discover_and_load, find_or_default_config_path, load_config, set_config_dir},
    schema::{
        BrowserConfig, CanvasConfig, DisplayConfig, GatewayConfig, HeaderMatch, HookMapping,
        HooksConfig, MappingAction, PayloadMatch, PorticoConfig, ViewerConfig,
    },
};

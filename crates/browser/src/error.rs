//! Browser launcher error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no usable browser executable found")]
    BrowserNotAvailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("debugging endpoint not ready after {0} ms")]
    ReadinessTimeout(u64),

    #[error("profile corruption persisted after retry")]
    ProfileCorrupt,
}

pub type Result<T> = std::result::Result<T, Error>;

//! Display supervisor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("required binary not found: {0}")]
    BinaryMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("display :{0} did not come up within the deadline")]
    DisplayTimeout(u32),

    #[error("no free display number available")]
    NoFreeDisplay,
}

pub type Result<T> = std::result::Result<T, Error>;

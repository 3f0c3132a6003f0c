//! Display service: a supervised virtual display server plus a remote
//! framebuffer server bound to it, with crash-loop recovery and stale-lock
//! hygiene. The controlled browser renders into this display; the gateway's
//! framebuffer proxy serves it to viewers.

pub mod error;
pub mod lockfile;
pub mod supervisor;

pub use {
    error::{Error, Result},
    supervisor::{DisplayStatus, DisplaySupervisor},
};

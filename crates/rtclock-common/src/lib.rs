#![doc = "Common types shared across the rtclock workspace."]

pub mod config;
pub mod cpu;
pub mod error;
pub mod metrics;
pub mod state;
pub mod time;

pub use config::*;
pub use cpu::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
pub use time::*;

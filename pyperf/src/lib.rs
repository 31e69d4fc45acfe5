pub mod agent;
pub mod args;
pub mod config;
pub mod descriptor;
pub mod export;
pub mod logging;

pub use crate::agent::Agent;
pub use crate::config::PyperfConfig;
pub use crate::export::RawProfile;

//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::MutatorApp;
pub use cli::{CliConfig, Commands};
pub use config::ProcessorConfig;
pub use shutdown::{BackgroundTask, Stopper};

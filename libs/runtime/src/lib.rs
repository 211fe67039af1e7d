//! Process bootstrap for the module host: layered configuration and logging.

pub mod config;
pub mod logging;
pub mod paths;

pub use config::{AppConfig, AppConfigProvider, CliArgs, HostConfig, LoggingConfig, Section};
pub use logging::init_logging_from_config;

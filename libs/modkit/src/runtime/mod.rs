//! Process glue: scan → resolve → start → wait → shutdown.

mod runner;
mod shutdown;

pub use runner::{discover, run, Discovery, RunError, RunOptions, ShutdownOptions};
pub use shutdown::wait_for_signal;

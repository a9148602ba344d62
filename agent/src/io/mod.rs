//! I/O helpers: oracle, remote channel, tools, prompts, config and logs.

pub mod channel;
pub mod config;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod state_files;
pub mod telemetry;
pub mod tool;

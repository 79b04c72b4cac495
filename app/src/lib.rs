pub mod commands;
pub mod config;

pub use commands::{run, Cli, Command, Feature};
pub use config::{build_session, load_settings};

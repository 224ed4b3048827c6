//! CLI command implementations

pub mod error;
pub mod output;
pub mod run;
pub mod status;

pub use error::CliError;
pub use run::{Cli, Commands, OutputFormat, ResumeMode, RunArgs};
pub use status::StatusArgs;

//! Status command implementation

use clap::Args;
use std::path::PathBuf;

use super::output::{output_status_human, output_status_json};
use super::run::DEFAULT_CHECKPOINT_PATH;
use super::{Cli, CliError, OutputFormat};
use crate::checkpoint::{CheckpointBackend, FileBackend};
use crate::report;

/// Arguments of the `status` command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Checkpoint file to inspect
    #[arg(long, default_value = DEFAULT_CHECKPOINT_PATH)]
    pub checkpoint: PathBuf,
}

impl StatusArgs {
    /// Summarise the checkpoint, falling back to its archived copy
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let backend = FileBackend::new(&self.checkpoint);
        let archived = FileBackend::new(backend.archive_path());

        let (location, checkpoint) = match backend.load()? {
            Some(checkpoint) => (backend.describe(), checkpoint),
            None => match archived.load()? {
                Some(checkpoint) => (archived.describe(), checkpoint),
                None => {
                    return Err(CliError::InvalidArgument(format!(
                        "no checkpoint found at {}",
                        self.checkpoint.display()
                    )))
                }
            },
        };

        let summary = report::aggregate(checkpoint.results()).summary;
        match cli.output_format {
            OutputFormat::Json => output_status_json(&location, &checkpoint, &summary),
            OutputFormat::Human => output_status_human(&location, &checkpoint, &summary),
        }
        Ok(())
    }
}

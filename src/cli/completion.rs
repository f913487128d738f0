//! Shell completion generation for mongodump

use std::io::Write;

use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::CliArgs;
use crate::error::Result;

/// Write the completion script for `shell` to `out`.
pub fn generate_completion(shell: Shell, out: &mut dyn Write) -> Result<()> {
    let mut cmd = CliArgs::command();
    let mut buffer = Vec::new();
    generate(shell, &mut cmd, "mongodump", &mut buffer);

    out.write_all(&buffer)?;
    out.flush()?;
    Ok(())
}

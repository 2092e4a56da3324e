//! Backfill command implementation

use anyhow::Result;

use crate::config::Config;
use crate::orchestrator;

pub fn run(config: &Config) -> Result<()> {
    println!("Syncing {} ...\n", config.watch_root().display());

    let summary = orchestrator::backfill(config)?;

    println!("Files found:      {}", summary.files);
    println!("Synced:           {}", summary.synced);
    println!("Unchanged:        {}", summary.unchanged);
    println!("Failed:           {}", summary.failed);
    println!("Messages written: {}", summary.messages);
    if summary.line_errors > 0 {
        println!("Skipped lines:    {}", summary.line_errors);
    }

    if summary.failed > 0 {
        anyhow::bail!("{} file(s) failed to sync", summary.failed);
    }
    Ok(())
}

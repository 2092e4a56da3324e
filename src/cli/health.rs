//! Health command implementation

use anyhow::{bail, Result};
use chrono::Utc;

use crate::config::Config;
use crate::orchestrator::read_snapshot;

/// Print the last snapshot written by a running engine; errors when it is
/// missing, stale or unhealthy.
pub fn run(config: &Config) -> Result<()> {
    let snapshot = read_snapshot(&config.state_dir())?;
    let now = Utc::now();
    let interval = config.engine.health_interval();

    println!("Run:            {}", snapshot.run_id);
    println!("PID:            {}", snapshot.pid);
    println!("State:          {}", snapshot.state.as_str());
    println!("Started:        {}", snapshot.started_at.to_rfc3339());
    println!("Uptime:         {}s", snapshot.uptime_secs);
    println!("Watcher alive:  {}", snapshot.watcher_alive);
    match snapshot.last_event_age_ms {
        Some(ms) => println!("Last event:     {}ms before snapshot", ms),
        None => println!("Last event:     -"),
    }
    println!(
        "Files:          {} synced, {} unchanged, {} failed",
        snapshot.files_processed, snapshot.files_skipped, snapshot.files_failed
    );
    println!("Written:        {}", snapshot.written_at.to_rfc3339());

    if snapshot.is_stale(now, interval) {
        bail!("Health snapshot is stale; the engine is not reporting");
    }
    if !snapshot.is_healthy(now, interval) {
        bail!("Engine is not healthy (state: {})", snapshot.state.as_str());
    }
    Ok(())
}

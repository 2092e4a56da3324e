//! Stats command implementation

use anyhow::Result;

use crate::store::MirrorStore;

pub fn run(store: &MirrorStore) -> Result<()> {
    let stats = store.stats()?;

    println!("Sessions:          {}", stats.sessions);
    println!("Messages:          {}", stats.messages);
    println!("Tool invocations:  {}", stats.tool_invocations);
    println!("Tool results:      {}", stats.tool_results);
    println!("Attachments:       {}", stats.attachments);
    println!("Synced files:      {}", stats.files);
    println!("Unparseable lines: {}", stats.parse_errors);

    Ok(())
}

//! List command implementation

use anyhow::Result;

use crate::store::MirrorStore;

pub fn run(store: &MirrorStore, project: Option<String>) -> Result<()> {
    let sessions: Vec<_> = store
        .list_sessions()?
        .into_iter()
        .filter(|s| match &project {
            Some(p) => s.project.as_deref() == Some(p.as_str()),
            None => true,
        })
        .collect();

    if sessions.is_empty() {
        println!("No sessions found. Run 'tracemirror backfill' or 'tracemirror run' first.");
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:<20} {:>8}  {}",
        "Last Active", "ID", "Project", "Msgs", "Source"
    );
    println!("{}", "-".repeat(100));

    for session in sessions {
        // "2024-01-01T10:00:00.000Z" -> "01-01 10:00"
        let last_active = if session.last_activity.len() >= 16 {
            format!("{} {}", &session.last_activity[5..10], &session.last_activity[11..16])
        } else {
            session.last_activity.clone()
        };

        // The project has its own column; `read` accepts this name part too
        let name = session.id.rsplit('/').next().unwrap_or(session.id.as_str());
        let short_id: String = name.chars().take(10).collect();
        let project = session.project.as_deref().unwrap_or("-");
        let project = if project.chars().count() > 20 {
            let head: String = project.chars().take(17).collect();
            format!("{}...", head)
        } else {
            project.to_string()
        };

        println!(
            "{:<12} {:<12} {:<20} {:>8}  {}",
            last_active, short_id, project, session.message_count, session.source_path,
        );
    }

    Ok(())
}

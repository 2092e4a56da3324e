//! Read command implementation

use anyhow::Result;
use std::path::Path;

use crate::store::MirrorStore;

pub fn run(store: &MirrorStore, session_id: &str, tools: bool) -> Result<()> {
    let session = match store.get_session(session_id)? {
        Some(s) => s,
        None => {
            println!("Session '{}' not found.", session_id);
            return Ok(());
        }
    };

    println!("\n{}", "=".repeat(80));
    println!("Session: {}", session.id);
    println!("Source: {}", session.source_path);
    if let Some(project) = &session.project {
        println!("Project: {}", project);
    }
    println!("Active: {} .. {}", session.created_at, session.last_activity);
    if let Some(synced) = store.sync_file(Path::new(&session.source_path))? {
        println!(
            "Synced: {} ({} records, {} bytes, sha256 {})",
            synced.synced_at,
            synced.record_count,
            synced.byte_len,
            &synced.content_hash[..synced.content_hash.len().min(12)]
        );
    }
    println!("{}", "=".repeat(80));

    let messages = store.get_messages(&session.id)?;
    if messages.is_empty() {
        println!("\nNo messages found (this may be an empty session).");
    }

    for msg in messages {
        let model_info = msg
            .model
            .as_ref()
            .map(|m| format!(" | {}", m))
            .unwrap_or_default();
        let project_info = msg
            .project
            .as_ref()
            .map(|p| format!(" | {}", p))
            .unwrap_or_default();

        println!(
            "\n[{}{}{}] ({}) line {}",
            msg.kind.to_uppercase(),
            model_info,
            project_info,
            msg.timestamp,
            msg.line_number
        );

        if let Some(text) = &msg.user_text {
            println!("{}", text);
        }
        if let Some(text) = &msg.agent_text {
            println!("{}", text);
        }

        if tools {
            for call in store.get_tool_calls(&msg.id)? {
                println!("  🔧 {} {}", call.tool_name, call.parameters);
                if let Some(output) = &call.output {
                    println!("     → {}", preview(output));
                } else if let Some(error) = &call.error_output {
                    println!("     ✗ {}", preview(error));
                }
            }
        }

        println!("{}", "-".repeat(40));
    }

    let errors = store.parse_errors(Path::new(&session.source_path))?;
    if !errors.is_empty() {
        println!("\n{} unparseable line(s):", errors.len());
        for err in errors {
            println!("  line {}: {}", err.line_number, err.reason);
        }
    }

    Ok(())
}

fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or("");
    if first.chars().count() > 100 {
        let head: String = first.chars().take(97).collect();
        format!("{}...", head)
    } else {
        first.to_string()
    }
}

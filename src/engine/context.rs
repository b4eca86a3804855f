//! Prompt assembly for a dispatched task.
//!
//! Every bound here is deliberate: identity documents are a fixed configured
//! list, the cycle window and ancestor chain are capped, and skill documents
//! are keyed by name. Missing files degrade to omission, never to failure.

use crate::config::ContextConfig;
use crate::db::Database;
use crate::types::Task;
use anyhow::Result;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Ancestor chain depth cap when walking parent_id links.
const MAX_ANCESTOR_DEPTH: usize = 5;

/// Assemble the worker prompt for one task: identity documents, the recent
/// cycle window, skill documents, the ancestor chain, then the task itself.
pub fn build_prompt(db: &Database, config: &ContextConfig, task: &Task) -> Result<String> {
    let mut prompt = String::new();

    for path in &config.identity_files {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                prompt.push_str(text.trim_end());
                prompt.push_str("\n\n");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping identity file"),
        }
    }

    let recent = db.list_recent_cycles(config.recent_cycles)?;
    if !recent.is_empty() {
        prompt.push_str("## Recent cycles\n\n");
        for cycle in &recent {
            let summary = cycle.summary.as_deref().unwrap_or("(no summary)");
            match cycle.task_id {
                Some(task_id) => {
                    let _ = writeln!(prompt, "- task {task_id}: {summary}");
                }
                None => {
                    let _ = writeln!(prompt, "- {summary}");
                }
            }
        }
        prompt.push('\n');
    }

    for skill in &task.skills {
        let path = config.skills_dir.join(format!("{skill}.md"));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let _ = writeln!(prompt, "## Skill: {skill}\n");
                prompt.push_str(text.trim_end());
                prompt.push_str("\n\n");
            }
            Err(e) => {
                debug!(skill = %skill, path = %path.display(), error = %e, "no skill document")
            }
        }
    }

    let ancestors = ancestor_chain(db, task)?;
    if !ancestors.is_empty() {
        prompt.push_str("## Parent tasks (oldest first)\n\n");
        for ancestor in ancestors.iter().rev() {
            let outcome = ancestor
                .result_summary
                .as_deref()
                .unwrap_or(ancestor.status.as_str());
            let _ = writeln!(prompt, "- task {} [{}]: {}", ancestor.id, outcome, ancestor.subject);
        }
        prompt.push('\n');
    }

    let _ = writeln!(prompt, "## Task {}: {}\n", task.id, task.subject);
    prompt.push_str(&task.description);
    prompt.push('\n');

    Ok(prompt)
}

/// Walk parent_id links upward, nearest ancestor first, capped in depth.
/// A dangling link simply ends the chain.
fn ancestor_chain(db: &Database, task: &Task) -> Result<Vec<Task>> {
    let mut chain = Vec::new();
    let mut next = task.parent_id;

    while let Some(parent_id) = next {
        if chain.len() >= MAX_ANCESTOR_DEPTH {
            break;
        }
        match db.get_task(parent_id)? {
            Some(parent) => {
                next = parent.parent_id;
                chain.push(parent);
            }
            None => break,
        }
    }

    Ok(chain)
}

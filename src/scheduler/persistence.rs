//! Task snapshot file
//!
//! JSON `{"tasks": [...]}` holding every non-terminal task. Reloaded tasks start over as
//! `Pending` with `attempt` reset to 0.

use super::types::{Task, TaskStatus};
use crate::errors::ResilienceResult;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskSnapshot {
    tasks: Vec<Task>,
}

/// Write the non-terminal subset of `tasks` to `path`
pub async fn save_tasks<'a>(
    path: &Path,
    tasks: impl IntoIterator<Item = &'a Task>,
) -> ResilienceResult<usize> {
    let snapshot = TaskSnapshot {
        tasks: tasks
            .into_iter()
            .filter(|task| !task.status.is_terminal())
            .cloned()
            .collect(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, serde_json::to_vec_pretty(&snapshot)?).await?;
    tokio::fs::rename(&staging, path).await?;

    debug!(path = %path.display(), tasks = snapshot.tasks.len(), "Task snapshot written");
    Ok(snapshot.tasks.len())
}

/// Read tasks to resume; a missing file yields none
pub async fn load_tasks(path: &Path) -> ResilienceResult<Vec<Task>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let snapshot: TaskSnapshot = serde_json::from_slice(&raw)?;

    Ok(snapshot
        .tasks
        .into_iter()
        .filter(|task| !task.status.is_terminal())
        .map(|mut task| {
            task.status = TaskStatus::Pending;
            task.attempt = 0;
            task.started_at = None;
            task.ended_at = None;
            task.error = None;
            task
        })
        .collect())
}

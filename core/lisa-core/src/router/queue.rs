//! Priority queue of sessions and its dispatch waves.

use crate::capture::shell_quote;
use crate::engine::Engine;
use crate::error::{LisaError, Result};
use crate::meta::resolve_session_project_root;
use crate::paths::canonical_project_root;
use crate::payload::parse_comma_values;
use crate::session::{normalized_status, recommend_next};
use crate::status::{compute_session_status, StatusRequest};
use serde::Serialize;
use tracing::{debug, warn};

/// Urgency of a session by state: higher sorts first.
pub fn compute_session_priority(state: &str) -> (u32, &'static str) {
    match state.trim().to_ascii_lowercase().as_str() {
        "crashed" => (100, "critical"),
        "stuck" => (96, "critical"),
        "degraded" => (92, "high"),
        "waiting_input" => (86, "needs_input"),
        "in_progress" => (70, "active"),
        "completed" => (20, "complete"),
        "not_found" => (5, "missing"),
        _ => (40, "unknown"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub position: usize,
    pub dispatch_wave: usize,
    pub dispatch_slot: usize,
    pub session: String,
    pub status: String,
    pub session_state: String,
    pub next_action: String,
    pub command: String,
    pub reason: String,
    pub priority_score: u32,
    pub priority_label: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchWave {
    pub wave: usize,
    pub concurrency: usize,
    pub sessions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSpec<'a> {
    pub project_root: &'a str,
    /// Comma-separated names; empty enumerates the project's sessions.
    pub sessions: &'a str,
    /// 0 keeps every item.
    pub limit: usize,
    pub budget: i64,
    pub concurrency: usize,
}

/// Classifies each session and orders them by priority, then name.
///
/// Sessions whose root cannot be resolved unambiguously stay in the queue
/// as `ambiguous_project_root` items so callers can surface them. When the
/// list was enumerated, sessions owned by another project are skipped.
pub fn build_route_queue(engine: &Engine, spec: &QueueSpec<'_>) -> Result<Vec<QueueItem>> {
    let root = canonical_project_root(spec.project_root);
    let mut sessions = parse_comma_values(spec.sessions);
    let enumerated = sessions.is_empty();
    if enumerated {
        let _scope = engine.runtime_scope(&root);
        sessions = engine
            .tmux
            .list_sessions(true, &root)
            .map_err(|e| LisaError::coded("queue_build_failed", format!("failed to build queue: {e}")))?;
    }

    let mut items = Vec::with_capacity(sessions.len());
    for session in sessions {
        let resolved = match resolve_session_project_root(engine, &session, &root, false) {
            Ok(resolved) => resolved,
            Err(err @ LisaError::AmbiguousProjectRoot { .. }) => {
                warn!(session = %session, error = %err, "queue entry has ambiguous project root");
                let (score, label) = (98, "high");
                items.push(QueueItem {
                    position: 0,
                    dispatch_wave: 0,
                    dispatch_slot: 0,
                    command: format!(
                        "./lisa session status --session {} --project-root {} --json",
                        shell_quote(&session),
                        shell_quote(&root)
                    ),
                    session,
                    status: "unknown".into(),
                    session_state: "ambiguous_project_root".into(),
                    next_action: "provide_project_root".into(),
                    reason: err.to_string(),
                    priority_score: score,
                    priority_label: label,
                });
                continue;
            }
            Err(_) => root.clone(),
        };
        if enumerated && canonical_project_root(&resolved) != root {
            continue;
        }
        let req = StatusRequest {
            agent_hint: "auto".into(),
            mode_hint: "auto".into(),
            ..StatusRequest::new(&session, &resolved)
        };
        let status = match compute_session_status(engine, &req) {
            Ok(status) => normalized_status(status),
            Err(err) => {
                debug!(session = %session, error = %err, "skipping session in queue");
                continue;
            }
        };
        let next = recommend_next(&status.session_state, &session, &resolved, spec.budget);
        let (score, label) = compute_session_priority(&status.session_state);
        items.push(QueueItem {
            position: 0,
            dispatch_wave: 0,
            dispatch_slot: 0,
            session,
            status: status.status,
            session_state: status.session_state,
            next_action: next.action.to_string(),
            command: next.command,
            reason: next.reason.to_string(),
            priority_score: score,
            priority_label: label,
        });
    }

    items.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then_with(|| a.session.cmp(&b.session))
    });
    if spec.limit > 0 {
        items.truncate(spec.limit);
    }
    let concurrency = spec.concurrency.max(1);
    for (idx, item) in items.iter_mut().enumerate() {
        item.position = idx + 1;
        item.dispatch_wave = idx / concurrency + 1;
        item.dispatch_slot = idx % concurrency + 1;
    }
    Ok(items)
}

/// Groups queue items by wave, in wave order.
pub fn build_dispatch_plan(items: &[QueueItem], concurrency: usize) -> Vec<DispatchWave> {
    let concurrency = concurrency.max(1);
    let mut waves: Vec<DispatchWave> = Vec::new();
    for item in items {
        let wave = item.dispatch_wave.max(1);
        match waves.iter_mut().find(|w| w.wave == wave) {
            Some(existing) => existing.sessions.push(item.session.clone()),
            None => waves.push(DispatchWave {
                wave,
                concurrency,
                sessions: vec![item.session.clone()],
            }),
        }
    }
    waves.sort_by_key(|w| w.wave);
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::save_session_meta;
    use crate::types::SessionMeta;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_priority_table() {
        assert_eq!(compute_session_priority("crashed"), (100, "critical"));
        assert_eq!(compute_session_priority(" Waiting_Input "), (86, "needs_input"));
        assert_eq!(compute_session_priority("weird"), (40, "unknown"));
    }

    #[test]
    fn test_queue_orders_and_assigns_waves() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let spec = QueueSpec {
            project_root: "/repo",
            sessions: "b,a,c",
            concurrency: 2,
            ..QueueSpec::default()
        };
        let items = build_route_queue(&engine, &spec).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.session.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(items.iter().all(|i| i.session_state == "not_found"));
        assert_eq!(items[2].dispatch_wave, 2);
        assert_eq!(items[2].dispatch_slot, 1);
        assert_eq!(items[1].position, 2);

        let plan = build_dispatch_plan(&items, 2);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].sessions, vec!["a", "b"]);
        assert_eq!(plan[1].sessions, vec!["c"]);
    }

    #[test]
    fn test_queue_limit() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        let spec = QueueSpec {
            project_root: "/repo",
            sessions: "x,y,z",
            limit: 1,
            concurrency: 1,
            ..QueueSpec::default()
        };
        assert_eq!(build_route_queue(&engine, &spec).unwrap().len(), 1);
    }

    #[test]
    fn test_ambiguous_root_is_kept_as_item() {
        let tmp = TempDir::new().unwrap();
        let (engine, _, _) = Engine::with_fakes(tmp.path(), Utc::now());
        for root in ["/one", "/two"] {
            let meta = SessionMeta {
                session: "dup".into(),
                project_root: root.into(),
                ..SessionMeta::default()
            };
            save_session_meta(&engine, root, "dup", &meta).unwrap();
        }
        let spec = QueueSpec {
            project_root: "/repo",
            sessions: "dup,plain",
            concurrency: 1,
            ..QueueSpec::default()
        };
        let items = build_route_queue(&engine, &spec).unwrap();
        assert_eq!(items[0].session, "dup");
        assert_eq!(items[0].session_state, "ambiguous_project_root");
        assert_eq!(items[0].priority_score, 98);
        assert_eq!(items[0].next_action, "provide_project_root");
    }
}

//! Plan mode — a session state that blocks mutating tools while the agent
//! drafts a plan.

use std::collections::HashSet;

use serde_json::json;

use strand_domain::error::Result;
use strand_domain::event::EventKind;
use strand_store::{AppendRequest, EventStore};

/// Active plan-mode state on a session.
#[derive(Debug, Clone)]
pub struct PlanMode {
    pub skill_name: String,
    pub blocked_tools: HashSet<String>,
}

impl PlanMode {
    pub fn blocks(&self, tool_name: &str) -> bool {
        self.blocked_tools.contains(tool_name)
    }
}

/// Append `plan.mode_entered` and return the state to install on the
/// active session.
pub fn enter_plan_mode(
    store: &EventStore,
    session_id: &str,
    skill_name: &str,
    blocked_tools: Vec<String>,
) -> Result<PlanMode> {
    store.append(
        session_id,
        AppendRequest::new(
            EventKind::PlanModeEntered,
            json!({
                "skillName": skill_name,
                "blockedTools": &blocked_tools,
            }),
        ),
    )?;
    Ok(PlanMode {
        skill_name: skill_name.to_owned(),
        blocked_tools: blocked_tools.into_iter().collect(),
    })
}

/// Append `plan.mode_exited`.
pub fn exit_plan_mode(
    store: &EventStore,
    session_id: &str,
    reason: &str,
    plan_path: Option<&str>,
) -> Result<()> {
    let mut payload = json!({"reason": reason});
    if let Some(path) = plan_path {
        payload["planPath"] = json!(path);
    }
    store.append(
        session_id,
        AppendRequest::new(EventKind::PlanModeExited, payload),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_domain::config::StorageConfig;
    use strand_store::Database;

    fn seeded_store() -> (EventStore, String) {
        let store = EventStore::new(
            Database::open_in_memory().unwrap(),
            "ws1",
            StorageConfig::default(),
        );
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::SessionStart,
                    json!({"workingDirectory": "/w", "model": "m1"}),
                ),
            )
            .unwrap();
        (store, session.id)
    }

    #[test]
    fn enter_and_exit_append_events() {
        let (store, sid) = seeded_store();
        let plan = enter_plan_mode(&store, &sid, "planner", vec!["Bash".into(), "Write".into()])
            .unwrap();
        assert!(plan.blocks("Bash"));
        assert!(!plan.blocks("Read"));

        exit_plan_mode(&store, &sid, "plan approved", Some("/tmp/plan.md")).unwrap();

        let events = store.get_events(&sid).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::PlanModeEntered));
        assert!(kinds.contains(&EventKind::PlanModeExited));
        let exited = events
            .iter()
            .find(|e| e.kind == EventKind::PlanModeExited)
            .unwrap();
        assert_eq!(exited.payload_str("planPath"), Some("/tmp/plan.md"));
    }
}

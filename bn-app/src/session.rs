//! Per-user session state: pending approvals, live executions and the rolling
//! conversation window.
//!
//! Every map is a `DashMap` keyed by user id, so users never contend with each other.

use crate::memory::MemoryContext;
use crate::plan::ExecutionPlan;
use crate::run::{ExecutionContext, RunState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A plan waiting for the user's yes / no / level change.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub message: String,
    pub plan: ExecutionPlan,
    pub memory: MemoryContext,
    /// Present when a run suspended mid-way and should resume rather than restart.
    pub resume_state: Option<RunState>,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn new(message: &str, plan: ExecutionPlan, memory: MemoryContext) -> Self {
        Self {
            message: message.to_string(),
            plan,
            memory,
            resume_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn resuming(mut self, state: RunState) -> Self {
        self.resume_state = Some(state);
        self
    }
}

#[derive(Debug, Clone)]
struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillReport {
    pub cancelled_runs: usize,
    pub dropped_pending: bool,
}

impl KillReport {
    pub fn stopped_anything(&self) -> bool {
        self.cancelled_runs > 0 || self.dropped_pending
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub user_id: String,
    pub pending_level: Option<u8>,
    pub pending_since: Option<DateTime<Utc>>,
    pub resumable: bool,
    pub active_runs: usize,
    pub window_len: usize,
}

pub struct SessionManager {
    pending: DashMap<String, PendingApproval>,
    active: DashMap<String, Vec<ActiveRun>>,
    windows: DashMap<String, VecDeque<String>>,
    window_size: usize,
}

impl SessionManager {
    pub fn new(window_size: usize) -> Self {
        Self {
            pending: DashMap::new(),
            active: DashMap::new(),
            windows: DashMap::new(),
            window_size: window_size.max(1),
        }
    }

    pub fn has_pending(&self, user_id: &str) -> bool {
        self.pending.contains_key(user_id)
    }

    /// Replaces any earlier pending approval for the user.
    pub fn set_pending(&self, user_id: &str, pending: PendingApproval) {
        tracing::debug!(
            user_id,
            level = %pending.plan.autonomy_level,
            resumable = pending.resume_state.is_some(),
            "approval pending"
        );
        self.pending.insert(user_id.to_string(), pending);
    }

    /// Removes and returns the pending approval, so exactly one reply can consume it.
    pub fn take_pending(&self, user_id: &str) -> Option<PendingApproval> {
        self.pending.remove(user_id).map(|(_, p)| p)
    }

    /// Registers a live execution. The returned guard unregisters it when dropped.
    pub fn begin_execution(self: &Arc<Self>, user_id: &str, memory: MemoryContext) -> ExecutionGuard {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.active
            .entry(user_id.to_string())
            .or_default()
            .push(ActiveRun {
                id,
                cancel: cancel.clone(),
            });
        ExecutionGuard {
            sessions: Arc::clone(self),
            user_id: user_id.to_string(),
            id,
            ctx: ExecutionContext::new(cancel, memory),
        }
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.active
            .get(user_id)
            .is_some_and(|runs| !runs.is_empty())
    }

    /// Kill switch: flags every live execution for the user and drops their pending approval.
    pub fn kill(&self, user_id: &str) -> KillReport {
        let cancelled_runs = match self.active.get(user_id) {
            Some(runs) => {
                for run in runs.iter() {
                    run.cancel.cancel();
                }
                runs.len()
            }
            None => 0,
        };
        let dropped_pending = self.pending.remove(user_id).is_some();
        tracing::info!(user_id, cancelled_runs, dropped_pending, "kill switch");
        KillReport {
            cancelled_runs,
            dropped_pending,
        }
    }

    fn finish(&self, user_id: &str, id: Uuid) {
        if let Some(mut runs) = self.active.get_mut(user_id) {
            runs.retain(|r| r.id != id);
        }
        self.active.remove_if(user_id, |_, runs| runs.is_empty());
    }

    pub fn push_turn(&self, user_id: &str, message: &str, reply: &str) {
        let mut window = self.windows.entry(user_id.to_string()).or_default();
        window.push_back(format!("User: {message}\nAssistant: {reply}"));
        while window.len() > self.window_size {
            window.pop_front();
        }
    }

    pub fn recent_turns(&self, user_id: &str) -> Vec<String> {
        self.windows
            .get(user_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn window_len(&self, user_id: &str) -> usize {
        self.windows.get(user_id).map(|w| w.len()).unwrap_or(0)
    }

    pub fn clear_window(&self, user_id: &str) {
        self.windows.remove(user_id);
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut users: BTreeSet<String> = BTreeSet::new();
        users.extend(self.pending.iter().map(|e| e.key().clone()));
        users.extend(self.active.iter().map(|e| e.key().clone()));
        users.extend(self.windows.iter().map(|e| e.key().clone()));

        users
            .into_iter()
            .map(|user_id| {
                let pending = self.pending.get(&user_id);
                SessionSummary {
                    pending_level: pending.as_ref().map(|p| p.plan.autonomy_level.value()),
                    pending_since: pending.as_ref().map(|p| p.created_at),
                    resumable: pending.as_ref().is_some_and(|p| p.resume_state.is_some()),
                    active_runs: self.active.get(&user_id).map(|r| r.len()).unwrap_or(0),
                    window_len: self.window_len(&user_id),
                    user_id,
                }
            })
            .collect()
    }
}

pub struct ExecutionGuard {
    sessions: Arc<SessionManager>,
    user_id: String,
    id: Uuid,
    ctx: ExecutionContext,
}

impl ExecutionGuard {
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.sessions.finish(&self.user_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::GovernorDefaults;
    use serde_json::json;

    fn plan(level: u8) -> ExecutionPlan {
        ExecutionPlan::normalize(&json!({ "autonomy_level": level }), &GovernorDefaults::default())
    }

    #[test]
    fn pending_is_consumed_once() {
        let sessions = SessionManager::new(3);
        sessions.set_pending("u1", PendingApproval::new("hi", plan(2), MemoryContext::default()));
        assert!(sessions.has_pending("u1"));
        assert!(!sessions.has_pending("u2"));

        let taken = sessions.take_pending("u1").unwrap();
        assert_eq!(taken.message, "hi");
        assert!(sessions.take_pending("u1").is_none());
    }

    #[test]
    fn kill_cancels_live_runs_and_drops_pending() {
        let sessions = Arc::new(SessionManager::new(3));
        let guard = sessions.begin_execution("u1", MemoryContext::default());
        let other = sessions.begin_execution("u2", MemoryContext::default());
        sessions.set_pending("u1", PendingApproval::new("x", plan(4), MemoryContext::default()));

        let report = sessions.kill("u1");
        assert_eq!(report.cancelled_runs, 1);
        assert!(report.dropped_pending);
        assert!(guard.context().is_cancelled());
        assert!(!other.context().is_cancelled());
        assert!(!sessions.has_pending("u1"));

        assert!(!sessions.kill("u3").stopped_anything());
    }

    #[test]
    fn guard_drop_unregisters_only_its_own_run() {
        let sessions = Arc::new(SessionManager::new(3));
        let first = sessions.begin_execution("u1", MemoryContext::default());
        let second = sessions.begin_execution("u1", MemoryContext::default());
        drop(first);
        assert!(sessions.is_active("u1"));
        drop(second);
        assert!(!sessions.is_active("u1"));

        let late = sessions.begin_execution("u1", MemoryContext::default());
        assert!(!late.context().is_cancelled(), "a new run starts with a fresh flag");
    }

    #[test]
    fn window_keeps_the_latest_turns() {
        let sessions = SessionManager::new(3);
        for i in 0..5 {
            sessions.push_turn("u1", &format!("q{i}"), &format!("a{i}"));
        }
        let turns = sessions.recent_turns("u1");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0], "User: q2\nAssistant: a2");
        assert_eq!(turns[2], "User: q4\nAssistant: a4");

        sessions.clear_window("u1");
        assert!(sessions.recent_turns("u1").is_empty());
    }

    #[test]
    fn summaries_cover_every_known_user() {
        let sessions = Arc::new(SessionManager::new(3));
        sessions.push_turn("a", "q", "r");
        sessions.set_pending(
            "b",
            PendingApproval::new("x", plan(5), MemoryContext::default()).resuming(RunState::default()),
        );
        let _guard = sessions.begin_execution("c", MemoryContext::default());

        let summaries = sessions.summaries();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].window_len, 1);
        assert_eq!(summaries[1].pending_level, Some(5));
        assert!(summaries[1].resumable);
        assert_eq!(summaries[2].active_runs, 1);
    }
}

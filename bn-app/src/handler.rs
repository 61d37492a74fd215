//! Message handler: one inbound text in, one reply out.
//!
//! Order of precedence: kill switch, slash commands, memory commands, a reply to a pending
//! approval, and finally plan → approval gate → execute. Failures never reach the user as
//! raw errors; they become the localized apology.

use crate::agent_loop::ExecutionOutcome;
use crate::commands::{ApprovalReply, CommandParser, ControlCommand, parse_fact};
use crate::locale::Locale;
use crate::memory::{FACT_TYPE, MemoryContext, MemoryStore, RECALL_LIMIT};
use crate::orchestrator::Orchestrator;
use crate::plan::{ExecutionMode, ExecutionPlan};
use crate::run::RunState;
use crate::session::{PendingApproval, SessionManager};
use std::sync::Arc;

pub struct MessageHandler {
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionManager>,
    memory: Arc<dyn MemoryStore>,
    parser: CommandParser,
}

impl MessageHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        sessions: Arc<SessionManager>,
        memory: Arc<dyn MemoryStore>,
        parser: CommandParser,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            memory,
            parser,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn locale(&self) -> Locale {
        self.parser.locale()
    }

    #[tracing::instrument(level = "info", skip(self, message), fields(chars = message.chars().count()))]
    pub async fn handle(&self, message: &str, user_id: &str) -> String {
        if let Some(command) = self.parser.parse_command(message) {
            return self.handle_command(command, user_id).await;
        }

        if let Some(pending) = self.sessions.take_pending(user_id) {
            return self.handle_pending_reply(message, user_id, pending).await;
        }

        let memory = MemoryContext::load(
            self.memory.as_ref(),
            user_id,
            message,
            self.sessions.recent_turns(user_id),
        )
        .await;

        let plan = match self.orchestrator.plan(message, &memory).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(%e, user_id, "planning failed");
                return self.locale().apology().to_string();
            }
        };

        if self.orchestrator.needs_approval(&plan, message) {
            let request = self.orchestrator.format_approval_request(&plan);
            self.sessions
                .set_pending(user_id, PendingApproval::new(message, plan, memory));
            return request;
        }

        self.execute(user_id, message, plan, memory, None).await
    }

    async fn handle_command(&self, command: ControlCommand, user_id: &str) -> String {
        let l = self.locale();
        match command {
            ControlCommand::Kill => {
                if self.sessions.kill(user_id).stopped_anything() {
                    l.kill_ack().to_string()
                } else {
                    l.nothing_to_stop().to_string()
                }
            }
            ControlCommand::Start => l.greeting().to_string(),
            ControlCommand::NewConversation => {
                self.sessions.clear_window(user_id);
                l.conversation_reset().to_string()
            }
            ControlCommand::Status => l.status(
                self.sessions.has_pending(user_id),
                self.sessions.is_active(user_id),
                self.sessions.window_len(user_id),
            ),
            ControlCommand::Remember(text) => {
                let Some((key, value)) = parse_fact(&text) else {
                    return l.remember_usage().to_string();
                };
                match self.memory.upsert(user_id, FACT_TYPE, &key, &value).await {
                    Ok(()) => l.remembered(&key, &value),
                    Err(e) => {
                        tracing::error!(%e, user_id, "explicit remember failed");
                        l.apology().to_string()
                    }
                }
            }
            ControlCommand::Forget(key) => match self.memory.delete_by_key(user_id, &key).await {
                Ok(count) => l.forgotten(&key, count),
                Err(e) => {
                    tracing::error!(%e, user_id, "forget failed");
                    l.apology().to_string()
                }
            },
            ControlCommand::Recall => match self.memory.list_recent(user_id, RECALL_LIMIT).await {
                Ok(records) if records.is_empty() => l.recall_empty().to_string(),
                Ok(records) => {
                    let mut lines = vec![l.recall_header().to_string()];
                    lines.extend(records.iter().map(|r| format!("- {}: {}", r.key, r.value)));
                    lines.join("\n")
                }
                Err(e) => {
                    tracing::error!(%e, user_id, "recall failed");
                    l.apology().to_string()
                }
            },
        }
    }

    async fn handle_pending_reply(
        &self,
        message: &str,
        user_id: &str,
        mut pending: PendingApproval,
    ) -> String {
        let l = self.locale();
        match self.parser.parse_reply(message) {
            Some(ApprovalReply::Approve) => {
                tracing::info!(user_id, level = %pending.plan.autonomy_level, "plan approved");
                self.execute(
                    user_id,
                    &pending.message,
                    pending.plan,
                    pending.memory,
                    pending.resume_state,
                )
                .await
            }
            Some(ApprovalReply::Reject) => {
                tracing::info!(user_id, "plan rejected");
                l.rejected().to_string()
            }
            Some(ApprovalReply::ChangeLevel(level)) => {
                pending.plan = pending
                    .plan
                    .with_level(level, self.orchestrator.governor_defaults());
                tracing::info!(user_id, %level, "plan level changed");
                if pending.resume_state.is_some() && pending.plan.execution_mode == ExecutionMode::Direct {
                    tracing::info!(user_id, "suspended run dropped for a direct answer");
                    let reply = self
                        .execute(user_id, &pending.message, pending.plan, pending.memory, None)
                        .await;
                    format!("{}\n\n{reply}", l.partial_run_discarded())
                } else if pending.resume_state.is_some()
                    || !self.orchestrator.needs_approval(&pending.plan, &pending.message)
                {
                    self.execute(
                        user_id,
                        &pending.message,
                        pending.plan,
                        pending.memory,
                        pending.resume_state,
                    )
                    .await
                } else {
                    let request = self.orchestrator.format_approval_request(&pending.plan);
                    self.sessions.set_pending(user_id, pending);
                    request
                }
            }
            None => {
                let reminder = l.pending_reminder().to_string();
                self.sessions.set_pending(user_id, pending);
                reminder
            }
        }
    }

    /// Called once per finished run; the plan has been approved or needed no approval.
    async fn write_suggested_memory(&self, user_id: &str, plan: &ExecutionPlan) {
        let Some(write) = plan.memory_to_write.as_ref().filter(|_| plan.suggest_memory_write) else {
            return;
        };
        match self
            .memory
            .upsert(user_id, &write.kind, &write.key, &write.value)
            .await
        {
            Ok(()) => tracing::info!(user_id, key = %write.key, "memory written"),
            Err(e) => tracing::warn!(%e, user_id, "memory write failed"),
        }
    }

    async fn execute(
        &self,
        user_id: &str,
        message: &str,
        plan: ExecutionPlan,
        memory: MemoryContext,
        resume: Option<RunState>,
    ) -> String {
        let guard = self.sessions.begin_execution(user_id, memory.clone());
        let result = self
            .orchestrator
            .execute(message, &plan, guard.context(), resume)
            .await;

        match result {
            Ok(ExecutionOutcome::Suspended(suspension)) => {
                if guard.context().is_cancelled() {
                    return self.locale().stopped().to_string();
                }
                let request = suspension.approval_request.clone();
                let suspension = *suspension;
                self.sessions.set_pending(
                    user_id,
                    PendingApproval::new(message, suspension.proposed_plan, memory)
                        .resuming(suspension.resume_state),
                );
                // A kill between the check and the insert missed this pending entry.
                if guard.context().is_cancelled() {
                    self.sessions.take_pending(user_id);
                    return self.locale().stopped().to_string();
                }
                request
            }
            Ok(outcome) => {
                drop(guard);
                if matches!(outcome, ExecutionOutcome::Finished { .. }) {
                    self.write_suggested_memory(user_id, &plan).await;
                }
                let reply = outcome.reply().to_string();
                self.sessions.push_turn(user_id, message, &reply);
                reply
            }
            Err(e) => {
                tracing::error!(%e, user_id, "execution failed");
                self.locale().apology().to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::catalog::CapabilityCatalog;
    use crate::plan::GovernorDefaults;
    use crate::testing::{FnGenerator, InMemoryStore, RecordingRunner, ScriptedCritic, ScriptedRouter};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        router: Arc<ScriptedRouter>,
        generator: Arc<FnGenerator>,
        runner: Arc<RecordingRunner>,
        store: Arc<InMemoryStore>,
        handler: Arc<MessageHandler>,
    }

    fn fixture_with(
        locale: Locale,
        plan: Value,
        generator: FnGenerator,
        intent_levels: &[(&str, u8)],
    ) -> Fixture {
        let router = Arc::new(ScriptedRouter::returning(plan));
        let generator = Arc::new(generator);
        let runner = Arc::new(RecordingRunner::default());
        let store = Arc::new(InMemoryStore::default());
        let overrides: BTreeMap<String, u8> = intent_levels
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let orchestrator = Orchestrator::new(
            Capabilities {
                router: router.clone(),
                generator: generator.clone(),
                critic: Arc::new(ScriptedCritic::default()),
                runner: runner.clone(),
            },
            Arc::new(CapabilityCatalog::with_overrides(&overrides)),
            locale,
            GovernorDefaults::default(),
        );
        let handler = MessageHandler::new(
            Arc::new(orchestrator),
            Arc::new(SessionManager::new(3)),
            store.clone(),
            CommandParser::new(locale).unwrap(),
        );
        Fixture {
            router,
            generator,
            runner,
            store,
            handler: Arc::new(handler),
        }
    }

    fn fixture(locale: Locale, plan: Value) -> Fixture {
        fixture_with(locale, plan, FnGenerator::fixed("answer"), &[])
    }

    #[tokio::test]
    async fn level_zero_answers_directly_and_records_the_turn() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 0 }));
        assert_eq!(fx.handler.handle("capital of France?", "u1").await, "answer");
        assert_eq!(
            fx.handler.sessions().recent_turns("u1"),
            vec!["User: capital of France?\nAssistant: answer".to_string()]
        );

        fx.handler.handle("and Spain?", "u1").await;
        let seen = fx.router.seen_memory();
        assert_eq!(seen[1].recent_turns.len(), 1);
    }

    #[tokio::test]
    async fn approval_gate_then_yes_executes_once() {
        let fx = fixture(Locale::He, json!({ "autonomy_level": 2, "reason": "קוד" }));
        let reply = fx.handler.handle("כתוב סקריפט", "u1").await;
        assert!(reply.starts_with("נדרש אישור לפני ביצוע."));
        assert!(fx.generator.calls().is_empty());

        assert_eq!(fx.handler.handle("כן", "u1").await, "answer");
        assert_eq!(fx.generator.calls().len(), 1);
        assert!(!fx.handler.sessions().has_pending("u1"));
    }

    #[tokio::test]
    async fn rejection_discards_the_plan() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 2 }));
        fx.handler.handle("write code", "u1").await;
        assert_eq!(fx.handler.handle("no", "u1").await, "OK, cancelled.");
        assert!(fx.generator.calls().is_empty());
        assert!(!fx.handler.sessions().has_pending("u1"));
    }

    #[tokio::test]
    async fn unrelated_reply_keeps_the_plan_pending() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 2 }));
        fx.handler.handle("write code", "u1").await;
        let reply = fx.handler.handle("what do you mean?", "u1").await;
        assert_eq!(reply, Locale::En.pending_reminder());
        assert!(fx.handler.sessions().has_pending("u1"));
    }

    #[tokio::test]
    async fn lowering_the_level_executes_without_asking_again() {
        let fx = fixture(Locale::He, json!({ "autonomy_level": 2 }));
        fx.handler.handle("שאלה", "u1").await;
        assert_eq!(fx.handler.handle("שנה רמה ל-1", "u1").await, "answer");
        assert!(!fx.handler.sessions().has_pending("u1"));
    }

    #[tokio::test]
    async fn raising_the_level_asks_again() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 2 }));
        fx.handler.handle("question", "u1").await;
        let reply = fx.handler.handle("level 4", "u1").await;
        assert!(reply.contains("Proposed automation level: Level 4."));
        assert!(reply.contains("max_turns=5"));
        assert!(fx.handler.sessions().has_pending("u1"));
        assert!(fx.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn suggested_memory_is_written_only_after_approval() {
        let fx = fixture(
            Locale::En,
            json!({
                "autonomy_level": 0,
                "suggest_memory_write": true,
                "memory_to_write": { "type": "fact", "key": "city", "value": "Haifa" },
            }),
        );
        let reply = fx.handler.handle("I moved to Haifa", "u1").await;
        assert!(reply.contains("key: city"));
        assert!(fx.store.values("u1").is_empty());

        fx.handler.handle("yes", "u1").await;
        assert_eq!(fx.store.values("u1"), vec![("city".to_string(), "Haifa".to_string())]);
    }

    #[tokio::test]
    async fn rejected_memory_is_never_written() {
        let fx = fixture(
            Locale::En,
            json!({
                "autonomy_level": 0,
                "suggest_memory_write": true,
                "memory_to_write": { "key": "city", "value": "Haifa" },
            }),
        );
        fx.handler.handle("I moved to Haifa", "u1").await;
        fx.handler.handle("no", "u1").await;
        assert!(fx.store.values("u1").is_empty());
    }

    #[tokio::test]
    async fn explicit_remember_stores_without_planning() {
        let fx = fixture(Locale::He, json!({ "autonomy_level": 0 }));
        let reply = fx.handler.handle("תזכור: עיר: חיפה", "u1").await;
        assert_eq!(reply, "נשמר: עיר = חיפה");
        assert_eq!(fx.store.values("u1"), vec![("עיר".to_string(), "חיפה".to_string())]);
        assert!(fx.router.seen_memory().is_empty());

        let reply = fx.handler.handle("מה אתה זוכר?", "u1").await;
        assert!(reply.contains("- עיר: חיפה"));

        assert_eq!(fx.handler.handle("תשכח: עיר", "u1").await, "נמחקו 1 פריטים תחת 'עיר'.");
        assert_eq!(fx.handler.handle("מה אתה זוכר", "u1").await, Locale::He.recall_empty());
    }

    #[tokio::test]
    async fn kill_with_nothing_running() {
        let fx = fixture(Locale::En, json!({}));
        assert_eq!(fx.handler.handle("STOP", "u1").await, Locale::En.nothing_to_stop());
    }

    #[tokio::test]
    async fn kill_drops_a_pending_plan() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 3 }));
        fx.handler.handle("big task", "u1").await;
        assert_eq!(fx.handler.handle("stop", "u1").await, Locale::En.kill_ack());
        assert!(!fx.handler.sessions().has_pending("u1"));
        let reply = fx.handler.handle("yes", "u1").await;
        assert!(reply.starts_with("Approval required"), "yes is now a new request");
    }

    #[tokio::test(start_paused = true)]
    async fn kill_reaches_an_in_flight_run() {
        let fx = fixture_with(
            Locale::En,
            json!({ "autonomy_level": 0 }),
            FnGenerator::fixed("slow answer").with_delay(Duration::from_secs(5)),
            &[],
        );
        let handler = fx.handler.clone();
        let run = tokio::spawn(async move { handler.handle("long question", "u1").await });
        tokio::task::yield_now().await;
        while !fx.handler.sessions().is_active("u1") {
            tokio::task::yield_now().await;
        }

        assert_eq!(fx.handler.handle("stop", "u1").await, Locale::En.kill_ack());
        let reply = run.await.unwrap();
        assert_eq!(reply, Locale::En.stopped());
        assert!(!fx.handler.sessions().is_active("u1"));
    }

    #[tokio::test]
    async fn blocked_escalation_suspends_then_resumes_on_yes() {
        let fx = fixture_with(
            Locale::En,
            json!({ "autonomy_level": 3 }),
            escalating_generator(),
            &[("bash", 5)],
        );

        let reply = fx.handler.handle("inspect repo", "u1").await;
        assert!(reply.starts_with("Approval required"));
        let reply = fx.handler.handle("yes", "u1").await;
        assert!(reply.contains("Step #2 (bash) requires Level 5"), "{reply}");
        assert!(fx.handler.sessions().has_pending("u1"));
        assert!(fx.runner.commands().is_empty());

        let reply = fx.handler.handle("yes", "u1").await;
        assert_eq!(reply, "done");
        assert_eq!(fx.runner.commands(), vec!["ls".to_string()]);
        assert!(!fx.handler.sessions().has_pending("u1"));
    }

    fn escalating_generator() -> FnGenerator {
        FnGenerator::new(|prompt, _| {
            Ok(if prompt.starts_with("You are a step planner") {
                r#"{"steps": [{"intent": "research", "instruction": "look"},
                              {"intent": "bash", "instruction": "ls"},
                              {"intent": "finalize", "instruction": "answer"}]}"#
                    .to_string()
            } else if prompt.starts_with("User request:") {
                "done".to_string()
            } else {
                "notes".to_string()
            })
        })
    }

    #[tokio::test]
    async fn dropping_a_suspended_run_to_a_direct_level_says_so() {
        let fx = fixture_with(
            Locale::En,
            json!({ "autonomy_level": 3 }),
            escalating_generator(),
            &[("bash", 5)],
        );
        fx.handler.handle("inspect repo", "u1").await;
        let reply = fx.handler.handle("yes", "u1").await;
        assert!(reply.contains("Step #2 (bash) requires Level 5"), "{reply}");

        let reply = fx.handler.handle("level 2", "u1").await;
        assert!(reply.starts_with(Locale::En.partial_run_discarded()), "{reply}");
        assert!(fx.runner.commands().is_empty());
        assert!(!fx.handler.sessions().has_pending("u1"));
    }

    #[tokio::test]
    async fn suggested_memory_is_written_once_after_a_resumed_run_finishes() {
        let fx = fixture_with(
            Locale::En,
            json!({
                "autonomy_level": 3,
                "suggest_memory_write": true,
                "memory_to_write": { "type": "fact", "key": "repo", "value": "benjamin" },
            }),
            escalating_generator(),
            &[("bash", 5)],
        );
        fx.handler.handle("inspect repo", "u1").await;
        fx.handler.handle("yes", "u1").await;
        assert!(fx.handler.sessions().has_pending("u1"));
        assert_eq!(fx.store.upserts(), 0, "nothing is written while the run is suspended");

        assert_eq!(fx.handler.handle("yes", "u1").await, "done");
        assert_eq!(fx.store.upserts(), 1);
        assert_eq!(fx.store.values("u1"), vec![("repo".to_string(), "benjamin".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_before_an_escalation_leaves_nothing_pending() {
        let fx = fixture_with(
            Locale::En,
            json!({ "autonomy_level": 3 }),
            escalating_generator().with_delay(Duration::from_secs(5)),
            &[("bash", 5)],
        );
        assert!(fx.handler.handle("inspect repo", "u1").await.starts_with("Approval required"));

        let handler = fx.handler.clone();
        let run = tokio::spawn(async move { handler.handle("yes", "u1").await });
        tokio::task::yield_now().await;
        while !fx.handler.sessions().is_active("u1") {
            tokio::task::yield_now().await;
        }

        assert_eq!(fx.handler.handle("stop", "u1").await, Locale::En.kill_ack());
        assert_eq!(run.await.unwrap(), Locale::En.stopped());
        assert!(!fx.handler.sessions().has_pending("u1"));
        assert!(fx.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn unusable_router_output_falls_back_to_a_direct_answer() {
        let fx = fixture(Locale::He, json!({}));
        fx.router.set_plan(Value::Null);
        assert_eq!(fx.handler.handle("שלום", "u1").await, "answer");
    }

    #[tokio::test]
    async fn router_failure_becomes_apology() {
        let fx = fixture(Locale::He, json!({}));
        fx.router.set_failing();
        assert_eq!(fx.handler.handle("שלום", "u1").await, Locale::He.apology());
        assert!(fx.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn worker_failure_becomes_apology() {
        let fx = fixture_with(
            Locale::En,
            json!({ "autonomy_level": 0 }),
            FnGenerator::new(|_, _| Err(crate::testing::exhausted("worker"))),
            &[],
        );
        assert_eq!(fx.handler.handle("hello", "u1").await, Locale::En.apology());
        assert_eq!(fx.handler.sessions().window_len("u1"), 0);
    }

    #[tokio::test]
    async fn slash_commands_report_and_reset() {
        let fx = fixture(Locale::En, json!({ "autonomy_level": 0 }));
        assert_eq!(fx.handler.handle("/start", "u1").await, Locale::En.greeting());
        fx.handler.handle("hello", "u1").await;
        let status = fx.handler.handle("/status", "u1").await;
        assert!(status.contains("Recent exchanges kept: 1"));
        assert_eq!(fx.handler.handle("/new", "u1").await, Locale::En.conversation_reset());
        assert_eq!(fx.handler.sessions().window_len("u1"), 0);
    }
}

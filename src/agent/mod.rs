//! Orchestration loop
//!
//! USER INPUT → MODEL → (TOOLS → MODEL)* → FINAL ANSWER
//!
//! The orchestrator exclusively owns one `Session` and drives it through
//! `Idle → AwaitingModel → (ExecutingTools → AwaitingModel)* → Idle | Error`.
//! Runs are serialized: a message arriving mid-run is rejected.

use crate::audit::SessionArchive;
use crate::config::OrchestratorConfig;
use crate::conversation::Session;
use crate::error::OrchestrationError;
use crate::execution::{ToolExecutor, ToolObserver};
use crate::gateway::ModelGateway;
use crate::models::{
    ModelRequest, ModelResponse, Part, RequestedCall, RunOutput, SessionStatus, StreamEvent,
    ToolCall, Turn,
};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const STREAM_CAPACITY: usize = 64;

/// Notifications for whatever renders the conversation
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TurnAppended(Turn),
    /// A streaming turn was confirmed or closed
    TurnFinalized(Turn),
    TextDelta { turn_id: Uuid, chunk: String },
    StatusChanged(SessionStatus),
    ToolStarted { name: String },
    ToolFinished { name: String },
    SessionReset { session_id: Uuid },
}

/// Read-only copy of the session, refreshed after every change
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub last_error: Option<String>,
    pub active_tool: Option<String>,
    pub corrupted: bool,
    pub turns: Vec<Turn>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            status: session.status(),
            last_error: session.last_error().map(str::to_string),
            active_tool: session.active_tool().map(str::to_string),
            corrupted: session.is_corrupted(),
            turns: session.snapshot(),
        }
    }
}

/// Forwards executor notifications onto the event channel
struct EventObserver {
    events: broadcast::Sender<SessionEvent>,
}

impl ToolObserver for EventObserver {
    fn on_tool_start(&self, name: &str) {
        self.events
            .send(SessionEvent::ToolStarted {
                name: name.to_string(),
            })
            .ok();
    }

    fn on_tool_end(&self, name: &str) {
        self.events
            .send(SessionEvent::ToolFinished {
                name: name.to_string(),
            })
            .ok();
    }
}

/// What one model call produced
struct ModelTurn {
    response: ModelResponse,
    /// Streaming turn that received text deltas, still open
    streaming_turn: Option<Uuid>,
}

/// Main orchestrator that coordinates a single conversation
pub struct Orchestrator {
    gateway: Arc<dyn ModelGateway>,
    executor: ToolExecutor,
    archive: Arc<SessionArchive>,
    session: Mutex<Session>,
    current_run: Mutex<CancellationToken>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Sender<SessionView>,
    max_tool_rounds: u32,
    streaming: bool,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        executor: ToolExecutor,
        archive: Arc<SessionArchive>,
        config: &OrchestratorConfig,
    ) -> Self {
        let session = Session::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (view, _) = watch::channel(SessionView::from(&session));

        Self {
            gateway,
            executor,
            archive,
            session: Mutex::new(session),
            current_run: Mutex::new(CancellationToken::new()),
            events,
            view,
            max_tool_rounds: config.max_tool_rounds,
            streaming: config.streaming,
        }
    }

    // =============================
    // UI boundary
    // =============================

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.view.borrow().session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.view.borrow().status
    }

    pub fn transcript(&self) -> Vec<Turn> {
        self.view.borrow().turns.clone()
    }

    /// Abort the in-flight run, if any. Returns whether one was running.
    pub async fn cancel(&self) -> bool {
        let token = self.current_run.lock().await;
        let running = self.session.try_lock().is_err();
        if running {
            info!(session_id = %self.session_id(), "Cancelling in-flight run");
            token.cancel();
        }
        running
    }

    /// Discard the current session (archiving it) and start a fresh one.
    pub async fn reset(&self) -> Result<Uuid> {
        self.cancel().await;

        let mut session = self.session.lock().await;
        let old = std::mem::replace(&mut *session, Session::new());
        let new_id = session.id();

        let archived_id = self.archive.store(old).await?;
        info!(archived = %archived_id, session_id = %new_id, "Session reset");

        self.sync_view(&session);
        self.publish(SessionEvent::SessionReset { session_id: new_id });
        Ok(new_id)
    }

    /// Run the loop for one user message
    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<RunOutput> {
        // Token is swapped under the run lock so `cancel` never sees a stale one
        let mut current_run = self.current_run.lock().await;
        let mut session = match self.session.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(session_id = %self.session_id(), "Rejecting message: run in progress");
                return Err(OrchestrationError::SessionBusy(self.session_id()));
            }
        };

        if session.is_corrupted() {
            return Err(OrchestrationError::ConversationCorrupted(session.id()));
        }

        let token = CancellationToken::new();
        *current_run = token.clone();
        drop(current_run);

        let text = text.into();
        info!(session_id = %session.id(), chars = text.len(), "Orchestrator: user message received");

        let result = self.drive(&mut session, text, &token).await;

        if let Some(turn_id) = session.open_streaming_turn() {
            if session.interrupt_turn(turn_id).is_ok() {
                self.publish_turn_closed(&session, turn_id);
            }
        }

        match &result {
            Ok(output) => {
                info!(
                    session_id = %session.id(),
                    rounds = output.tool_rounds,
                    turns = output.turns_appended,
                    "Orchestrator: run complete"
                );
            }
            Err(OrchestrationError::Cancelled) => {
                info!(session_id = %session.id(), "Orchestrator: run cancelled");
                self.set_status(&mut session, SessionStatus::Idle);
            }
            Err(e @ OrchestrationError::PairingViolation(_)) => {
                warn!(session_id = %session.id(), error = %e, "Conversation corrupted");
                session.mark_corrupted();
                session.fail(e.to_string());
                self.sync_view(&session);
                self.publish(SessionEvent::StatusChanged(SessionStatus::Error));
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Orchestrator: run failed");
                session.fail(e.to_string());
                self.sync_view(&session);
                self.publish(SessionEvent::StatusChanged(SessionStatus::Error));
            }
        }

        result
    }

    // =============================
    // Loop
    // =============================

    async fn drive(
        &self,
        session: &mut Session,
        text: String,
        token: &CancellationToken,
    ) -> Result<RunOutput> {
        let start_len = session.len();
        let tools = self.executor.registry().describe_all();

        session.clear_error();
        let history = session.model_history();
        self.append(session, Turn::user(text.clone()))?;
        self.set_status(session, SessionStatus::AwaitingModel);

        let mut request = ModelRequest {
            history,
            tools,
            new_input: vec![Part::Text(text)],
        };
        let mut tool_rounds = 0u32;

        loop {
            debug!(round = tool_rounds, "Calling model");
            let tools = request.tools.clone();
            let ModelTurn {
                response,
                streaming_turn,
            } = self.call_model(session, request, token).await?;

            match response {
                ModelResponse::FinalAnswer { text } => {
                    let answer = text.clone();
                    match streaming_turn {
                        Some(turn_id) => {
                            session.finalize_turn(turn_id, Some(text))?;
                            self.publish_turn_closed(session, turn_id);
                        }
                        None => self.append(session, Turn::model_text(text))?,
                    }
                    self.set_status(session, SessionStatus::Idle);

                    return Ok(RunOutput {
                        session_id: session.id(),
                        answer,
                        tool_rounds,
                        turns_appended: session.len() - start_len,
                    });
                }

                ModelResponse::ToolCallsRequested { calls } => {
                    if tool_rounds >= self.max_tool_rounds {
                        warn!(
                            max_rounds = self.max_tool_rounds,
                            "Model kept requesting tools past the round budget"
                        );
                        return Err(OrchestrationError::LoopBudgetExceeded {
                            max_rounds: self.max_tool_rounds,
                        });
                    }
                    tool_rounds += 1;

                    let calls = assign_call_ids(session.len(), calls);
                    info!(
                        round = tool_rounds,
                        tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                        "Model requested tools"
                    );

                    match streaming_turn {
                        Some(turn_id) => {
                            session.attach_tool_calls(turn_id, calls.clone())?;
                            session.finalize_turn(turn_id, None)?;
                            self.publish_turn_closed(session, turn_id);
                        }
                        None => self.append(session, Turn::model_tool_calls(calls.clone()))?,
                    }

                    self.set_status(session, SessionStatus::ExecutingTools);
                    let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                    session.set_active_tool(Some(names.join(", ")));
                    self.sync_view(session);

                    let observer = EventObserver {
                        events: self.events.clone(),
                    };
                    let results = self.executor.execute_all(&calls, &observer, token).await;

                    let history = session.model_history();
                    let mut new_input = Vec::with_capacity(results.len());
                    for result in results {
                        new_input.push(Part::ToolResult(result.clone()));
                        self.append(session, Turn::tool_result(result))?;
                    }

                    if token.is_cancelled() {
                        return Err(OrchestrationError::Cancelled);
                    }

                    self.set_status(session, SessionStatus::AwaitingModel);
                    request = ModelRequest {
                        history,
                        tools,
                        new_input,
                    };
                }
            }
        }
    }

    /// One gateway call, abortable through `token`. In streaming mode text
    /// deltas land in a provisional model turn as they arrive.
    async fn call_model(
        &self,
        session: &mut Session,
        request: ModelRequest,
        token: &CancellationToken,
    ) -> Result<ModelTurn> {
        if !self.streaming {
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(OrchestrationError::Cancelled),
                response = self.gateway.send(request) => response?,
            };
            return Ok(ModelTurn {
                response,
                streaming_turn: None,
            });
        }

        let (tx, mut rx) = mpsc::channel(STREAM_CAPACITY);
        let mut call = self.gateway.send_streaming(request, tx);
        let mut streaming_turn = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Err(OrchestrationError::Cancelled),
                Some(event) = rx.recv() => {
                    self.apply_stream_event(session, &mut streaming_turn, event)?;
                }
                result = &mut call => break result,
            }
        };

        // Deltas sent just before completion may still be buffered
        while let Ok(event) = rx.try_recv() {
            self.apply_stream_event(session, &mut streaming_turn, event)?;
        }

        Ok(ModelTurn {
            response: result?,
            streaming_turn,
        })
    }

    fn apply_stream_event(
        &self,
        session: &mut Session,
        streaming_turn: &mut Option<Uuid>,
        event: StreamEvent,
    ) -> Result<()> {
        let StreamEvent::TextDelta { chunk } = event else {
            return Ok(());
        };
        if chunk.is_empty() {
            return Ok(());
        }

        let turn_id = match *streaming_turn {
            Some(id) => id,
            None => {
                let id = session.begin_streaming_turn()?;
                if let Some(turn) = session.turns().last() {
                    self.publish(SessionEvent::TurnAppended(turn.clone()));
                }
                *streaming_turn = Some(id);
                id
            }
        };

        session.update_streaming_text(turn_id, &chunk)?;
        self.sync_view(session);
        self.publish(SessionEvent::TextDelta { turn_id, chunk });
        Ok(())
    }

    // =============================
    // Bookkeeping
    // =============================

    fn append(&self, session: &mut Session, turn: Turn) -> Result<()> {
        session.append(turn.clone())?;
        self.sync_view(session);
        self.publish(SessionEvent::TurnAppended(turn));
        Ok(())
    }

    fn set_status(&self, session: &mut Session, status: SessionStatus) {
        session.set_status(status);
        self.sync_view(session);
        self.publish(SessionEvent::StatusChanged(status));
    }

    fn publish_turn_closed(&self, session: &Session, turn_id: Uuid) {
        if let Some(turn) = session.turns().iter().rev().find(|t| t.id == turn_id) {
            self.publish(SessionEvent::TurnFinalized(turn.clone()));
        }
        self.sync_view(session);
    }

    fn sync_view(&self, session: &Session) {
        self.view.send_replace(SessionView::from(session));
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        self.events.send(event).ok();
    }
}

/// Call ids are `<turn ordinal>-<index>`; the ordinal only grows, so ids
/// never repeat within a session.
fn assign_call_ids(ordinal: usize, calls: Vec<RequestedCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| ToolCall {
            call_id: format!("{}-{}", ordinal, index),
            name: call.name,
            args: call.args,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::validate_pairing;
    use crate::gateway::{Scripted, ScriptedGateway};
    use crate::models::{JsonMap, Role, ToolOutcome, ToolResult, TurnState};
    use crate::tools::{create_default_registry, Tool};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct HangingTool;

    #[async_trait::async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "syncBankFeed"
        }

        fn description(&self) -> &str {
            "Waits on a bank that never answers"
        }

        fn arg_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _args: &JsonMap) -> Result<JsonMap> {
            futures::future::pending().await
        }
    }

    impl Orchestrator {
        /// Append turns directly, as if restored from elsewhere
        async fn seed_turns(&self, turns: Vec<Turn>) -> Result<()> {
            let mut session = self.session.lock().await;
            for turn in turns {
                session.append(turn)?;
            }
            self.sync_view(&session);
            Ok(())
        }
    }

    fn tool_calls(names: &[&str]) -> ModelResponse {
        ModelResponse::ToolCallsRequested {
            calls: names
                .iter()
                .map(|n| RequestedCall::new(*n, json!({})))
                .collect(),
        }
    }

    fn answer(text: &str) -> ModelResponse {
        ModelResponse::FinalAnswer {
            text: text.to_string(),
        }
    }

    fn orchestrator_with(
        gateway: Arc<ScriptedGateway>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        let mut registry = create_default_registry().unwrap();
        registry.register(Arc::new(HangingTool)).unwrap();
        let executor = ToolExecutor::new(Arc::new(registry), config.tool_timeout);
        Orchestrator::new(gateway, executor, Arc::new(SessionArchive::new()), &config)
    }

    fn orchestrator(gateway: Arc<ScriptedGateway>) -> Orchestrator {
        orchestrator_with(gateway, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_summarize_finances_scenario() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Respond(tool_calls(&["getFinancialSummary"])),
            Scripted::Respond(answer("Your net worth is $50,000.00")),
        ]));
        let orchestrator = orchestrator(gateway.clone());

        let output = orchestrator
            .send_user_message("Summarize my finances")
            .await
            .unwrap();
        assert_eq!(output.answer, "Your net worth is $50,000.00");
        assert_eq!(output.tool_rounds, 1);

        let transcript = orchestrator.transcript();
        let roles: Vec<Role> = transcript.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Model, Role::ToolResult, Role::Model]);
        assert_eq!(transcript[1].tool_calls().count(), 1);

        let result = transcript[2].tool_results().next().unwrap();
        assert_eq!(result.payload()["summary"]["Net Worth"], json!("$50,000.00"));
        assert_eq!(transcript[3].text(), "Your net worth is $50,000.00");
        assert_ok!(validate_pairing(&transcript));
        assert_eq!(orchestrator.status(), SessionStatus::Idle);

        // Resubmission carries the tool result as new input and the call in history
        let requests = gateway.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[0].new_input, vec![Part::Text("Summarize my finances".into())]);
        assert_eq!(requests[1].history.len(), 2);
        assert!(matches!(requests[1].new_input[0], Part::ToolResult(_)));
        assert!(!requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_loop_budget_terminates_runaway_model() {
        let gateway = Arc::new(ScriptedGateway::repeating(tool_calls(&["getFinancialSummary"])));
        let config = OrchestratorConfig {
            max_tool_rounds: 3,
            ..OrchestratorConfig::default()
        };
        let orchestrator = orchestrator_with(gateway.clone(), config);

        let err = assert_err!(orchestrator.send_user_message("loop forever").await);
        assert!(matches!(err, OrchestrationError::LoopBudgetExceeded { max_rounds: 3 }));

        // Initial call plus one per permitted round
        assert_eq!(gateway.requests().await.len(), 4);

        let view = orchestrator.view();
        assert_eq!(view.status, SessionStatus::Error);
        assert!(view.last_error.unwrap().contains("Loop budget exceeded"));
        // user + 3 × (calls, result)
        assert_eq!(view.turns.len(), 7);
        assert_ok!(validate_pairing(&view.turns));
    }

    #[tokio::test]
    async fn test_fatal_gateway_error_appends_nothing_and_is_resumable() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Fail(OrchestrationError::InvalidRequest("bad schema".into())),
            Scripted::Respond(answer("Hello again")),
        ]));
        let orchestrator = orchestrator(gateway);

        let err = assert_err!(orchestrator.send_user_message("hi").await);
        assert!(matches!(err, OrchestrationError::InvalidRequest(_)));
        assert_eq!(orchestrator.transcript().len(), 1);
        assert_eq!(orchestrator.status(), SessionStatus::Error);

        let output = assert_ok!(orchestrator.send_user_message("hi again").await);
        assert_eq!(output.answer, "Hello again");
        assert_eq!(orchestrator.transcript().len(), 3);
        assert_eq!(orchestrator.view().last_error, None);
    }

    #[tokio::test]
    async fn test_tool_failures_are_fed_back() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Respond(tool_calls(&["getWeather", "getFinancialSummary"])),
            Scripted::Respond(answer("I could not check the weather")),
        ]));
        let orchestrator = orchestrator(gateway.clone());

        assert_ok!(orchestrator.send_user_message("weather and money?").await);

        let requests = gateway.requests().await;
        let Part::ToolResult(first) = &requests[1].new_input[0] else {
            panic!("expected tool result input");
        };
        assert_eq!(first.payload(), json!({ "error": "Tool getWeather not found" }));
        let Part::ToolResult(second) = &requests[1].new_input[1] else {
            panic!("expected tool result input");
        };
        assert!(!second.is_error());
    }

    #[tokio::test]
    async fn test_concurrent_message_rejected() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Scripted::StallAfter(vec![])]));
        let orchestrator = Arc::new(orchestrator(gateway));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send_user_message("first").await })
        };

        while orchestrator.status() != SessionStatus::AwaitingModel {
            tokio::task::yield_now().await;
        }

        let err = assert_err!(orchestrator.send_user_message("second").await);
        assert!(matches!(err, OrchestrationError::SessionBusy(_)));

        assert!(orchestrator.cancel().await);
        let first = running.await.unwrap();
        assert!(matches!(first, Err(OrchestrationError::Cancelled)));
        assert_eq!(orchestrator.status(), SessionStatus::Idle);
        assert_eq!(orchestrator.transcript().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_tools_leaves_abort_markers() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Scripted::Respond(tool_calls(&[
            "getFinancialSummary",
            "syncBankFeed",
        ]))]));
        let orchestrator = Arc::new(orchestrator(gateway.clone()));
        let mut events = orchestrator.subscribe();

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send_user_message("refresh").await })
        };

        loop {
            if let Ok(SessionEvent::ToolStarted { name }) = events.recv().await {
                if name == "syncBankFeed" {
                    break;
                }
            }
        }
        assert!(orchestrator.cancel().await);

        let result = running.await.unwrap();
        assert!(matches!(result, Err(OrchestrationError::Cancelled)));

        let transcript = orchestrator.transcript();
        assert_eq!(transcript.len(), 4);
        let outcomes: Vec<ToolOutcome> = transcript[2..]
            .iter()
            .flat_map(|t| t.tool_results().map(|r| r.outcome.clone()))
            .collect();
        assert!(matches!(outcomes[0], ToolOutcome::Success(_)));
        assert_eq!(outcomes[1], ToolOutcome::Aborted);
        assert_ok!(validate_pairing(&transcript));
        assert_eq!(orchestrator.status(), SessionStatus::Idle);
        assert_eq!(gateway.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_text_is_not_fed_back_until_final() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Stream {
                chunks: vec!["Let me ".into(), "check.".into()],
                then: tool_calls(&["getFinancialSummary"]),
            },
            Scripted::Stream {
                chunks: vec!["Your net worth ".into(), "is $50,000.00".into()],
                then: answer("Your net worth is $50,000.00"),
            },
        ]));
        let config = OrchestratorConfig {
            streaming: true,
            ..OrchestratorConfig::default()
        };
        let orchestrator = orchestrator_with(gateway.clone(), config);
        let mut events = orchestrator.subscribe();

        let output = orchestrator
            .send_user_message("Summarize my finances")
            .await
            .unwrap();
        assert_eq!(output.answer, "Your net worth is $50,000.00");

        let transcript = orchestrator.transcript();
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[1].text(), "Let me check.");
        assert_eq!(transcript[1].tool_calls().count(), 1);
        assert!(transcript.iter().all(|t| t.state == TurnState::Complete));

        let requests = gateway.requests().await;
        assert_eq!(requests[1].history[1].text(), "Let me check.");

        let mut deltas = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::TextDelta { chunk, .. } = event {
                deltas.push(chunk);
            }
        }
        assert_eq!(deltas.concat(), "Let me check.Your net worth is $50,000.00");
    }

    #[tokio::test]
    async fn test_cancelled_stream_is_interrupted() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::StallAfter(vec!["Partial ".into()]),
            Scripted::Respond(answer("Fresh answer")),
        ]));
        let config = OrchestratorConfig {
            streaming: true,
            ..OrchestratorConfig::default()
        };
        let orchestrator = Arc::new(orchestrator_with(gateway.clone(), config));
        let mut events = orchestrator.subscribe();

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send_user_message("hello").await })
        };

        loop {
            if let Ok(SessionEvent::TextDelta { .. }) = events.recv().await {
                break;
            }
        }
        orchestrator.cancel().await;
        assert!(running.await.unwrap().is_err());

        let transcript = orchestrator.transcript();
        assert_eq!(transcript[1].state, TurnState::Interrupted);
        assert_eq!(transcript[1].text(), "Partial ");

        assert_ok!(orchestrator.send_user_message("again").await);
        let requests = gateway.requests().await;
        // The interrupted text never reaches the model
        assert_eq!(requests[1].history.len(), 1);
        assert_eq!(requests[1].history[0].text(), "hello");
    }

    #[tokio::test]
    async fn test_reset_archives_previous_session() {
        let gateway = Arc::new(ScriptedGateway::repeating(answer("ok")));
        let archive = Arc::new(SessionArchive::new());
        let config = OrchestratorConfig::default();
        let executor = ToolExecutor::new(
            Arc::new(create_default_registry().unwrap()),
            config.tool_timeout,
        );
        let orchestrator = Orchestrator::new(gateway, executor, archive.clone(), &config);

        assert_ok!(orchestrator.send_user_message("hi").await);
        let old_id = orchestrator.session_id();

        let new_id = orchestrator.reset().await.unwrap();
        assert_ne!(old_id, new_id);
        assert!(orchestrator.transcript().is_empty());

        let archived = archive.get(old_id).await.unwrap().unwrap();
        assert_eq!(archived.turns.len(), 2);
        assert!(archive.verify_integrity(old_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pairing_violation_corrupts_until_reset() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Respond(tool_calls(&["getFinancialSummary"])),
            Scripted::Respond(answer("Fresh start")),
        ]));
        let orchestrator = orchestrator(gateway);

        // Takes the id the loop assigns next, once the user turn makes the transcript 3 long
        let restored = ToolCall {
            call_id: "3-0".to_string(),
            name: "getFinancialSummary".to_string(),
            args: JsonMap::new(),
        };
        orchestrator
            .seed_turns(vec![
                Turn::model_tool_calls(vec![restored.clone()]),
                Turn::tool_result(ToolResult::failure(&restored, "stale")),
            ])
            .await
            .unwrap();

        let err = assert_err!(orchestrator.send_user_message("again").await);
        assert!(matches!(err, OrchestrationError::PairingViolation(_)));

        let view = orchestrator.view();
        assert!(view.corrupted);
        assert_eq!(view.status, SessionStatus::Error);
        assert_eq!(view.turns.len(), 3);
        assert_ok!(validate_pairing(&view.turns));

        let err = assert_err!(orchestrator.send_user_message("hello?").await);
        assert!(matches!(err, OrchestrationError::ConversationCorrupted(_)));
        assert_eq!(orchestrator.transcript().len(), 3);

        orchestrator.reset().await.unwrap();
        assert!(!orchestrator.view().corrupted);

        let output = assert_ok!(orchestrator.send_user_message("hello").await);
        assert_eq!(output.answer, "Fresh start");
    }

    #[tokio::test]
    async fn test_call_ids_unique_across_messages() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Respond(tool_calls(&["getFinancialSummary"])),
            Scripted::Respond(answer("first")),
            Scripted::Respond(tool_calls(&["getFinancialSummary"])),
            Scripted::Respond(answer("second")),
        ]));
        let orchestrator = orchestrator(gateway);

        assert_ok!(orchestrator.send_user_message("one").await);
        assert_ok!(orchestrator.send_user_message("two").await);

        let transcript = orchestrator.transcript();
        assert_eq!(transcript.len(), 8);
        assert_ok!(validate_pairing(&transcript));
    }

    #[tokio::test]
    async fn test_slow_tool_times_out_without_failing_run() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Scripted::Respond(tool_calls(&["syncBankFeed"])),
            Scripted::Respond(answer("The bank feed is unavailable")),
        ]));
        let config = OrchestratorConfig {
            tool_timeout: Duration::from_millis(20),
            ..OrchestratorConfig::default()
        };
        let orchestrator = orchestrator_with(gateway, config);

        let output = assert_ok!(orchestrator.send_user_message("sync").await);
        assert_eq!(output.answer, "The bank feed is unavailable");

        let transcript = orchestrator.transcript();
        let result = transcript[2].tool_results().next().unwrap();
        assert!(result.is_error());
    }
}

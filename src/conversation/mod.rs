//! Conversation store
//!
//! An append-only log of turns plus the session's auxiliary state.
//! Turn order is the prompt history sent to the model, so nothing here
//! reorders or drops turns. Reset means starting a new `Session`.

use crate::error::OrchestrationError;
use crate::models::{Part, Role, SessionStatus, ToolCall, Turn, TurnState};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One conversation: ordered transcript and status
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    turns: Vec<Turn>,
    status: SessionStatus,
    last_error: Option<String>,
    active_tool: Option<String>,
    corrupted: bool,
    /// call_id → tool name for calls still waiting on a result
    #[serde(skip)]
    pending_calls: HashMap<String, String>,
    /// Every call_id ever issued in this session
    #[serde(skip)]
    issued_calls: HashSet<String>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            turns: Vec::new(),
            status: SessionStatus::Idle,
            last_error: None,
            active_tool: None,
            corrupted: false,
            pending_calls: HashMap::new(),
            issued_calls: HashSet::new(),
        }
    }

    // =============================
    // Transcript
    // =============================

    /// Append a turn. Pairing is checked for the whole turn before anything
    /// is recorded, so a rejected turn leaves the session untouched.
    pub fn append(&mut self, turn: Turn) -> Result<()> {
        self.check_pairing(&turn.parts)?;
        self.register_parts(&turn.parts);
        self.turns.push(turn);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ordered copy of every turn, including ones still streaming.
    /// Later snapshots always extend earlier ones.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    /// Turns the model may see: provisional and interrupted text is excluded
    pub fn model_history(&self) -> Vec<Turn> {
        self.turns.iter().filter(|t| t.is_complete()).cloned().collect()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Calls issued by the model that have no result yet
    pub fn pending_tool_calls(&self) -> usize {
        self.pending_calls.len()
    }

    // =============================
    // Streaming
    // =============================

    /// Open an empty model turn that will receive text deltas
    pub fn begin_streaming_turn(&mut self) -> Result<Uuid> {
        let turn = Turn::streaming_model();
        let id = turn.id;
        self.append(turn)?;
        Ok(id)
    }

    pub fn open_streaming_turn(&self) -> Option<Uuid> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.state == TurnState::Streaming)
            .map(|t| t.id)
    }

    pub fn update_streaming_text(&mut self, turn_id: Uuid, delta: &str) -> Result<()> {
        let turn = self.streaming_turn_mut(turn_id)?;
        match turn.parts.iter_mut().rev().find_map(|p| match p {
            Part::Text(text) => Some(text),
            _ => None,
        }) {
            Some(text) => text.push_str(delta),
            None => turn.parts.push(Part::Text(delta.to_string())),
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attach tool calls to a turn that is still streaming
    pub fn attach_tool_calls(&mut self, turn_id: Uuid, calls: Vec<ToolCall>) -> Result<()> {
        let parts: Vec<Part> = calls.into_iter().map(Part::ToolCall).collect();
        self.streaming_turn_mut(turn_id)?;
        self.check_pairing(&parts)?;
        self.register_parts(&parts);

        let turn = self.streaming_turn_mut(turn_id)?;
        turn.parts.extend(parts);
        Ok(())
    }

    /// Mark a streaming turn complete. `confirmed_text`, when given, replaces
    /// the provisional text accumulated from deltas.
    pub fn finalize_turn(&mut self, turn_id: Uuid, confirmed_text: Option<String>) -> Result<()> {
        let turn = self.streaming_turn_mut(turn_id)?;

        if let Some(text) = confirmed_text {
            turn.parts.retain(|p| !matches!(p, Part::Text(_)));
            turn.parts.insert(0, Part::Text(text));
        }

        let has_calls = turn.parts.iter().any(|p| matches!(p, Part::ToolCall(_)));
        if has_calls {
            turn.parts
                .retain(|p| !matches!(p, Part::Text(t) if t.is_empty()));
        }

        turn.state = TurnState::Complete;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Close a streaming turn without confirming it; its text stays visible
    /// in the transcript but never reaches the model.
    pub fn interrupt_turn(&mut self, turn_id: Uuid) -> Result<()> {
        let turn = self.streaming_turn_mut(turn_id)?;
        turn.state = TurnState::Interrupted;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn streaming_turn_mut(&mut self, turn_id: Uuid) -> Result<&mut Turn> {
        let turn = self
            .turns
            .iter_mut()
            .rev()
            .find(|t| t.id == turn_id)
            .ok_or(OrchestrationError::TurnNotFound(turn_id))?;

        if turn.state != TurnState::Streaming {
            return Err(OrchestrationError::TurnAlreadyFinalized(turn_id));
        }
        Ok(turn)
    }

    // =============================
    // Pairing
    // =============================

    fn check_pairing(&self, parts: &[Part]) -> Result<()> {
        let mut new_calls = HashSet::new();
        let mut answered = HashSet::new();

        for part in parts {
            match part {
                Part::ToolCall(call) => {
                    if self.issued_calls.contains(&call.call_id)
                        || !new_calls.insert(call.call_id.as_str())
                    {
                        return Err(OrchestrationError::PairingViolation(format!(
                            "tool call id {} issued twice",
                            call.call_id
                        )));
                    }
                }
                Part::ToolResult(result) => {
                    match self.pending_calls.get(&result.call_id) {
                        Some(name) if *name == result.name => {}
                        Some(name) => {
                            return Err(OrchestrationError::PairingViolation(format!(
                                "result for {} names tool {} but the call was to {}",
                                result.call_id, result.name, name
                            )));
                        }
                        None => {
                            return Err(OrchestrationError::PairingViolation(format!(
                                "result for {} ({}) has no matching prior tool call",
                                result.call_id, result.name
                            )));
                        }
                    }
                    if !answered.insert(result.call_id.as_str()) {
                        return Err(OrchestrationError::PairingViolation(format!(
                            "tool call {} answered twice",
                            result.call_id
                        )));
                    }
                }
                Part::Text(_) => {}
            }
        }
        Ok(())
    }

    fn register_parts(&mut self, parts: &[Part]) {
        for part in parts {
            match part {
                Part::ToolCall(call) => {
                    self.issued_calls.insert(call.call_id.clone());
                    self.pending_calls
                        .insert(call.call_id.clone(), call.name.clone());
                }
                Part::ToolResult(result) => {
                    self.pending_calls.remove(&result.call_id);
                }
                Part::Text(_) => {}
            }
        }
    }

    // =============================
    // Auxiliary state
    // =============================

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        if status != SessionStatus::ExecutingTools {
            self.active_tool = None;
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record a failure and move to `Error`
    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.set_status(SessionStatus::Error);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn active_tool(&self) -> Option<&str> {
        self.active_tool.as_deref()
    }

    pub fn set_active_tool(&mut self, name: Option<String>) {
        self.active_tool = name;
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn mark_corrupted(&mut self) {
        self.corrupted = true;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a whole transcript: every result answers exactly one earlier call
/// with the same name and call id.
pub fn validate_pairing(turns: &[Turn]) -> Result<()> {
    let mut session = Session::new();
    for turn in turns {
        if turn.role != Role::ToolResult && turn.tool_results().next().is_some() {
            return Err(OrchestrationError::PairingViolation(format!(
                "turn {} carries tool results under role {}",
                turn.id, turn.role
            )));
        }
        session.check_pairing(&turn.parts)?;
        session.register_parts(&turn.parts);
    }
    Ok(())
}

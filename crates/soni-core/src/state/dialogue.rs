//! `DialogueState` y sus componentes.
//!
//! Invariantes (verificables con `check_invariants`):
//! - `flow_id` único dentro del stack; `flow_name` puede repetirse.
//! - Las claves de `flow_slots` son subconjunto de los `flow_id` del stack.
//! - `pending_task ≠ None ⇔ conversation_state ∈ {WAITING_FOR_SLOT,
//!   CONFIRMING}`.
//! - El `current_step` del frame superior coincide con el del estado.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User,
               text: text.into(),
               ts: Utc::now() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant,
               text: text.into(),
               ts: Utc::now() }
    }
}

/// Máquina de estados conversacional. La tabla de adyacencia vive en
/// `StateTransitionValidator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Idle,
    Understanding,
    WaitingForSlot,
    ValidatingSlot,
    ExecutingAction,
    Confirming,
    Completed,
    Error,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "IDLE",
            ConversationState::Understanding => "UNDERSTANDING",
            ConversationState::WaitingForSlot => "WAITING_FOR_SLOT",
            ConversationState::ValidatingSlot => "VALIDATING_SLOT",
            ConversationState::ExecutingAction => "EXECUTING_ACTION",
            ConversationState::Confirming => "CONFIRMING",
            ConversationState::Completed => "COMPLETED",
            ConversationState::Error => "ERROR",
        }
    }
}

/// Marcador de bloqueo: la sesión espera input del usuario para un slot o
/// una confirmación concreta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingTask {
    Collect {
        slot: String,
        attempts: u32,
        /// Re-prompts default ya disparados por vencimiento de `timeout`
        /// (el default es uno solo).
        #[serde(default)]
        reprompts: u32,
    },
    Confirm { step_id: String, attempts: u32 },
    Inform { message: String },
}

/// Un frame del stack de flujos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    /// Id de instancia, estable durante la vida del frame (p.ej.
    /// `book_flight_a3f7`). Nunca se repite entre frames.
    pub flow_id: String,
    /// Nombre de la definición estática.
    pub flow_name: String,
    pub current_step: String,
    pub step_history: Vec<String>,
    /// Contador de ejecuciones por step (protección de bucles).
    #[serde(default)]
    pub executions: HashMap<String, u32>,
    /// slot del hijo → slot del padre; se aplica al hacer pop con éxito.
    #[serde(default)]
    pub output_map: IndexMap<String, String>,
}

impl FlowContext {
    pub fn executions_of(&self, step: &str) -> u32 {
        self.executions.get(step).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub messages: Vec<Message>,
    pub flow_stack: Vec<FlowContext>,
    /// Scope de slots por frame (clave: `flow_id`), no por definición.
    pub flow_slots: HashMap<String, HashMap<String, Value>>,
    /// Valores `session.*`; sobreviven a la cancelación de flujos.
    pub session_slots: HashMap<String, Value>,
    pub pending_task: Option<PendingTask>,
    pub conversation_state: ConversationState,
    /// Step en el que un flujo bloqueado retomará. Refleja el frame superior.
    pub current_step: Option<String>,
    pub turn_count: u32,
    pub last_response: Option<String>,
    /// Bolsa opaca: detalles de error, flags internos, traza compacta.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub language: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl DialogueState {
    pub fn new() -> Self {
        Self { messages: Vec::new(),
               flow_stack: Vec::new(),
               flow_slots: HashMap::new(),
               session_slots: HashMap::new(),
               pending_task: None,
               conversation_state: ConversationState::Idle,
               current_step: None,
               turn_count: 0,
               last_response: None,
               metadata: Map::new(),
               language: None,
               last_activity: Utc::now() }
    }

    /// Frame activo (tope del stack).
    pub fn top(&self) -> Option<&FlowContext> {
        self.flow_stack.last()
    }

    /// Slots del frame activo.
    pub fn top_slots(&self) -> Option<&HashMap<String, Value>> {
        self.top().and_then(|f| self.flow_slots.get(&f.flow_id))
    }

    /// Valor de un slot en el frame activo.
    pub fn get_slot(&self, name: &str) -> Option<&Value> {
        self.top_slots().and_then(|slots| slots.get(name))
    }

    /// ¿El slot del frame activo tiene valor no nulo?
    pub fn slot_filled(&self, name: &str) -> bool {
        self.get_slot(name).is_some_and(|v| !v.is_null())
    }

    /// Verifica los invariantes universales del estado. Pensado para tests y
    /// `debug_assert!` tras cada turno.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for frame in &self.flow_stack {
            if !seen.insert(frame.flow_id.as_str()) {
                return Err(format!("duplicate flow_id '{}' in stack", frame.flow_id));
            }
        }
        for key in self.flow_slots.keys() {
            if !seen.contains(key.as_str()) {
                return Err(format!("flow_slots key '{key}' has no frame"));
            }
        }
        let blocked = matches!(self.conversation_state,
                               ConversationState::WaitingForSlot | ConversationState::Confirming);
        if self.pending_task.is_some() != blocked {
            return Err(format!("pending_task={:?} inconsistent with conversation_state={:?}",
                               self.pending_task, self.conversation_state));
        }
        if let Some(top) = self.top() {
            if self.current_step.as_deref() != Some(top.current_step.as_str()) {
                return Err(format!("state.current_step={:?} but top frame is at '{}'",
                                   self.current_step, top.current_step));
            }
        }
        Ok(())
    }
}

impl Default for DialogueState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = DialogueState::new();
        state.flow_stack.push(FlowContext { flow_id: "book_a1b2".into(),
                                            flow_name: "book".into(),
                                            current_step: "ask_origin".into(),
                                            step_history: vec!["ask_origin".into()],
                                            executions: HashMap::from([("ask_origin".into(), 1)]),
                                            output_map: IndexMap::new() });
        state.current_step = Some("ask_origin".into());
        state.flow_slots.insert("book_a1b2".into(), HashMap::from([("origin".into(), json!("Madrid"))]));
        state.pending_task = Some(PendingTask::Collect { slot: "destination".into(),
                                                         attempts: 0,
                                                         reprompts: 0 });
        state.conversation_state = ConversationState::WaitingForSlot;

        let text = serde_json::to_string(&state).expect("serialize");
        let back: DialogueState = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(state, back);
        back.check_invariants().expect("invariants");
    }

    #[test]
    fn invariants_catch_orphan_flow_slots() {
        let mut state = DialogueState::new();
        state.flow_slots.insert("ghost".into(), HashMap::new());
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn invariants_tie_pending_task_to_state() {
        let mut state = DialogueState::new();
        state.pending_task = Some(PendingTask::Collect { slot: "x".into(),
                                                         attempts: 0,
                                                         reprompts: 0 });
        assert!(state.check_invariants().is_err());
        state.conversation_state = ConversationState::WaitingForSlot;
        state.check_invariants().expect("now consistent");
    }
}

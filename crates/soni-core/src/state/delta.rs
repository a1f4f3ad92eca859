//! `FlowDelta`: descripción inmutable de una mutación de estado.
//!
//! Los executors producen deltas; el runtime los aplica atómicamente vía
//! `FlowManager::apply`. Un delta vacío aplicado a un estado devuelve un
//! estado igual (idempotencia).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::state::{ConversationState, PendingTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotScope {
    /// Frame activo (clave `flow_id` del tope del stack).
    Flow,
    /// `session.*`.
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotUpdate {
    pub scope: SlotScope,
    pub name: String,
    /// `null` borra el slot (colecta con `force`).
    pub value: Value,
}

/// Petición de push de un flujo nuevo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPush {
    pub flow_name: String,
    /// Primer step real del grafo compilado del flujo.
    pub entry_step: String,
    /// Valores iniciales de slots del hijo.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// slot del hijo → slot del padre (propagación al pop).
    #[serde(default)]
    pub output_map: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopMode {
    /// Propaga los outputs declarados al padre.
    Complete,
    /// Sin propagación.
    Cancel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDelta {
    #[serde(default)]
    pub slot_updates: Vec<SlotUpdate>,
    #[serde(default)]
    pub flow_pop: Option<PopMode>,
    #[serde(default)]
    pub flow_push: Option<FlowPush>,
    /// Nuevo `current_step` del frame activo tras aplicar pop/push.
    #[serde(default)]
    pub step_advance: Option<String>,
    /// `Some(None)` limpia la tarea pendiente; `None` no la toca.
    #[serde(default)]
    pub task: Option<Option<PendingTask>>,
    #[serde(default)]
    pub conversation_state: Option<ConversationState>,
    /// Mensajes salientes producidos por el nodo, en orden.
    #[serde(default)]
    pub messages: Vec<String>,
    /// Pares clave/valor a fusionar en `metadata`.
    #[serde(default)]
    pub metadata: Vec<(String, Value)>,
}

impl FlowDelta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn with_slot(mut self, scope: SlotScope, name: impl Into<String>, value: Value) -> Self {
        self.slot_updates.push(SlotUpdate { scope,
                                            name: name.into(),
                                            value });
        self
    }

    pub fn with_advance(mut self, step: impl Into<String>) -> Self {
        self.step_advance = Some(step.into());
        self
    }

    pub fn with_task(mut self, task: Option<PendingTask>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_state(mut self, state: ConversationState) -> Self {
        self.conversation_state = Some(state);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn with_push(mut self, push: FlowPush) -> Self {
        self.flow_push = Some(push);
        self
    }

    pub fn with_pop(mut self, mode: PopMode) -> Self {
        self.flow_pop = Some(mode);
        self
    }

    /// Variables `_error*` seteadas como grupo (atómicas dentro del delta).
    pub fn with_error_vars(mut self, failure: &crate::errors::ActionFailure) -> Self {
        self.slot_updates.push(SlotUpdate { scope: SlotScope::Flow,
                                            name: "_error".into(),
                                            value: Value::Bool(true) });
        self.slot_updates.push(SlotUpdate { scope: SlotScope::Flow,
                                            name: "_error_type".into(),
                                            value: Value::String(failure.kind.as_str().to_string()) });
        self.slot_updates.push(SlotUpdate { scope: SlotScope::Flow,
                                            name: "_error_message".into(),
                                            value: Value::String(failure.message.clone()) });
        self.slot_updates.push(SlotUpdate { scope: SlotScope::Flow,
                                            name: "_error_code".into(),
                                            value: failure.code
                                                          .clone()
                                                          .map(Value::String)
                                                          .unwrap_or(Value::Null) });
        self.slot_updates.push(SlotUpdate { scope: SlotScope::Flow,
                                            name: "_error_details".into(),
                                            value: failure.details.clone() });
        self
    }
}

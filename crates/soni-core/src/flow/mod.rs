//! Gestor del stack de flujos.
//!
//! Responsable de:
//! - Generar `flow_id` frescos y mantener la unicidad dentro del stack.
//! - push/pop/cancel con propagación de outputs declarados al padre.
//! - Acceso a slots del frame activo (el scope es el frame, no la
//!   definición).
//! - Aplicar `FlowDelta`s de forma atómica (`apply`), validando las
//!   transiciones de la máquina conversacional.
//!
//! Todas las operaciones devuelven un estado nuevo; ninguna muta en sitio.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use soni_dsl::{FlowManagementSettings, OnLimitReached};

use crate::errors::RuntimeError;
use crate::state::{ConversationState, DialogueState, FlowContext, FlowDelta, FlowPush, PopMode, SlotScope,
                   StateTransitionValidator};

pub struct FlowManager {
    max_stack_depth: usize,
    on_limit: OnLimitReached,
}

impl FlowManager {
    pub fn new(settings: &FlowManagementSettings) -> Self {
        Self { max_stack_depth: settings.max_stack_depth,
               on_limit: settings.on_limit_reached }
    }

    pub fn depth(&self, state: &DialogueState) -> usize {
        state.flow_stack.len()
    }

    /// Id de instancia: `<nombre>_<sufijo hex>`, único dentro del stack.
    fn fresh_flow_id(&self, state: &DialogueState, flow_name: &str) -> String {
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("{}_{}", flow_name, &suffix[..4]);
            if !state.flow_stack.iter().any(|f| f.flow_id == id) {
                return id;
            }
        }
    }

    /// Crea un frame nuevo y lo apila. Devuelve el estado resultante y el
    /// `flow_id` generado. En overflow aplica la política configurada.
    pub fn push(&self, state: &DialogueState, push: &FlowPush) -> Result<(DialogueState, String), RuntimeError> {
        let mut next = state.clone();
        if next.flow_stack.len() >= self.max_stack_depth {
            match self.on_limit {
                OnLimitReached::RejectNew => {
                    return Err(RuntimeError::MaxStackDepth { depth: next.flow_stack.len() });
                }
                OnLimitReached::CancelOldest => {
                    let oldest = next.flow_stack.remove(0);
                    next.flow_slots.remove(&oldest.flow_id);
                    log::warn!("flow stack full, cancelled oldest frame '{}'", oldest.flow_id);
                }
            }
        }

        let flow_id = self.fresh_flow_id(&next, &push.flow_name);
        let mut slots: HashMap<String, Value> = HashMap::new();
        for (name, value) in &push.inputs {
            slots.insert(name.clone(), value.clone());
        }
        next.flow_slots.insert(flow_id.clone(), slots);
        next.flow_stack.push(FlowContext { flow_id: flow_id.clone(),
                                           flow_name: push.flow_name.clone(),
                                           current_step: push.entry_step.clone(),
                                           step_history: Vec::new(),
                                           executions: HashMap::new(),
                                           output_map: push.output_map.clone() });
        next.current_step = Some(push.entry_step.clone());
        Ok((next, flow_id))
    }

    /// Quita el frame superior. `Complete` propaga los outputs declarados al
    /// padre según el `output_map` del frame; `Cancel` no propaga. En ambos
    /// casos los slots del frame se descartan.
    pub fn pop(&self, state: &DialogueState, mode: PopMode) -> DialogueState {
        let mut next = state.clone();
        let Some(frame) = next.flow_stack.pop() else {
            return next;
        };
        let child_slots = next.flow_slots.remove(&frame.flow_id).unwrap_or_default();

        if mode == PopMode::Complete {
            if let Some(parent) = next.flow_stack.last() {
                let parent_id = parent.flow_id.clone();
                for (child_slot, parent_slot) in &frame.output_map {
                    if let Some(value) = child_slots.get(child_slot) {
                        next.flow_slots
                            .entry(parent_id.clone())
                            .or_default()
                            .insert(parent_slot.clone(), value.clone());
                    }
                }
            }
        }

        next.current_step = next.flow_stack.last().map(|f| f.current_step.clone());
        next
    }

    /// `pop` sin propagación de outputs.
    pub fn cancel(&self, state: &DialogueState) -> DialogueState {
        self.pop(state, PopMode::Cancel)
    }

    /// Escribe un slot en el frame activo. Sin frame activo no hay scope de
    /// flujo: el valor se descarta con un log (los `session.*` van por
    /// `SlotScope::Session`).
    pub fn set_slot(&self, state: &DialogueState, name: &str, value: Value) -> DialogueState {
        let mut next = state.clone();
        match next.flow_stack.last() {
            Some(frame) => {
                let id = frame.flow_id.clone();
                if value.is_null() {
                    if let Some(slots) = next.flow_slots.get_mut(&id) {
                        slots.remove(name);
                    }
                } else {
                    next.flow_slots.entry(id).or_default().insert(name.to_string(), value);
                }
            }
            None => log::debug!("set_slot('{name}') with empty stack, dropped"),
        }
        next
    }

    pub fn get_slot<'a>(&self, state: &'a DialogueState, name: &str) -> Option<&'a Value> {
        state.get_slot(name)
    }

    /// Aplica un delta de forma atómica. Orden: transición de estado →
    /// slots → pop → push → avance de step → tarea pendiente → mensajes →
    /// metadata. Un delta vacío devuelve un estado igual.
    pub fn apply(&self, state: &DialogueState, delta: &FlowDelta) -> Result<DialogueState, RuntimeError> {
        let mut next = state.clone();

        if let Some(to) = delta.conversation_state {
            StateTransitionValidator::ensure(next.conversation_state, to)?;
            next.conversation_state = to;
        }

        for update in &delta.slot_updates {
            match update.scope {
                SlotScope::Flow => {
                    next = self.set_slot(&next, &update.name, update.value.clone());
                }
                SlotScope::Session => {
                    if update.value.is_null() {
                        next.session_slots.remove(&update.name);
                    } else {
                        next.session_slots.insert(update.name.clone(), update.value.clone());
                    }
                }
            }
        }

        if let Some(mode) = delta.flow_pop {
            next = self.pop(&next, mode);
        }

        if let Some(push) = &delta.flow_push {
            let (pushed, _) = self.push(&next, push)?;
            next = pushed;
        }

        if let Some(step) = &delta.step_advance {
            if let Some(frame) = next.flow_stack.last_mut() {
                if frame.current_step != *step {
                    frame.step_history.push(frame.current_step.clone());
                }
                frame.current_step = step.clone();
                next.current_step = Some(step.clone());
            }
        }

        if let Some(task) = &delta.task {
            next.pending_task = task.clone();
        }

        for text in &delta.messages {
            next.messages.push(crate::state::Message::assistant(text.clone()));
            next.last_response = Some(text.clone());
        }

        for (key, value) in &delta.metadata {
            next.metadata.insert(key.clone(), value.clone());
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soni_dsl::FlowManagementSettings;

    fn manager(depth: usize, on_limit: OnLimitReached) -> FlowManager {
        FlowManager::new(&FlowManagementSettings { max_stack_depth: depth,
                                                   on_limit_reached: on_limit })
    }

    fn push_for(name: &str) -> FlowPush {
        FlowPush { flow_name: name.into(),
                   entry_step: "first".into(),
                   inputs: HashMap::new(),
                   output_map: indexmap::IndexMap::new() }
    }

    #[test]
    fn push_creates_unique_frame_ids() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let (state, id1) = fm.push(&state, &push_for("book")).expect("push 1");
        let (state, id2) = fm.push(&state, &push_for("book")).expect("push 2");
        assert_ne!(id1, id2);
        assert_eq!(state.flow_stack.len(), 2);
        assert!(state.flow_slots.contains_key(&id1));
        assert!(state.flow_slots.contains_key(&id2));
        state.check_invariants().expect("invariants");
    }

    #[test]
    fn pop_complete_propagates_outputs() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let (state, _parent) = fm.push(&state, &push_for("book")).expect("push parent");
        let mut child = push_for("collect_payment");
        child.output_map.insert("receipt".to_string(), "payment_receipt".to_string());
        let (state, _child) = fm.push(&state, &child).expect("push child");

        let state = fm.set_slot(&state, "receipt", json!("r-42"));
        let state = fm.pop(&state, PopMode::Complete);

        assert_eq!(state.flow_stack.len(), 1);
        assert_eq!(state.get_slot("payment_receipt"), Some(&json!("r-42")));
        assert_eq!(state.flow_slots.len(), 1);
    }

    #[test]
    fn cancel_discards_outputs() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let (state, _) = fm.push(&state, &push_for("book")).expect("push parent");
        let mut child = push_for("collect_payment");
        child.output_map.insert("receipt".to_string(), "payment_receipt".to_string());
        let (state, _) = fm.push(&state, &child).expect("push child");
        let state = fm.set_slot(&state, "receipt", json!("r-42"));

        let state = fm.cancel(&state);
        assert_eq!(state.get_slot("payment_receipt"), None);
    }

    #[test]
    fn depth_limit_reject_new() {
        let fm = manager(1, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let (state, _) = fm.push(&state, &push_for("a")).expect("push");
        let err = fm.push(&state, &push_for("b")).unwrap_err();
        assert!(matches!(err, RuntimeError::MaxStackDepth { depth: 1 }));
    }

    #[test]
    fn depth_limit_cancel_oldest() {
        let fm = manager(2, OnLimitReached::CancelOldest);
        let state = DialogueState::new();
        let (state, id_a) = fm.push(&state, &push_for("a")).expect("push a");
        let (state, _) = fm.push(&state, &push_for("b")).expect("push b");
        let (state, _) = fm.push(&state, &push_for("c")).expect("push c");
        assert_eq!(state.flow_stack.len(), 2);
        assert!(!state.flow_stack.iter().any(|f| f.flow_id == id_a));
        assert!(!state.flow_slots.contains_key(&id_a));
    }

    #[test]
    fn apply_empty_delta_is_identity() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let next = fm.apply(&state, &FlowDelta::empty()).expect("apply");
        assert_eq!(state, next);
    }

    #[test]
    fn apply_rejects_invalid_transition() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new(); // IDLE
        let delta = FlowDelta::empty().with_state(ConversationState::Completed);
        let err = fm.apply(&state, &delta).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidStateTransition { .. }));
    }

    #[test]
    fn apply_session_scope_survives_pop() {
        let fm = manager(8, OnLimitReached::RejectNew);
        let state = DialogueState::new();
        let (state, _) = fm.push(&state, &push_for("book")).expect("push");
        let delta = FlowDelta::empty().with_slot(SlotScope::Session, "user_tier", json!("gold"));
        let state = fm.apply(&state, &delta).expect("apply");
        let state = fm.cancel(&state);
        assert_eq!(state.session_slots.get("user_tier"), Some(&json!("gold")));
    }
}

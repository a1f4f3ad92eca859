//! Scoping dinámico de comandos.
//!
//! Antes de cada llamada al NLU el core calcula el conjunto de
//! flujos/acciones *disponibles* desde el estado actual: los flujos con
//! trigger (interrupciones globales), los slots aún sin llenar del frame
//! activo y si hay algo que cancelar. Ese conjunto es el único vocabulario
//! que el NLU puede emitir; cualquier otro comando se mapea a `out_of_scope`
//! y dispara el flujo de fallback.

use crate::graph::{CompiledConfig, NodeKind};
use crate::nlu::NluContext;
use crate::state::DialogueState;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandScope {
    pub flows: Vec<String>,
    pub expected_slots: Vec<String>,
    pub can_cancel: bool,
}

impl CommandScope {
    pub fn permits_flow(&self, name: &str) -> bool {
        self.flows.iter().any(|f| f == name)
    }

    pub fn to_nlu_context(&self, state: &DialogueState) -> NluContext {
        let waiting_slot = match &state.pending_task {
            Some(crate::state::PendingTask::Collect { slot, .. }) => Some(slot.clone()),
            _ => None,
        };
        NluContext { available_flows: self.flows.clone(),
                     expected_slots: self.expected_slots.clone(),
                     waiting_slot,
                     can_cancel: self.can_cancel,
                     language: state.language.clone() }
    }
}

/// Conjunto de comandos admisibles en el punto actual del diálogo.
pub fn available_commands(state: &DialogueState, config: &CompiledConfig) -> CommandScope {
    // Interrupciones globales: todo flujo con trigger declarado.
    let mut flows: Vec<String> = config.document
                                       .flows
                                       .iter()
                                       .filter(|(_, def)| def.trigger.is_some())
                                       .map(|(name, _)| name.clone())
                                       .collect();
    if let Some(fallback) = &config.document.settings.conversation.fallback_flow {
        if !flows.contains(fallback) {
            flows.push(fallback.clone());
        }
    }

    // Slots pendientes del frame activo: los de sus `collect` sin valor.
    let mut expected_slots = Vec::new();
    if let Some(top) = state.top() {
        if let Some(graph) = config.graphs.get(&top.flow_name) {
            for node in &graph.nodes {
                if let NodeKind::Collect(collect) = &node.kind {
                    if !state.slot_filled(&collect.slot) && !expected_slots.contains(&collect.slot) {
                        expected_slots.push(collect.slot.clone());
                    }
                }
            }
        }
    }

    CommandScope { flows,
                   expected_slots,
                   can_cancel: !state.flow_stack.is_empty() }
}

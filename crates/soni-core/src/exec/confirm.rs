//! Executor de `confirm`.
//!
//! Entrada: emite el prompt y suspende con `ConfirmTask`. Reanudación: el
//! NLU clasifica la respuesta (confirmar, negar, corregir, modificar,
//! cancelar); el executor aplica la actualización de slot si la hay y enruta
//! con prioridad `on_correction`/`on_modification` > `on_change` >
//! `on_yes`/`on_no`. Sin target declarado: sí → sucesor secuencial, no →
//! cancelación del flujo; una corrección sin target re-ejecuta el confirm
//! para re-mostrar el prompt con los valores nuevos.

use serde_json::Value;

use crate::exec::{ExecOutcome, RuntimeContext, StateResolver, SuspendReason};
use crate::expr::render_template;
use crate::graph::{ConfirmNode, Node, Target};
use crate::nlu::NluCommand;
use crate::responses::resolve_response;
use crate::state::{ConversationState, DialogueState, FlowDelta, PendingTask, SlotScope};

pub(crate) fn execute(node: &Node,
                      confirm: &ConfirmNode,
                      state: &DialogueState,
                      ctx: &RuntimeContext<'_>)
                      -> ExecOutcome {
    let resolver = StateResolver { state };
    let prompt = match (&confirm.message, &confirm.response) {
        (Some(message), _) => render_template(message, &resolver),
        (None, Some(key)) => {
            let resolved = resolve_response(&ctx.config.document, key, state.language.as_deref(), state.turn_count);
            render_template(&resolved, &resolver)
        }
        (None, None) => String::new(),
    };

    let attempts = match &state.pending_task {
        Some(PendingTask::Confirm { step_id, attempts }) if *step_id == node.step_id => *attempts,
        _ => 0,
    };

    let delta = FlowDelta::empty().with_message(prompt)
                                  .with_task(Some(PendingTask::Confirm { step_id: node.step_id.clone(),
                                                                         attempts }))
                                  .with_state(ConversationState::Confirming);
    ExecOutcome::Suspend { delta,
                           reason: SuspendReason::WaitingForConfirmation }
}

/// Resultado de reanudar un `confirm` con un comando clasificado.
#[derive(Debug)]
pub enum ConfirmResume {
    /// Seguir el grafo hacia `to` tras aplicar `delta`.
    Route { delta: FlowDelta, to: Target },
    /// Re-ejecutar el nodo de confirmación (re-mostrar con datos nuevos).
    ReExecute { delta: FlowDelta },
}

pub fn resume_confirm(node: &Node, confirm: &ConfirmNode, command: &NluCommand) -> ConfirmResume {
    match command {
        NluCommand::ConfirmYes => {
            let delta = FlowDelta::empty().with_task(None)
                                          .with_state(ConversationState::ExecutingAction);
            ConfirmResume::Route { delta,
                                   to: confirm.on_yes.unwrap_or(node.next) }
        }
        NluCommand::ConfirmNo => {
            let delta = FlowDelta::empty().with_task(None)
                                          .with_state(ConversationState::ExecutingAction);
            ConfirmResume::Route { delta,
                                   to: confirm.on_no.unwrap_or(Target::CancelFlow) }
        }
        NluCommand::Correct { slot, value } => {
            apply_update(slot, value, confirm.on_correction.or(confirm.on_change))
        }
        NluCommand::Modify { slot, value } => {
            apply_update(slot, value, confirm.on_modification.or(confirm.on_change))
        }
        other => {
            log::debug!("confirm '{}' received non-confirmation command {other:?}, re-prompting", node.step_id);
            ConfirmResume::ReExecute { delta: FlowDelta::empty().with_task(None) }
        }
    }
}

fn apply_update(slot: &str, value: &Value, target: Option<Target>) -> ConfirmResume {
    let delta = FlowDelta::empty().with_slot(SlotScope::Flow, slot, value.clone());
    match target {
        Some(to) => {
            let delta = delta.with_task(None).with_state(ConversationState::ExecutingAction);
            ConfirmResume::Route { delta, to }
        }
        // Sin target: el confirm se re-muestra con el slot corregido. La
        // tarea se limpia para que el nodo la recree al re-ejecutarse.
        None => ConfirmResume::ReExecute { delta: delta.with_task(None) },
    }
}

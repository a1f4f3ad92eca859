//! Orquestador de comandos NLU.
//!
//! Determinista: los comandos se aplican en prioridad fija — `CancelFlow`
//! antes que `StartFlow` antes que `SetSlot` antes que `Confirm*` — sin
//! importar el orden en que el NLU los emitió. Cada mutación produce un
//! `FlowDelta` que se fusiona en el estado antes de ejecutar el grafo.

use serde_json::Value;

use crate::errors::RuntimeError;
use crate::exec::RuntimeContext;
use crate::nlu::{CommandScope, FullUnderstanding, NluCommand};
use crate::registry::SlotContext;
use crate::responses::resolve_response;
use crate::runtime::engine::apply_and_emit;
use crate::runtime::TurnSink;
use crate::state::{ConversationState, DialogueState, FlowDelta, FlowPush, SlotScope};

/// Mapea el entendimiento completo al vocabulario permitido. Un comando
/// fuera del scope se degrada a `OutOfScope` (flujo de fallback).
pub(crate) fn map_full_understanding(fu: &FullUnderstanding,
                                     scope: &CommandScope,
                                     ctx: &RuntimeContext<'_>)
                                     -> Vec<NluCommand> {
    let mut commands = Vec::new();

    if let Some(name) = &fu.command {
        if scope.permits_flow(name) {
            commands.push(NluCommand::StartFlow { flow: name.clone() });
        } else {
            log::debug!("nlu command '{name}' outside scope, mapping to out_of_scope");
            commands.push(NluCommand::OutOfScope);
        }
    }

    for (slot, value) in &fu.slots {
        // Slots desconocidos por el documento se descartan sin drama.
        if ctx.config.document.slot(slot).is_some() || slot.starts_with("session.") {
            commands.push(NluCommand::SetSlot { name: slot.clone(),
                                                value: value.clone() });
        } else {
            log::debug!("nlu produced undeclared slot '{slot}', dropped");
        }
    }

    commands
}

/// Aplica los comandos en orden de prioridad. Devuelve el estado resultante.
pub(crate) async fn apply_commands(state: &DialogueState,
                                   ctx: &RuntimeContext<'_>,
                                   sink: &mut TurnSink<'_>,
                                   commands: Vec<NluCommand>)
                                   -> Result<DialogueState, RuntimeError> {
    let mut state = state.clone();
    let mut ordered = commands;
    ordered.sort_by_key(|c| c.priority());

    for command in ordered {
        state = apply_one(&state, ctx, sink, command).await?;
    }
    Ok(state)
}

async fn apply_one(state: &DialogueState,
                   ctx: &RuntimeContext<'_>,
                   sink: &mut TurnSink<'_>,
                   command: NluCommand)
                   -> Result<DialogueState, RuntimeError> {
    match command {
        NluCommand::CancelFlow => cancel_active_flow(state, ctx, sink).await,
        NluCommand::StartFlow { flow } | NluCommand::Digression { flow } => {
            match start_flow(state, ctx, &flow) {
                Ok(next) => Ok(next),
                // `reject_new`: el flujo nuevo se rechaza, la sesión sigue.
                Err(RuntimeError::MaxStackDepth { depth }) => {
                    log::warn!("rejected start of '{flow}' at stack depth {depth}");
                    let text = resolve_response(&ctx.config.document, "error", state.language.as_deref(),
                                                state.turn_count);
                    let text = if text == "error" { "I can't start anything else right now.".to_string() } else { text };
                    apply_and_emit(state, ctx, sink, &FlowDelta::empty().with_message(text)).await
                }
                Err(e) => Err(e),
            }
        }
        NluCommand::OutOfScope => {
            match ctx.settings().conversation.fallback_flow.clone() {
                Some(fallback) => start_flow(state, ctx, &fallback),
                None => {
                    let text = resolve_response(&ctx.config.document, "out_of_scope", state.language.as_deref(),
                                                state.turn_count);
                    let text = if text == "out_of_scope" { "Sorry, I can't help with that.".to_string() } else { text };
                    apply_and_emit(state, ctx, sink, &FlowDelta::empty().with_message(text)).await
                }
            }
        }
        NluCommand::SetSlot { name, value } => set_slot(state, ctx, &name, value).await,
        // Confirm*/Correct/Modify sólo tienen sentido reanudando un confirm;
        // el router los encamina por esa vía y nunca llegan aquí.
        other => {
            log::debug!("orchestrator ignoring command {other:?} outside confirmation");
            Ok(state.clone())
        }
    }
}

/// Cancela el frame superior y lo confirma al usuario. Si el padre estaba
/// detenido en un `call_flow`, queda avanzado más allá de ese nodo y el
/// driver lo continúa.
pub(crate) async fn cancel_active_flow(state: &DialogueState,
                                       ctx: &RuntimeContext<'_>,
                                       sink: &mut TurnSink<'_>)
                                       -> Result<DialogueState, RuntimeError> {
    if state.flow_stack.is_empty() {
        return Ok(state.clone());
    }

    let text = resolve_response(&ctx.config.document, "cancellation_acknowledged", state.language.as_deref(),
                                state.turn_count);
    let text = if text == "cancellation_acknowledged" { "Okay, cancelled.".to_string() } else { text };

    let mut delta = FlowDelta::empty().with_task(None).with_message(text);
    if matches!(state.conversation_state,
                ConversationState::WaitingForSlot | ConversationState::Confirming | ConversationState::ValidatingSlot)
    {
        delta = delta.with_state(ConversationState::Understanding);
    }
    let state = apply_and_emit(state, ctx, sink, &delta).await?;

    let moved = crate::runtime::engine::goto_target(&state, ctx, sink, crate::graph::Target::CancelFlow).await?;
    crate::runtime::engine::drive(moved.state, ctx, sink).await
}

fn start_flow(state: &DialogueState, ctx: &RuntimeContext<'_>, flow: &str) -> Result<DialogueState, RuntimeError> {
    let graph = ctx.config
                   .graphs
                   .get(flow)
                   .ok_or_else(|| RuntimeError::UnknownFlow(flow.to_string()))?;
    let entry = graph.entry_step()
                     .ok_or_else(|| RuntimeError::Internal(format!("flow '{flow}' has no entry step")))?;

    // Outputs declarados del flujo: propagación por nombre al padre.
    let output_map = graph.outputs
                          .iter()
                          .map(|name| (name.clone(), name.clone()))
                          .collect();

    let push = FlowPush { flow_name: flow.to_string(),
                          entry_step: entry.to_string(),
                          inputs: Default::default(),
                          output_map };
    let (mut next, flow_id) = ctx.flow_manager.push(state, &push)?;
    // Un push desde un estado bloqueado (digresión) desplaza la tarea
    // pendiente: el frame interrumpido la recreará al retomar su collect.
    next.pending_task = None;
    log::debug!("started flow '{flow}' as frame '{flow_id}'");
    Ok(next)
}

/// Escribe un slot emitido por el NLU. Se aplica el normalizador del slot si
/// existe; la validación con reintentos queda para el camino de `collect`.
async fn set_slot(state: &DialogueState,
                  ctx: &RuntimeContext<'_>,
                  name: &str,
                  value: Value)
                  -> Result<DialogueState, RuntimeError> {
    if let Some(rest) = name.strip_prefix("session.") {
        let delta = FlowDelta::empty().with_slot(SlotScope::Session, rest, value);
        return ctx.flow_manager.apply(state, &delta);
    }

    let value = match ctx.config.document.slot(name) {
        Some(slot_def) => match &slot_def.normalizer {
            Some(normalizer_name) => {
                let slot_ctx = SlotContext { slot: name.to_string(),
                                             slot_type: slot_def.slot_type,
                                             language: state.language.clone() };
                normalize_best_effort(ctx, normalizer_name, &slot_ctx, value).await
            }
            None => value,
        },
        None => value,
    };

    let delta = FlowDelta::empty().with_slot(SlotScope::Flow, name, value);
    ctx.flow_manager.apply(state, &delta)
}

async fn normalize_best_effort(ctx: &RuntimeContext<'_>,
                               normalizer_name: &str,
                               slot_ctx: &SlotContext,
                               raw: Value)
                               -> Value {
    if let Some(cached) = ctx.registries.normalization_cache.get(normalizer_name, &raw) {
        return cached;
    }
    let Some(normalizer) = ctx.registries.normalizers.resolve(normalizer_name) else {
        return raw;
    };
    match normalizer.normalize(&raw, slot_ctx).await {
        Ok(canonical) => {
            ctx.registries.normalization_cache.put(normalizer_name, &raw, canonical.clone());
            canonical
        }
        Err(reason) => {
            log::debug!("normalizer '{normalizer_name}' failed on nlu slot: {reason}");
            raw
        }
    }
}

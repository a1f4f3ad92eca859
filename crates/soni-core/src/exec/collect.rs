//! Executor de `collect`.
//!
//! Entrada al nodo:
//! - Slot lleno y `force == false` → avanza sin prompt.
//! - `force == true` → limpia el slot primero y pregunta siempre.
//! - Slot con `default` declarado y sin valor → se llena con el default y
//!   avanza.
//! - En otro caso → prompt + `CollectTask` + `WAITING_FOR_SLOT` + suspensión.
//!
//! Reanudación (el router entrega el valor candidato):
//! normalizar (registry + cache) → coaccionar al tipo del slot → validar
//! (registry, con timeout) → llenar y avanzar; en fallo, intentos++ y
//! re-prompt; al agotar intentos aplica `on_invalid` (default: handoff a la
//! cola configurada).
//!
//! Plazo de respuesta (`timeout` del step): el core es estrictamente
//! turn-driven, así que el deadline se evalúa al llegar el siguiente turno
//! de la sesión (`check_collect_timeout`), comparando la inactividad contra
//! el plazo. Vencido, dispara `on_timeout`; sin `on_timeout` declarado, el
//! default es un único re-prompt y se sigue esperando.

use serde_json::Value;
use std::time::Duration;

use soni_dsl::{SlotDef, SlotType};

use crate::errors::RuntimeError;
use crate::exec::{ExecOutcome, RuntimeContext, StateResolver, SuspendReason};
use crate::expr::render_template;
use crate::graph::{CollectNode, Node, Target};
use crate::registry::SlotContext;
use crate::responses::resolve_response;
use crate::state::{ConversationState, DialogueState, FlowDelta, PendingTask, SlotScope};

pub(crate) fn execute(node: &Node,
                      collect: &CollectNode,
                      state: &DialogueState,
                      ctx: &RuntimeContext<'_>)
                      -> ExecOutcome {
    let Some(slot_def) = ctx.config.document.slot(&collect.slot) else {
        return ExecOutcome::Fail(crate::errors::ActionFailure::new(crate::errors::ErrorKind::UnknownRuntime,
                                                                   format!("slot '{}' disappeared from document",
                                                                           collect.slot)));
    };

    if !collect.force && state.slot_filled(&collect.slot) {
        return ExecOutcome::Advance { delta: FlowDelta::empty(),
                                      to: node.next };
    }

    let mut delta = FlowDelta::empty();
    if collect.force {
        delta = delta.with_slot(SlotScope::Flow, collect.slot.clone(), Value::Null);
    } else if let Some(default) = &slot_def.default {
        // Default declarado: el slot se llena sin preguntar.
        return ExecOutcome::Advance { delta: FlowDelta::empty().with_slot(SlotScope::Flow,
                                                                          collect.slot.clone(),
                                                                          default.clone()),
                                      to: node.next };
    }

    let resolver = StateResolver { state };
    let prompt = render_template(&slot_def.prompt, &resolver);
    let delta = delta.with_message(prompt)
                     .with_task(Some(PendingTask::Collect { slot: collect.slot.clone(),
                                                            attempts: 0,
                                                            reprompts: 0 }))
                     .with_state(ConversationState::WaitingForSlot);
    ExecOutcome::Suspend { delta,
                           reason: SuspendReason::WaitingForUser }
}

/// Resultado del chequeo de deadline al abrir un turno con collect en
/// espera.
#[derive(Debug)]
pub enum CollectTimeout {
    /// Dentro de plazo (o sin `timeout` configurado).
    NotExpired,
    /// Plazo vencido con `on_timeout` declarado: enrutar allí.
    Route { delta: FlowDelta, to: Target },
    /// Plazo vencido sin `on_timeout`: re-prompt default (uno solo).
    Reprompt { delta: FlowDelta },
}

/// Evalúa el `timeout` del collect contra la inactividad observada al abrir
/// el turno. El re-prompt default se dispara una única vez por tarea; los
/// vencimientos posteriores procesan la respuesta tardía con normalidad.
pub fn check_collect_timeout(node: &CollectNode,
                             state: &DialogueState,
                             ctx: &RuntimeContext<'_>,
                             idle_seconds: f64,
                             attempts: u32,
                             reprompts: u32)
                             -> CollectTimeout {
    let Some(budget) = node.timeout else {
        return CollectTimeout::NotExpired;
    };
    if idle_seconds <= budget {
        return CollectTimeout::NotExpired;
    }

    log::debug!("collect '{}' deadline expired ({idle_seconds:.0}s > {budget:.0}s)", node.slot);
    if let Some(to) = node.on_timeout {
        // La respuesta tardía queda en el historial pero no se consume.
        let delta = FlowDelta::empty().with_task(None)
                                      .with_state(ConversationState::Understanding);
        return CollectTimeout::Route { delta, to };
    }

    if reprompts >= 1 {
        return CollectTimeout::NotExpired;
    }
    let prompt = ctx.config
                    .document
                    .slot(&node.slot)
                    .map(|def| {
                        let resolver = StateResolver { state };
                        render_template(&def.prompt, &resolver)
                    })
                    .unwrap_or_default();
    let delta = FlowDelta::empty().with_message(prompt)
                                  .with_task(Some(PendingTask::Collect { slot: node.slot.clone(),
                                                                         attempts,
                                                                         reprompts: reprompts + 1 }));
    CollectTimeout::Reprompt { delta }
}

/// Resultado de reanudar un `collect` con un valor candidato.
#[derive(Debug)]
pub enum CollectResume {
    /// Valor aceptado: slot lleno, tarea limpia, listo para seguir el grafo.
    Accepted { delta: FlowDelta },
    /// Valor rechazado: re-prompt con intentos incrementados.
    Rejected { delta: FlowDelta },
    /// Intentos agotados: aplicar `on_invalid` (o el handoff por defecto).
    Escalate { delta: FlowDelta, target: Option<Target> },
}

/// Normaliza, coacciona y valida un candidato para el slot en espera.
pub async fn resume_collect(node: &CollectNode,
                            state: &DialogueState,
                            ctx: &RuntimeContext<'_>,
                            raw: &Value,
                            attempts: u32,
                            reprompts: u32)
                            -> Result<CollectResume, RuntimeError> {
    let slot_def = ctx.config
                      .document
                      .slot(&node.slot)
                      .ok_or_else(|| RuntimeError::Internal(format!("slot '{}' not declared", node.slot)))?;
    let slot_ctx = SlotContext { slot: node.slot.clone(),
                                 slot_type: slot_def.slot_type,
                                 language: state.language.clone() };

    let candidate = match normalize(ctx, slot_def, &slot_ctx, raw).await {
        Ok(value) => coerce(slot_def.slot_type, value),
        Err(reason) => {
            log::debug!("normalizer rejected value for '{}': {reason}", node.slot);
            return Ok(reject(node, slot_def, state, ctx, attempts, reprompts));
        }
    };

    let valid = match &candidate {
        Some(value) => validate(ctx, slot_def, &slot_ctx, value).await?,
        None => false,
    };

    if !valid {
        return Ok(reject(node, slot_def, state, ctx, attempts, reprompts));
    }

    let value = candidate.unwrap_or(Value::Null);
    let delta = FlowDelta::empty().with_slot(SlotScope::Flow, node.slot.clone(), value)
                                  .with_task(None)
                                  .with_state(ConversationState::ExecutingAction);
    Ok(CollectResume::Accepted { delta })
}

async fn normalize(ctx: &RuntimeContext<'_>,
                   slot_def: &SlotDef,
                   slot_ctx: &SlotContext,
                   raw: &Value)
                   -> Result<Value, String> {
    let Some(name) = &slot_def.normalizer else {
        return Ok(raw.clone());
    };
    if let Some(cached) = ctx.registries.normalization_cache.get(name, raw) {
        return Ok(cached);
    }
    let normalizer = ctx.registries
                        .normalizers
                        .resolve(name)
                        .ok_or_else(|| format!("normalizer '{name}' not registered"))?;
    let canonical = normalizer.normalize(raw, slot_ctx).await?;
    ctx.registries.normalization_cache.put(name, raw, canonical.clone());
    Ok(canonical)
}

async fn validate(ctx: &RuntimeContext<'_>,
                  slot_def: &SlotDef,
                  slot_ctx: &SlotContext,
                  value: &Value)
                  -> Result<bool, RuntimeError> {
    let Some(name) = &slot_def.validator else {
        return Ok(true);
    };
    let validator = ctx.registries
                       .validators
                       .resolve(name)
                       .ok_or_else(|| RuntimeError::Internal(format!("validator '{name}' not registered")))?;
    let budget = Duration::from_secs(ctx.settings().collection.validation_timeout);
    match tokio::time::timeout(budget, validator.validate(value, slot_ctx)).await {
        Ok(Ok(())) => Ok(true),
        Ok(Err(reason)) => {
            log::debug!("validator '{name}' rejected value: {reason}");
            Ok(false)
        }
        Err(_) => {
            log::warn!("validator '{name}' timed out after {budget:?}");
            Ok(false)
        }
    }
}

fn reject(node: &CollectNode,
          slot_def: &SlotDef,
          state: &DialogueState,
          ctx: &RuntimeContext<'_>,
          attempts: u32,
          reprompts: u32)
          -> CollectResume {
    let attempts = attempts + 1;
    let max = node.max_attempts
                  .unwrap_or(ctx.settings().collection.max_validation_attempts);

    let resolver = StateResolver { state };
    let text = match (&node.reprompt_message, &slot_def.invalid_message) {
        (Some(message), _) => render_template(message, &resolver),
        (None, Some(message)) => render_template(message, &resolver),
        (None, None) => {
            let fallback = resolve_response(&ctx.config.document, "slot_invalid", state.language.as_deref(),
                                            state.turn_count);
            if fallback == "slot_invalid" {
                render_template(&slot_def.prompt, &resolver)
            } else {
                fallback
            }
        }
    };

    if attempts >= max {
        // El último rechazo también se comunica antes de escalar.
        let delta = FlowDelta::empty().with_message(text).with_task(None);
        return CollectResume::Escalate { delta,
                                         target: node.on_invalid };
    }

    let delta = FlowDelta::empty().with_message(text)
                                  .with_task(Some(PendingTask::Collect { slot: node.slot.clone(),
                                                                         attempts,
                                                                         reprompts }))
                                  .with_state(ConversationState::WaitingForSlot);
    CollectResume::Rejected { delta }
}

/// Coacción al tipo declarado. Strings numéricos/booleanos se convierten; un
/// valor inadmisible produce `None` (cuenta como inválido).
fn coerce(slot_type: SlotType, value: Value) -> Option<Value> {
    if slot_type.admits(&value) {
        return Some(value);
    }
    let text = value.as_str()?.trim().to_string();
    match slot_type {
        SlotType::Integer => text.parse::<i64>().ok().map(Value::from),
        SlotType::Float => text.parse::<f64>().ok().map(Value::from),
        SlotType::Boolean => match text.to_lowercase().as_str() {
            "true" | "yes" | "si" | "sí" => Some(Value::Bool(true)),
            "false" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_parses_numeric_strings() {
        assert_eq!(coerce(SlotType::Integer, Value::from("42")), Some(Value::from(42)));
        assert_eq!(coerce(SlotType::Float, Value::from("2.5")), Some(Value::from(2.5)));
        assert_eq!(coerce(SlotType::Integer, Value::from("nope")), None);
    }

    #[test]
    fn coerce_accepts_admissible_values() {
        assert_eq!(coerce(SlotType::String, Value::from("x")), Some(Value::from("x")));
        assert_eq!(coerce(SlotType::Boolean, Value::from("yes")), Some(Value::Bool(true)));
        assert_eq!(coerce(SlotType::Object, Value::from("x")), None);
    }
}

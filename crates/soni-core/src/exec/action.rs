//! Executor de `action`.
//!
//! Secuencia por ejecución:
//! 1. Resolver el handler por nombre en el ActionRegistry.
//! 2. Inyectar inputs desde los slots del frame según el contrato declarado;
//!    un input ausente es `missing_input` (terminal).
//! 3. Política de reintentos: `max_attempts` totales, espera `delay` con
//!    backoff fixed/linear/exponential, filtro opcional `retry_on` por kind.
//!    Presupuesto `timeout` de reloj por intento.
//! 4. Éxito → mapear outputs a slots (renombrado por `map_outputs`), avanzar.
//! 5. Fallo terminal → el driver setea las variables `_error*` atómicamente y
//!    enruta según `on_error` del step, del flujo, o termina con ERROR.

use serde_json::{Map, Value};
use std::time::Duration;

use crate::errors::ActionFailure;
use crate::exec::{ExecOutcome, RuntimeContext};
use crate::graph::{ActionNode, Node};
use crate::state::{DialogueState, FlowDelta, SlotScope};

pub(crate) async fn execute(node: &Node,
                            action: &ActionNode,
                            state: &DialogueState,
                            ctx: &RuntimeContext<'_>)
                            -> ExecOutcome {
    let Some(handler) = ctx.registries.actions.resolve(&action.call) else {
        return ExecOutcome::Fail(ActionFailure::new(crate::errors::ErrorKind::UnknownRuntime,
                                                    format!("action '{}' not registered", action.call)));
    };

    // Inyección de inputs: el contrato del documento manda.
    let mut inputs: Map<String, Value> = Map::new();
    for name in &action.inputs {
        match state.get_slot(name).or_else(|| state.session_slots.get(name)) {
            Some(value) if !value.is_null() => {
                inputs.insert(name.clone(), value.clone());
            }
            _ => return ExecOutcome::Fail(ActionFailure::missing_input(&action.call, name)),
        }
    }

    let mut last_failure: Option<ActionFailure> = None;
    for attempt in 1..=action.retry.max_attempts {
        let wait = action.retry.delay_before(attempt);
        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        let result = match action.timeout {
            Some(budget) => {
                match tokio::time::timeout(Duration::from_secs_f64(budget), handler.call(inputs.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionFailure::timeout(&action.call, budget)),
                }
            }
            None => handler.call(inputs.clone()).await,
        };

        match result {
            Ok(outputs) => {
                let mut delta = FlowDelta::empty();
                for name in &action.outputs {
                    let Some(value) = outputs.get(name) else { continue };
                    let slot = action.map_outputs
                                     .get(name)
                                     .cloned()
                                     .unwrap_or_else(|| name.clone());
                    delta = delta.with_slot(SlotScope::Flow, slot, value.clone());
                }
                return ExecOutcome::Advance { delta, to: node.next };
            }
            Err(failure) => {
                let retryable = attempt < action.retry.max_attempts && action.retry.retries(failure.kind);
                log::debug!("action '{}' attempt {attempt}/{} failed ({}), retry={retryable}",
                            action.call,
                            action.retry.max_attempts,
                            failure.kind.as_str());
                last_failure = Some(failure);
                if !retryable {
                    break;
                }
            }
        }
    }

    ExecOutcome::Fail(last_failure.unwrap_or_else(|| {
                          ActionFailure::new(crate::errors::ErrorKind::UnknownRuntime,
                                             format!("action '{}' produced no result", action.call))
                      }))
}

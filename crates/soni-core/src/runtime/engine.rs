//! Driver de ejecución del grafo.
//!
//! Pasea el flujo activo nodo a nodo hasta que algo lo detenga: una
//! suspensión (`collect`/`confirm`/`handoff`), un push de `call_flow` (se
//! continúa en el hijo), la completitud del frame superior (pop y
//! continuación en el padre) o un error. Entre dos nodos no bloqueantes no
//! se consume input del usuario.
//!
//! Regla de propagación de errores: el step emite un error → `on_error` del
//! step si existe → `on_error` del flujo → el flujo termina con ERROR y hace
//! pop; el padre (si lo hay) aplica entonces la misma regla. `jump_to:
//! error` es salida intencional: nunca corre el `on_error` del flujo actual,
//! pero sí dispara el del padre al hacer pop. Los kinds terminales
//! (`loop_detected`, `missing_input`, …) saltan directamente a la
//! terminación del flujo.

use crate::errors::{ActionFailure, ErrorKind, RuntimeError};
use crate::exec::{execute_node, ExecOutcome, RuntimeContext, StateResolver, SuspendReason};
use crate::expr::eval_condition;
use crate::graph::{Node, NodeKind, Target};
use crate::responses::resolve_response;
use crate::runtime::TurnSink;
use crate::state::{ConversationState, DialogueState, FlowDelta, PopMode};

/// Aplica un delta y emite sus mensajes salientes en orden.
pub(crate) async fn apply_and_emit(state: &DialogueState,
                                   ctx: &RuntimeContext<'_>,
                                   sink: &mut TurnSink<'_>,
                                   delta: &FlowDelta)
                                   -> Result<DialogueState, RuntimeError> {
    let next = ctx.flow_manager.apply(state, delta)?;
    for text in &delta.messages {
        sink.message(text).await;
    }
    Ok(next)
}

/// Lleva el estado a IDLE encadenando transiciones válidas desde donde esté.
pub(crate) fn path_to_idle(state: ConversationState) -> &'static [ConversationState] {
    use ConversationState::*;
    match state {
        Idle => &[],
        Understanding => &[Idle],
        WaitingForSlot | ValidatingSlot | Confirming => &[Understanding, Idle],
        ExecutingAction => &[Completed, Idle],
        Completed => &[Idle],
        Error => &[Idle],
    }
}

/// Lleva el estado a COMPLETED encadenando transiciones válidas.
pub(crate) fn path_to_completed(state: ConversationState) -> &'static [ConversationState] {
    use ConversationState::*;
    match state {
        Completed => &[],
        ExecutingAction | Confirming => &[Completed],
        Understanding | Idle => &[ExecutingAction, Completed],
        WaitingForSlot => &[ValidatingSlot, ExecutingAction, Completed],
        ValidatingSlot => &[ExecutingAction, Completed],
        Error => &[Understanding, ExecutingAction, Completed],
    }
}

pub(crate) async fn settle(state: &DialogueState,
                           ctx: &RuntimeContext<'_>,
                           path: &[ConversationState])
                           -> Result<DialogueState, RuntimeError> {
    let mut next = state.clone();
    for step in path {
        next = ctx.flow_manager.apply(&next, &FlowDelta::empty().with_state(*step))?;
    }
    Ok(next)
}

/// Mensaje terminal genérico y localizado; los detalles sólo van al log.
pub(crate) fn generic_error_message(state: &DialogueState, ctx: &RuntimeContext<'_>) -> String {
    let resolved = resolve_response(&ctx.config.document, "error", state.language.as_deref(), state.turn_count);
    if resolved == "error" {
        "Something went wrong. Please try again.".to_string()
    } else {
        resolved
    }
}

fn step_error_target(node: &Node, kind: ErrorKind) -> Option<Target> {
    match &node.kind {
        NodeKind::Action(action) => {
            if kind == ErrorKind::Timeout {
                action.on_timeout.or(action.on_error)
            } else {
                action.on_error
            }
        }
        NodeKind::Generate(generate) => generate.on_error,
        NodeKind::CallFlow(call) => call.on_error,
        _ => None,
    }
}

/// Resultado de seguir un target: el estado nuevo y si el turno debe parar.
pub(crate) struct Moved {
    pub state: DialogueState,
    pub stop: bool,
}

/// Sigue un `Target` estructural, resolviendo en bucle los pops que
/// encadena la completitud (`end`) o cancelación (`cancel_flow`) de frames.
/// Tras un pop, si el padre estaba detenido en un `call_flow`, se le avanza
/// más allá de ese nodo; si estaba bloqueado en otro nodo (digresión), se le
/// deja donde estaba para que el driver lo re-ejecute.
pub(crate) async fn goto_target(state: &DialogueState,
                                ctx: &RuntimeContext<'_>,
                                sink: &mut TurnSink<'_>,
                                target: Target)
                                -> Result<Moved, RuntimeError> {
    let mut state = state.clone();
    let mut target = target;
    loop {
        match target {
            Target::Node(id) => {
                let Some(top) = state.top() else {
                    return Err(RuntimeError::Internal("advance with empty stack".to_string()));
                };
                let graph = ctx.config
                               .graphs
                               .get(&top.flow_name)
                               .ok_or_else(|| RuntimeError::UnknownFlow(top.flow_name.clone()))?;
                let step_id = graph.node(id).step_id.clone();
                state = ctx.flow_manager.apply(&state, &FlowDelta::empty().with_advance(step_id))?;
                return Ok(Moved { state, stop: false });
            }
            Target::End | Target::CancelFlow => {
                let mode = if target == Target::End { PopMode::Complete } else { PopMode::Cancel };
                state = ctx.flow_manager.pop(&state, mode);
                match state.top() {
                    None => {
                        // Conversación sin flujos: COMPLETED y de vuelta a IDLE.
                        state = settle(&state, ctx, path_to_completed(state.conversation_state)).await?;
                        state = settle(&state, ctx, path_to_idle(state.conversation_state)).await?;
                        return Ok(Moved { state, stop: false });
                    }
                    Some(parent) => {
                        let graph = ctx.config
                                       .graphs
                                       .get(&parent.flow_name)
                                       .ok_or_else(|| RuntimeError::UnknownFlow(parent.flow_name.clone()))?;
                        let node_id = graph.resolve_step(&parent.current_step)
                                           .ok_or_else(|| RuntimeError::Internal(format!("parent stopped at unknown step '{}'",
                                                                                         parent.current_step)))?;
                        let node = graph.node(node_id);
                        if matches!(node.kind, NodeKind::CallFlow(_)) {
                            target = node.next;
                            continue;
                        }
                        // Digresión: el padre retoma en su nodo bloqueado.
                        return Ok(Moved { state, stop: false });
                    }
                }
            }
            Target::ErrorExit => {
                // Salida de error intencional: el flujo actual termina con
                // ERROR sin correr su propio on_error.
                let failure = current_failure(&state);
                let state = terminate_flow(&state, ctx, sink, failure).await?;
                return Ok(Moved { state, stop: false });
            }
        }
    }
}

/// Reconstruye el fallo observable desde las variables `_error*` del frame,
/// si existen (caso `jump_to: error` tras un on_error previo).
fn current_failure(state: &DialogueState) -> ActionFailure {
    let kind = state.get_slot("_error_type")
                    .and_then(|v| v.as_str())
                    .and_then(ErrorKind::parse)
                    .unwrap_or(ErrorKind::UnknownRuntime);
    let message = state.get_slot("_error_message")
                       .and_then(|v| v.as_str())
                       .unwrap_or("intentional error exit")
                       .to_string();
    let details = state.get_slot("_error_details").cloned().unwrap_or(serde_json::Value::Null);
    ActionFailure::new(kind, message).with_details(details)
}

/// Termina el flujo superior con ERROR: pop sin propagación, variables
/// `_error*` visibles en el padre y aplicación de la regla de `on_error` del
/// padre. Sin padre: estado ERROR y mensaje genérico.
pub(crate) async fn terminate_flow(state: &DialogueState,
                                   ctx: &RuntimeContext<'_>,
                                   sink: &mut TurnSink<'_>,
                                   failure: ActionFailure)
                                   -> Result<DialogueState, RuntimeError> {
    let mut state = state.clone();
    loop {
        state = ctx.flow_manager.pop(&state, PopMode::Cancel);
        if state.pending_task.is_some() {
            state.pending_task = None;
        }

        let Some(parent) = state.top() else {
            log::error!("flow terminated with {}: {}", failure.kind.as_str(), failure.message);
            let message = generic_error_message(&state, ctx);
            let mut delta = FlowDelta::empty().with_message(message)
                                              .with_meta("_error_type",
                                                         serde_json::Value::String(failure.kind
                                                                                          .as_str()
                                                                                          .to_string()));
            if crate::state::StateTransitionValidator::allowed(state.conversation_state, ConversationState::Error) {
                delta = delta.with_state(ConversationState::Error);
            }
            return apply_and_emit(&state, ctx, sink, &delta).await;
        };

        let parent_name = parent.flow_name.clone();
        let parent_step = parent.current_step.clone();

        // El padre observa el fallo del hijo en sus propias variables.
        let vars = FlowDelta::empty().with_error_vars(&failure);
        state = ctx.flow_manager.apply(&state, &vars)?;
        let graph = ctx.config
                       .graphs
                       .get(&parent_name)
                       .ok_or_else(|| RuntimeError::UnknownFlow(parent_name.clone()))?;
        let node_id = graph.resolve_step(&parent_step)
                           .ok_or_else(|| RuntimeError::Internal(format!("parent stopped at unknown step '{parent_step}'")))?;
        let node = graph.node(node_id);

        if let Some(target) = step_error_target(node, failure.kind) {
            let moved = Box::pin(goto_target(&state, ctx, sink, target)).await?;
            return Ok(moved.state);
        }
        if let Some(target) = graph.on_error {
            let moved = Box::pin(goto_target(&state, ctx, sink, target)).await?;
            return Ok(moved.state);
        }
        // El padre tampoco maneja el error: la misma regla sube un nivel
        // conservando el kind original.
    }
}

/// Aplica la regla de propagación a un fallo emitido por el nodo actual.
async fn on_step_failure(state: &DialogueState,
                         ctx: &RuntimeContext<'_>,
                         sink: &mut TurnSink<'_>,
                         node: &Node,
                         failure: ActionFailure)
                         -> Result<DialogueState, RuntimeError> {
    log::warn!("step '{}' failed: {} ({})", node.step_id, failure.message, failure.kind.as_str());

    // Las variables de error se setean atómicamente antes de enrutar.
    let state = ctx.flow_manager
                   .apply(state, &FlowDelta::empty().with_error_vars(&failure))?;

    if !failure.kind.is_terminal() {
        if let Some(target) = step_error_target(node, failure.kind) {
            let moved = goto_target(&state, ctx, sink, target).await?;
            return Ok(moved.state);
        }
        let graph = state.top()
                         .and_then(|top| ctx.config.graphs.get(&top.flow_name));
        if let Some(target) = graph.and_then(|g| g.on_error) {
            let moved = goto_target(&state, ctx, sink, target).await?;
            return Ok(moved.state);
        }
    }

    terminate_flow(&state, ctx, sink, failure).await
}

/// Pasea el flujo activo hasta suspensión, completitud total o error. El
/// estado devuelto es siempre consistente para persistir.
pub(crate) async fn drive(state: DialogueState,
                          ctx: &RuntimeContext<'_>,
                          sink: &mut TurnSink<'_>)
                          -> Result<DialogueState, RuntimeError> {
    let mut state = state;
    loop {
        // Sesión bloqueada esperando input: no hay nada que pasear.
        if state.pending_task.is_some() {
            return Ok(state);
        }
        let Some(top) = state.top() else {
            if state.conversation_state == ConversationState::Understanding {
                state = settle(&state, ctx, path_to_idle(state.conversation_state)).await?;
            }
            return Ok(state);
        };

        let flow_name = top.flow_name.clone();
        let graph = ctx.config
                       .graphs
                       .get(&flow_name)
                       .ok_or_else(|| RuntimeError::UnknownFlow(flow_name.clone()))?;
        let node_id = graph.resolve_step(&top.current_step)
                           .ok_or_else(|| RuntimeError::Internal(format!("unknown step '{}' in '{}'",
                                                                         top.current_step, flow_name)))?;
        let node = graph.node(node_id).clone();

        // Protección de bucles: contador por nodo y por frame.
        let count = top.executions_of(&node.step_id) + 1;
        if count > ctx.settings().runtime.max_step_executions {
            let failure = ActionFailure::loop_detected(&node.step_id, count - 1);
            state = terminate_flow(&state, ctx, sink, failure).await?;
            if state.flow_stack.is_empty() {
                return Ok(state);
            }
            continue;
        }
        if let Some(frame) = state.flow_stack.last_mut() {
            frame.executions.insert(node.step_id.clone(), count);
        }

        // La fase de grafo corre en EXECUTING_ACTION.
        if state.conversation_state != ConversationState::ExecutingAction
           && crate::state::StateTransitionValidator::allowed(state.conversation_state,
                                                              ConversationState::ExecutingAction)
        {
            state = ctx.flow_manager
                       .apply(&state, &FlowDelta::empty().with_state(ConversationState::ExecutingAction))?;
        }

        // Guardia `when`: falso → el step se salta hacia su sucesor.
        if let Some(guard) = &node.guard {
            let resolver = StateResolver { state: &state };
            if !eval_condition(guard, &resolver) {
                let moved = goto_target(&state, ctx, sink, node.next).await?;
                state = moved.state;
                if moved.stop {
                    return Ok(state);
                }
                continue;
            }
        }

        match execute_node(&node, &state, ctx).await {
            ExecOutcome::Advance { delta, to } => {
                state = apply_and_emit(&state, ctx, sink, &delta).await?;
                let moved = goto_target(&state, ctx, sink, to).await?;
                state = moved.state;
                if moved.stop {
                    return Ok(state);
                }
            }
            ExecOutcome::Suspend { delta, reason: SuspendReason::FlowPushed } => {
                // El push puede chocar con max_stack_depth (reject_new): eso
                // es un fallo terminal del flujo, no un aborto del turno.
                match apply_and_emit(&state, ctx, sink, &delta).await {
                    Ok(next) => state = next,
                    Err(RuntimeError::MaxStackDepth { depth }) => {
                        let failure = ActionFailure::new(ErrorKind::MaxStackDepth,
                                                         format!("flow stack depth limit reached ({depth})"));
                        state = on_step_failure(&state, ctx, sink, &node, failure).await?;
                        if state.flow_stack.is_empty() {
                            return Ok(state);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            ExecOutcome::Suspend { delta, reason } => {
                state = apply_and_emit(&state, ctx, sink, &delta).await?;
                match reason {
                    SuspendReason::FlowPushed => continue,
                    SuspendReason::HandedOff(signal) => {
                        sink.handoff(signal).await;
                        return Ok(state);
                    }
                    SuspendReason::WaitingForUser | SuspendReason::WaitingForConfirmation => {
                        return Ok(state);
                    }
                }
            }
            ExecOutcome::Fail(failure) => {
                state = on_step_failure(&state, ctx, sink, &node, failure).await?;
                if state.flow_stack.is_empty() {
                    return Ok(state);
                }
            }
        }
    }
}

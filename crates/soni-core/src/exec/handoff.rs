//! Executor de `handoff`: emite la señal de transferencia (opaca para el
//! core) con los slots de contexto nombrados y el resumen de conversación; la
//! sesión pasa a COMPLETED desde la perspectiva del runtime.

use serde_json::{Map, Value};

use crate::exec::{conversation_summary, ExecOutcome, HandoffSignal, RuntimeContext, StateResolver, SuspendReason};
use crate::expr::render_template;
use crate::graph::{HandoffNode, Node};
use crate::responses::resolve_response;
use crate::state::{ConversationState, DialogueState, FlowDelta};

pub(crate) fn execute(_node: &Node,
                      handoff: &HandoffNode,
                      state: &DialogueState,
                      ctx: &RuntimeContext<'_>)
                      -> ExecOutcome {
    let queue = handoff.queue
                       .clone()
                       .unwrap_or_else(|| ctx.settings().handoff.default_queue.clone());

    let mut context: Map<String, Value> = Map::new();
    for name in &handoff.context {
        if let Some(value) = state.get_slot(name).or_else(|| state.session_slots.get(name)) {
            context.insert(name.clone(), value.clone());
        }
    }

    let signal = HandoffSignal { queue,
                                 context,
                                 summary: conversation_summary(state) };

    let resolver = StateResolver { state };
    let mut delta = FlowDelta::empty();
    match (&handoff.message, &handoff.response) {
        (Some(message), _) => delta = delta.with_message(render_template(message, &resolver)),
        (None, Some(key)) => {
            let resolved = resolve_response(&ctx.config.document, key, state.language.as_deref(), state.turn_count);
            delta = delta.with_message(render_template(&resolved, &resolver));
        }
        (None, None) => {}
    }
    let delta = delta.with_task(None).with_state(ConversationState::Completed);

    ExecOutcome::Suspend { delta,
                           reason: SuspendReason::HandedOff(signal) }
}

//! Executor de `say`: no bloqueante. Resuelve la plantilla o la respuesta
//! nombrada (con selección de idioma y rotación de variaciones), encola el
//! mensaje saliente y avanza.

use crate::exec::{ExecOutcome, RuntimeContext, StateResolver};
use crate::expr::render_template;
use crate::graph::{Node, SayNode};
use crate::responses::resolve_response;
use crate::state::{DialogueState, FlowDelta};

pub(crate) fn execute(node: &Node, say: &SayNode, state: &DialogueState, ctx: &RuntimeContext<'_>) -> ExecOutcome {
    let resolver = StateResolver { state };
    let text = match (&say.message, &say.response) {
        (Some(message), _) => render_template(message, &resolver),
        (None, Some(key)) => {
            let resolved = resolve_response(&ctx.config.document, key, state.language.as_deref(), state.turn_count);
            render_template(&resolved, &resolver)
        }
        (None, None) => String::new(),
    };
    ExecOutcome::Advance { delta: FlowDelta::empty().with_message(text),
                           to: node.next }
}

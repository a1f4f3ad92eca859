//! Executor de `generate`: llama al punto de entrada generativo del NLU.
//!
//! En éxito, si hay `store_as` el texto se almacena en ese slot; sin
//! `store_as` el texto se emite como mensaje saliente. No hay ningún otro
//! efecto de estado. En fallo aplica `on_error` del step (el driver cae a la
//! regla general si no lo hay).

use serde_json::{Map, Value};

use crate::errors::{ActionFailure, ErrorKind};
use crate::exec::{ExecOutcome, RuntimeContext, StateResolver};
use crate::expr::render_template;
use crate::graph::{GenerateNode, Node};
use crate::state::{DialogueState, FlowDelta, SlotScope};

pub(crate) async fn execute(node: &Node,
                            generate: &GenerateNode,
                            state: &DialogueState,
                            ctx: &RuntimeContext<'_>)
                            -> ExecOutcome {
    let resolver = StateResolver { state };
    let instruction = render_template(&generate.instruction, &resolver);

    let mut context: Map<String, Value> = Map::new();
    for name in &generate.context {
        if let Some(value) = state.get_slot(name).or_else(|| state.session_slots.get(name)) {
            context.insert(name.clone(), value.clone());
        }
    }

    match ctx.nlu.generate(&instruction, &context).await {
        Ok(text) => {
            let delta = match &generate.store_as {
                Some(slot) => FlowDelta::empty().with_slot(SlotScope::Flow, slot.clone(), Value::String(text)),
                None => FlowDelta::empty().with_message(text),
            };
            ExecOutcome::Advance { delta, to: node.next }
        }
        Err(e) => {
            ExecOutcome::Fail(ActionFailure::new(ErrorKind::Connection, format!("generate failed: {e}")))
        }
    }
}

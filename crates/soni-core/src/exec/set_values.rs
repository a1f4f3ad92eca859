//! Executor de `set`: evalúa cada valor declarado y lo escribe en su scope.
//! Claves `session.x` apuntan al scope de sesión; el resto al frame activo.
//! La evaluación es total: un error deja `null` en el destino (y se loggea
//! en el motor de expresiones).

use crate::exec::{ExecOutcome, StateResolver};
use crate::graph::{Node, SetNode};
use crate::state::{DialogueState, FlowDelta, SlotScope};

pub(crate) fn execute(node: &Node, set: &SetNode, state: &DialogueState) -> ExecOutcome {
    let resolver = StateResolver { state };
    let mut delta = FlowDelta::empty();
    for (name, template) in &set.values {
        let value = template.render(&resolver);
        match name.strip_prefix("session.") {
            Some(rest) => delta = delta.with_slot(SlotScope::Session, rest, value),
            None => delta = delta.with_slot(SlotScope::Flow, name.clone(), value),
        }
    }
    ExecOutcome::Advance { delta, to: node.next }
}

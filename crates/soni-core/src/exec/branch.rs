//! Executor de `branch`: evalúa las condiciones en orden de declaración y
//! enruta a la primera verdadera. Sin caso verdadero: `else` si existe, o
//! caída al sucesor secuencial. Sin efectos secundarios.

use crate::exec::{ExecOutcome, StateResolver};
use crate::expr::eval_condition;
use crate::graph::{BranchNode, Node};
use crate::state::{DialogueState, FlowDelta};

pub(crate) fn execute(node: &Node, branch: &BranchNode, state: &DialogueState) -> ExecOutcome {
    let resolver = StateResolver { state };
    for case in &branch.cases {
        if eval_condition(&case.condition, &resolver) {
            return ExecOutcome::Advance { delta: FlowDelta::empty(),
                                          to: case.then };
        }
    }
    ExecOutcome::Advance { delta: FlowDelta::empty(),
                           to: branch.else_to.unwrap_or(node.next) }
}

//! Executor de `call_flow`: apila un frame hijo, copia los inputs mapeados a
//! sus slots y suspende al padre. Al completarse el hijo, el driver hace pop,
//! propaga los outputs declarados al padre y lo avanza; si el hijo falla, el
//! padre aplica su propia regla de `on_error`.

use serde_json::Value;
use std::collections::HashMap;

use crate::errors::{ActionFailure, ErrorKind};
use crate::exec::{ExecOutcome, RuntimeContext, StateResolver, SuspendReason};
use crate::expr::render_template;
use crate::graph::{CallFlowNode, Node};
use crate::state::{DialogueState, FlowDelta, FlowPush};

pub(crate) fn execute(_node: &Node,
                      call: &CallFlowNode,
                      state: &DialogueState,
                      ctx: &RuntimeContext<'_>)
                      -> ExecOutcome {
    let Some(child) = ctx.config.graphs.get(&call.flow) else {
        return ExecOutcome::Fail(ActionFailure::new(ErrorKind::UnknownRuntime,
                                                    format!("called flow '{}' is not compiled", call.flow)));
    };
    let Some(entry_step) = child.entry_step() else {
        return ExecOutcome::Fail(ActionFailure::new(ErrorKind::UnknownRuntime,
                                                    format!("called flow '{}' has no entry step", call.flow)));
    };

    // Inputs del hijo: nombre de slot del padre (valor tipado) o plantilla.
    let mut inputs: HashMap<String, Value> = HashMap::new();
    let resolver = StateResolver { state };
    for (child_slot, source) in &call.inputs {
        let value = match state.get_slot(source) {
            Some(value) => value.clone(),
            None => Value::String(render_template(source, &resolver)),
        };
        inputs.insert(child_slot.clone(), value);
    }

    let push = FlowPush { flow_name: call.flow.clone(),
                          entry_step: entry_step.to_string(),
                          inputs,
                          output_map: call.outputs.clone() };
    ExecOutcome::Suspend { delta: FlowDelta::empty().with_push(push),
                           reason: SuspendReason::FlowPushed }
}

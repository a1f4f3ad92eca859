//! Compilador IR → `FlowGraph` (lowering + linking).

use indexmap::IndexMap;
use serde_json::json;

use soni_dsl::{FlowDef, FlowDocument, StepDef, StepType};

use crate::constants::{ENGINE_VERSION, TARGET_CANCEL_FLOW, TARGET_CONTINUE, TARGET_END, TARGET_ERROR};
use crate::errors::{CompileError, ErrorKind};
use crate::expr::{parse_expression, Expr, ValueTemplate};
use crate::graph::validate::validate_graph;
use crate::graph::{ActionNode, BranchNode, CallFlowNode, CollectNode, CompiledCase, ConfirmNode, FlowGraph,
                   GenerateNode, HandoffNode, Node, NodeId, NodeKind, RetryPolicy, SayNode, SetNode, Target};
use crate::hashing::hash_value;
use crate::registry::Registries;

/// Documento compilado: la IR original más un grafo por flujo.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledConfig {
    pub document: FlowDocument,
    pub graphs: IndexMap<String, FlowGraph>,
}

impl CompiledConfig {
    pub fn graph(&self, flow_name: &str) -> Option<&FlowGraph> {
        self.graphs.get(flow_name)
    }
}

/// Compila todos los flujos del documento. Fail-fast: el primer error
/// estructural aborta la compilación completa.
pub fn compile(document: &FlowDocument, registries: &Registries) -> Result<CompiledConfig, CompileError> {
    // Las referencias a validadores/normalizadores se resuelven una vez por
    // slot declarado, sea cual sea el flujo que lo use.
    for (slot_name, slot) in &document.slots {
        if let Some(validator) = &slot.validator {
            if !registries.validators.contains(validator) {
                return Err(CompileError::UnknownValidator { slot: slot_name.clone(),
                                                            validator: validator.clone() });
            }
        }
        if let Some(normalizer) = &slot.normalizer {
            if !registries.normalizers.contains(normalizer) {
                return Err(CompileError::UnknownNormalizer { slot: slot_name.clone(),
                                                             normalizer: normalizer.clone() });
            }
        }
    }

    let mut graphs = IndexMap::new();
    for (flow_name, flow) in &document.flows {
        let graph = compile_flow(document, registries, flow_name, flow)?;
        validate_graph(&graph)?;
        graphs.insert(flow_name.clone(), graph);
    }
    Ok(CompiledConfig { document: document.clone(),
                        graphs })
}

struct Linker<'a> {
    flow_name: &'a str,
    by_step: &'a IndexMap<String, NodeId>,
}

impl<'a> Linker<'a> {
    /// Resuelve un target textual. `continue` es el sucesor secuencial del
    /// nodo que declara la referencia.
    fn resolve(&self, step_id: &str, target: &str, seq_next: Target) -> Result<Target, CompileError> {
        match target {
            TARGET_END => Ok(Target::End),
            TARGET_ERROR => Ok(Target::ErrorExit),
            TARGET_CANCEL_FLOW => Ok(Target::CancelFlow),
            TARGET_CONTINUE => Ok(seq_next),
            name => self.by_step
                        .get(name)
                        .map(|id| Target::Node(*id))
                        .ok_or_else(|| CompileError::UnknownStepTarget { flow: self.flow_name.to_string(),
                                                                         step: step_id.to_string(),
                                                                         target: name.to_string() }),
        }
    }

    fn resolve_opt(&self,
                   step_id: &str,
                   target: &Option<String>,
                   seq_next: Target)
                   -> Result<Option<Target>, CompileError> {
        target.as_deref()
              .map(|t| self.resolve(step_id, t, seq_next))
              .transpose()
    }
}

fn compile_flow(document: &FlowDocument,
                registries: &Registries,
                flow_name: &str,
                flow: &FlowDef)
                -> Result<FlowGraph, CompileError> {
    // Layout: [ENTRY, steps.., END, ERROR_EXIT]
    let entry: NodeId = 0;
    let end: NodeId = flow.process.len() + 1;
    let error_exit: NodeId = flow.process.len() + 2;

    let mut by_step: IndexMap<String, NodeId> = IndexMap::new();
    for (i, step) in flow.process.iter().enumerate() {
        if by_step.insert(step.step.clone(), i + 1).is_some() {
            return Err(CompileError::DuplicateStepId { flow: flow_name.to_string(),
                                                       step: step.step.clone() });
        }
    }

    let linker = Linker { flow_name,
                          by_step: &by_step };

    let mut nodes: Vec<Node> = Vec::with_capacity(flow.process.len() + 3);
    nodes.push(Node { id: entry,
                      step_id: "__entry".to_string(),
                      kind: NodeKind::Entry,
                      guard: None,
                      next: if flow.process.is_empty() { Target::End } else { Target::Node(1) } });

    for (i, step) in flow.process.iter().enumerate() {
        let id = i + 1;
        let seq_next = if id + 1 <= flow.process.len() { Target::Node(id + 1) } else { Target::End };
        let next = match &step.jump_to {
            Some(target) => linker.resolve(&step.step, target, seq_next)?,
            None => seq_next,
        };
        let guard = step.guard()
                        .map(|g| compile_expr(flow_name, &step.step, g))
                        .transpose()?;
        let kind = lower_step(document, registries, &linker, flow_name, step, seq_next)?;
        nodes.push(Node { id,
                          step_id: step.step.clone(),
                          kind,
                          guard,
                          next });
    }

    nodes.push(Node { id: end,
                      step_id: "__end".to_string(),
                      kind: NodeKind::End,
                      guard: None,
                      next: Target::End });
    nodes.push(Node { id: error_exit,
                      step_id: "__error".to_string(),
                      kind: NodeKind::ErrorExit,
                      guard: None,
                      next: Target::ErrorExit });

    // on_error de flujo: `continue` no tiene sucesor secuencial aquí.
    let on_error = match &flow.on_error {
        Some(target) => Some(linker.resolve("on_error", target, Target::End)?),
        None => None,
    };

    let mut warnings = Vec::new();
    for node in &nodes {
        if let NodeKind::Branch(branch) = &node.kind {
            if branch.else_to.is_none() {
                warnings.push(format!("step '{}': branch without else falls through to the next sequential step",
                                      node.step_id));
            }
        }
    }

    let definition_hash = hash_value(&json!({
        "engine_version": ENGINE_VERSION,
        "flow_name": flow_name,
        "flow": serde_json::to_value(flow).unwrap_or_default(),
    }));

    Ok(FlowGraph { flow_name: flow_name.to_string(),
                   nodes,
                   entry,
                   end,
                   error_exit,
                   by_step,
                   on_error,
                   warnings,
                   definition_hash,
                   inputs: flow.inputs.clone(),
                   outputs: flow.outputs.clone() })
}

fn compile_expr(flow: &str, step: &str, source: &str) -> Result<Expr, CompileError> {
    parse_expression(source).map_err(|e| CompileError::InvalidExpression { flow: flow.to_string(),
                                                                           step: step.to_string(),
                                                                           detail: e.to_string() })
}

/// Conjunción/disyunción de una lista de condiciones (`all:`/`any:`).
fn fold_conditions(flow: &str,
                   step: &str,
                   sources: &[String],
                   op: crate::expr::BinOp)
                   -> Result<Expr, CompileError> {
    let mut exprs = Vec::with_capacity(sources.len());
    for source in sources {
        exprs.push(compile_expr(flow, step, source)?);
    }
    let mut iter = exprs.into_iter();
    let first = iter.next()
                    .ok_or_else(|| CompileError::SchemaViolation(format!("step '{step}': empty condition list")))?;
    Ok(iter.fold(first, |lhs, rhs| Expr::Binary { op,
                                                  lhs: Box::new(lhs),
                                                  rhs: Box::new(rhs) }))
}

fn lower_step(document: &FlowDocument,
              registries: &Registries,
              linker: &Linker<'_>,
              flow_name: &str,
              step: &StepDef,
              seq_next: Target)
              -> Result<NodeKind, CompileError> {
    let step_id = step.step.as_str();
    match step.step_type {
        StepType::Collect => {
            let slot = step.slot.clone().unwrap_or_default();
            Ok(NodeKind::Collect(CollectNode { slot,
                                               force: step.force.unwrap_or(false),
                                               max_attempts: step.max_attempts,
                                               on_invalid: linker.resolve_opt(step_id, &step.on_invalid, seq_next)?,
                                               reprompt_message: step.reprompt_message.clone(),
                                               timeout: step.timeout,
                                               on_timeout: linker.resolve_opt(step_id, &step.on_timeout, seq_next)? }))
        }
        StepType::Action => {
            let call = step.call.clone().unwrap_or_default();
            if !registries.actions.contains(&call) {
                return Err(CompileError::UnknownAction { flow: flow_name.to_string(),
                                                         step: step_id.to_string(),
                                                         action: call });
            }
            let contract = document.action(&call)
                                   .ok_or_else(|| CompileError::UnknownAction { flow: flow_name.to_string(),
                                                                                step: step_id.to_string(),
                                                                                action: call.clone() })?;
            let retry = match &step.retry {
                None => RetryPolicy::default(),
                Some(def) => {
                    let retry_on = match &def.retry_on {
                        None => None,
                        Some(names) => {
                            let mut kinds = Vec::with_capacity(names.len());
                            for name in names {
                                let kind = ErrorKind::parse(name).ok_or_else(|| {
                                    CompileError::SchemaViolation(format!("step '{step_id}': unknown retry_on kind '{name}'"))
                                })?;
                                kinds.push(kind);
                            }
                            Some(kinds)
                        }
                    };
                    RetryPolicy { max_attempts: def.max_attempts.max(1),
                                  delay: def.delay,
                                  backoff: def.backoff,
                                  retry_on }
                }
            };
            Ok(NodeKind::Action(ActionNode { call,
                                             inputs: contract.inputs.clone(),
                                             outputs: contract.outputs.clone(),
                                             map_outputs: step.map_outputs.clone().unwrap_or_default(),
                                             timeout: step.timeout,
                                             retry,
                                             on_error: linker.resolve_opt(step_id, &step.on_error, seq_next)?,
                                             on_timeout: linker.resolve_opt(step_id, &step.on_timeout, seq_next)? }))
        }
        StepType::Branch => {
            let mut cases = Vec::new();
            for case in step.branch_cases().unwrap_or_default() {
                let condition = if let Some(source) = &case.condition {
                    compile_expr(flow_name, step_id, source)?
                } else if let Some(all) = &case.all {
                    fold_conditions(flow_name, step_id, all, crate::expr::BinOp::And)?
                } else if let Some(any) = &case.any {
                    fold_conditions(flow_name, step_id, any, crate::expr::BinOp::Or)?
                } else {
                    return Err(CompileError::SchemaViolation(format!("step '{step_id}': branch case without condition")));
                };
                cases.push(CompiledCase { condition,
                                          then: linker.resolve(step_id, &case.then, seq_next)? });
            }
            Ok(NodeKind::Branch(BranchNode { cases,
                                             else_to: linker.resolve_opt(step_id, &step.else_to, seq_next)? }))
        }
        StepType::Say => Ok(NodeKind::Say(SayNode { message: step.message.clone(),
                                                    response: step.response.clone() })),
        StepType::Set => {
            let mut values = Vec::new();
            for (name, raw) in step.values.as_ref().into_iter().flatten() {
                let template = ValueTemplate::compile(raw).map_err(|e| CompileError::InvalidExpression {
                                   flow: flow_name.to_string(),
                                   step: step_id.to_string(),
                                   detail: e.to_string(),
                               })?;
                values.push((name.clone(), template));
            }
            Ok(NodeKind::Set(SetNode { values }))
        }
        StepType::Confirm => {
            Ok(NodeKind::Confirm(ConfirmNode { message: step.message.clone(),
                                               response: step.response.clone(),
                                               on_yes: linker.resolve_opt(step_id, &step.on_yes, seq_next)?,
                                               on_no: linker.resolve_opt(step_id, &step.on_no, seq_next)?,
                                               on_change: linker.resolve_opt(step_id, &step.on_change, seq_next)?,
                                               on_correction: linker.resolve_opt(step_id,
                                                                                 &step.on_correction,
                                                                                 seq_next)?,
                                               on_modification: linker.resolve_opt(step_id,
                                                                                   &step.on_modification,
                                                                                   seq_next)?,
                                               max_attempts: step.max_attempts }))
        }
        StepType::Generate => {
            Ok(NodeKind::Generate(GenerateNode { instruction: step.instruction.clone().unwrap_or_default(),
                                                 context: step.context.clone().unwrap_or_default(),
                                                 store_as: step.store_as.clone(),
                                                 on_error: linker.resolve_opt(step_id, &step.on_error, seq_next)? }))
        }
        StepType::CallFlow => {
            let target = step.flow.clone().unwrap_or_default();
            if !document.flows.contains_key(&target) {
                return Err(CompileError::UnknownFlow { flow: flow_name.to_string(),
                                                       step: step_id.to_string(),
                                                       target });
            }
            Ok(NodeKind::CallFlow(CallFlowNode { flow: target,
                                                 inputs: step.inputs.clone().unwrap_or_default(),
                                                 outputs: step.outputs.clone().unwrap_or_default(),
                                                 on_error: linker.resolve_opt(step_id, &step.on_error, seq_next)? }))
        }
        StepType::Handoff => Ok(NodeKind::Handoff(HandoffNode { queue: step.queue.clone(),
                                                                context: step.context.clone().unwrap_or_default(),
                                                                message: step.message.clone(),
                                                                response: step.response.clone() })),
    }
}

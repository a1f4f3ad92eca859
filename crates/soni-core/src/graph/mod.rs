//! Grafo ejecutable por flujo.
//!
//! El compilador traduce la IR declarativa en dos pasadas:
//! 1. *Lowering*: cada `StepDef` baja a un `Node` uniforme (tipo, config
//!    compilada, transiciones declaradas como texto).
//! 2. *Linking*: las referencias string se resuelven a handles (`Target`),
//!    se calcula el sucesor secuencial por defecto y se instalan los routers
//!    condicionales de `branch` (el `collect` tiene dos salidas: satisfecho →
//!    siguiente, bloqueado → él mismo vía suspensión del runtime).
//!
//! Nodos sintéticos `ENTRY` y `END` completan cada grafo; `error` resuelve al
//! nodo terminal de error y `continue` al sucesor secuencial.

mod compile;
mod validate;

pub use compile::{compile, CompiledConfig};

use indexmap::IndexMap;

use crate::errors::ErrorKind;
use crate::expr::{Expr, ValueTemplate};
use soni_dsl::BackoffKind;

pub type NodeId = usize;

/// Handle resuelto de un target de transición.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    /// `end`: completitud del flujo.
    End,
    /// `error`: salida de error intencional (no invoca `on_error` propio).
    ErrorExit,
    /// `cancel_flow`: pop sin propagación.
    CancelFlow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub step_id: String,
    pub kind: NodeKind,
    /// Guardia `when`; si evalúa falso el nodo se salta hacia `next`.
    pub guard: Option<Expr>,
    /// Sucesor por defecto (secuencial u override por `jump_to`).
    pub next: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Entry,
    End,
    ErrorExit,
    Collect(CollectNode),
    Action(ActionNode),
    Branch(BranchNode),
    Say(SayNode),
    Set(SetNode),
    Confirm(ConfirmNode),
    Generate(GenerateNode),
    CallFlow(CallFlowNode),
    Handoff(HandoffNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Entry => "entry",
            NodeKind::End => "end",
            NodeKind::ErrorExit => "error",
            NodeKind::Collect(_) => "collect",
            NodeKind::Action(_) => "action",
            NodeKind::Branch(_) => "branch",
            NodeKind::Say(_) => "say",
            NodeKind::Set(_) => "set",
            NodeKind::Confirm(_) => "confirm",
            NodeKind::Generate(_) => "generate",
            NodeKind::CallFlow(_) => "call_flow",
            NodeKind::Handoff(_) => "handoff",
        }
    }

    /// Un nodo bloqueante consume input del usuario antes de continuar. Es
    /// lo que vuelve seguro un ciclo estructural.
    pub fn is_blocking(&self) -> bool {
        matches!(self, NodeKind::Collect(_) | NodeKind::Confirm(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectNode {
    pub slot: String,
    /// `true` limpia el slot antes de recolectar.
    pub force: bool,
    pub max_attempts: Option<u32>,
    pub on_invalid: Option<Target>,
    pub reprompt_message: Option<String>,
    /// Plazo en segundos para la respuesta del usuario.
    pub timeout: Option<f64>,
    /// Ruta al vencer el plazo; sin declarar, un único re-prompt.
    pub on_timeout: Option<Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Intentos totales, incluido el primero.
    pub max_attempts: u32,
    pub delay: f64,
    pub backoff: BackoffKind,
    /// Filtro de kinds reintentables; `None` reintenta cualquier error local.
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1,
               delay: 0.0,
               backoff: BackoffKind::Fixed,
               retry_on: None }
    }
}

impl RetryPolicy {
    /// Espera antes del intento `attempt` (1-based; el primer intento no
    /// espera).
    pub fn delay_before(&self, attempt: u32) -> f64 {
        if attempt <= 1 || self.delay <= 0.0 {
            return 0.0;
        }
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Linear => self.delay * (attempt - 1) as f64,
            BackoffKind::Exponential => self.delay * 2f64.powi(attempt as i32 - 2),
        }
    }

    pub fn retries(&self, kind: ErrorKind) -> bool {
        if kind.is_terminal() {
            return false;
        }
        match &self.retry_on {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionNode {
    pub call: String,
    /// Contrato declarado de la acción en el documento.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// salida de la acción → slot destino.
    pub map_outputs: IndexMap<String, String>,
    /// Presupuesto por intento, en segundos.
    pub timeout: Option<f64>,
    pub retry: RetryPolicy,
    pub on_error: Option<Target>,
    /// Ruta preferente cuando el fallo terminal es un timeout.
    pub on_timeout: Option<Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCase {
    pub condition: Expr,
    pub then: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchNode {
    pub cases: Vec<CompiledCase>,
    /// Sin `else` el runtime cae al sucesor secuencial (`node.next`).
    pub else_to: Option<Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SayNode {
    pub message: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetNode {
    pub values: Vec<(String, ValueTemplate)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmNode {
    pub message: Option<String>,
    pub response: Option<String>,
    pub on_yes: Option<Target>,
    pub on_no: Option<Target>,
    pub on_change: Option<Target>,
    pub on_correction: Option<Target>,
    pub on_modification: Option<Target>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateNode {
    pub instruction: String,
    pub context: Vec<String>,
    pub store_as: Option<String>,
    pub on_error: Option<Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallFlowNode {
    pub flow: String,
    /// slot del hijo → slot del padre a copiar en el push.
    pub inputs: IndexMap<String, String>,
    /// slot del hijo → slot del padre a propagar en el pop.
    pub outputs: IndexMap<String, String>,
    pub on_error: Option<Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffNode {
    pub queue: Option<String>,
    pub context: Vec<String>,
    pub message: Option<String>,
    pub response: Option<String>,
}

/// Grafo compilado de un flujo.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    pub flow_name: String,
    pub nodes: Vec<Node>,
    pub entry: NodeId,
    pub end: NodeId,
    pub error_exit: NodeId,
    /// step id → nodo (sólo steps declarados, no sintéticos).
    pub by_step: IndexMap<String, NodeId>,
    /// `on_error` a nivel de flujo.
    pub on_error: Option<Target>,
    /// Avisos no fatales (p.ej. branch no exhaustivo sin else).
    pub warnings: Vec<String>,
    pub definition_hash: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl FlowGraph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn resolve_step(&self, step_id: &str) -> Option<NodeId> {
        self.by_step.get(step_id).copied()
    }

    /// Primer step real del flujo (target del ENTRY).
    pub fn entry_step(&self) -> Option<&str> {
        match self.nodes[self.entry].next {
            Target::Node(id) => Some(self.nodes[id].step_id.as_str()),
            _ => None,
        }
    }

    /// Targets salientes estructurales de un nodo (para validación).
    pub fn successors(&self, id: NodeId) -> Vec<Target> {
        let node = &self.nodes[id];
        let mut out = vec![node.next];
        match &node.kind {
            NodeKind::Branch(branch) => {
                out.extend(branch.cases.iter().map(|c| c.then));
                if let Some(t) = branch.else_to {
                    out.push(t);
                }
            }
            NodeKind::Collect(collect) => {
                if let Some(t) = collect.on_invalid {
                    out.push(t);
                }
                if let Some(t) = collect.on_timeout {
                    out.push(t);
                }
            }
            NodeKind::Action(action) => {
                if let Some(t) = action.on_error {
                    out.push(t);
                }
                if let Some(t) = action.on_timeout {
                    out.push(t);
                }
            }
            NodeKind::Confirm(confirm) => {
                for t in [confirm.on_yes,
                          confirm.on_no,
                          confirm.on_change,
                          confirm.on_correction,
                          confirm.on_modification]
                {
                    if let Some(t) = t {
                        out.push(t);
                    }
                }
            }
            NodeKind::Generate(generate) => {
                if let Some(t) = generate.on_error {
                    out.push(t);
                }
            }
            NodeKind::CallFlow(call) => {
                if let Some(t) = call.on_error {
                    out.push(t);
                }
            }
            NodeKind::End | NodeKind::ErrorExit => {
                out.clear();
            }
            _ => {}
        }
        out
    }
}

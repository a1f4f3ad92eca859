//! Executors de nodos.
//!
//! Un executor por tipo de step con firma uniforme:
//! `execute(node, state, ctx) → Advance(delta, target) | Suspend | Fail`.
//!
//! Los executors son productores de deltas: leen el estado, jamás lo mutan.
//! El despacho es un `match` sobre el tipo de nodo (variante etiquetada, sin
//! jerarquías de herencia); el driver del runtime aplica los deltas y sigue
//! los targets.

mod action;
mod branch;
mod call_flow;
mod collect;
mod confirm;
mod generate;
mod handoff;
mod say;
mod set_values;

pub use collect::{check_collect_timeout, resume_collect, CollectResume, CollectTimeout};
pub use confirm::{resume_confirm, ConfirmResume};

use serde_json::{Map, Value};

use crate::constants::SUMMARY_WINDOW;
use crate::errors::ActionFailure;
use crate::expr::VarResolver;
use crate::flow::FlowManager;
use crate::graph::{CompiledConfig, Node, NodeKind, Target};
use crate::nlu::NluEngine;
use crate::registry::Registries;
use crate::state::{DialogueState, FlowDelta, PendingTask};

/// Señal de handoff, opaca para el core: el transporte decide qué hacer con
/// ella.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HandoffSignal {
    pub queue: String,
    pub context: Map<String, Value>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuspendReason {
    /// `collect` espera input del usuario.
    WaitingForUser,
    /// `confirm` espera confirmación.
    WaitingForConfirmation,
    /// `call_flow` apiló un hijo; el driver continúa en el hijo.
    FlowPushed,
    /// `handoff` cerró la sesión desde la perspectiva del runtime.
    HandedOff(HandoffSignal),
}

#[derive(Debug)]
pub enum ExecOutcome {
    /// El nodo terminó; aplicar delta y seguir hacia `to`.
    Advance { delta: FlowDelta, to: Target },
    /// El nodo bloquea; aplicar delta y detener (o continuar, si es push).
    Suspend { delta: FlowDelta, reason: SuspendReason },
    /// El nodo falló; el driver aplica la regla de propagación de errores.
    Fail(ActionFailure),
}

/// Colaboradores resueltos del turno. Vive sólo durante el turno y nunca se
/// serializa (el estado puro viaja aparte).
pub struct RuntimeContext<'a> {
    pub config: &'a CompiledConfig,
    pub registries: &'a Registries,
    pub nlu: &'a dyn NluEngine,
    pub flow_manager: &'a FlowManager,
}

impl<'a> RuntimeContext<'a> {
    pub fn settings(&self) -> &soni_dsl::Settings {
        &self.config.document.settings
    }
}

/// Resolución de variables de estado para el motor de expresiones.
///
/// Orden: slots del frame activo → `flow.*` (alias explícito del local) →
/// `session.*` → variables builtin (`conversation_summary`,
/// `_validation_attempts`; las `_error*` viven ya en los slots del frame) →
/// indefinido.
pub struct StateResolver<'a> {
    pub state: &'a DialogueState,
}

impl VarResolver for StateResolver<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        match name {
            "flow" => {
                let slots = self.state.top_slots()?;
                Some(Value::Object(slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            }
            "session" => {
                Some(Value::Object(self.state
                                       .session_slots
                                       .iter()
                                       .map(|(k, v)| (k.clone(), v.clone()))
                                       .collect()))
            }
            "conversation_summary" => Some(Value::String(conversation_summary(self.state))),
            "_validation_attempts" => match &self.state.pending_task {
                Some(PendingTask::Collect { attempts, .. }) => Some(Value::from(*attempts)),
                Some(PendingTask::Confirm { attempts, .. }) => Some(Value::from(*attempts)),
                _ => Some(Value::from(0)),
            },
            _ => {
                if let Some(value) = self.state.get_slot(name) {
                    return Some(value.clone());
                }
                self.state.session_slots.get(name).cloned()
            }
        }
    }
}

/// Resumen compacto de la conversación (`{conversation_summary}`): las
/// últimas utterances en formato `rol: texto`.
pub fn conversation_summary(state: &DialogueState) -> String {
    let from = state.messages.len().saturating_sub(SUMMARY_WINDOW);
    state.messages[from..].iter()
                          .map(|m| {
                              let role = match m.role {
                                  crate::state::Role::User => "user",
                                  crate::state::Role::Assistant => "assistant",
                              };
                              format!("{role}: {}", m.text)
                          })
                          .collect::<Vec<_>>()
                          .join("\n")
}

/// Despacho por tipo de nodo. Los sintéticos no se ejecutan: el driver los
/// interpreta directamente.
pub async fn execute_node(node: &Node, state: &DialogueState, ctx: &RuntimeContext<'_>) -> ExecOutcome {
    match &node.kind {
        NodeKind::Collect(collect) => collect::execute(node, collect, state, ctx),
        NodeKind::Action(action) => action::execute(node, action, state, ctx).await,
        NodeKind::Branch(branch) => branch::execute(node, branch, state),
        NodeKind::Say(say) => say::execute(node, say, state, ctx),
        NodeKind::Set(set) => set_values::execute(node, set, state),
        NodeKind::Confirm(confirm) => confirm::execute(node, confirm, state, ctx),
        NodeKind::Generate(generate) => generate::execute(node, generate, state, ctx).await,
        NodeKind::CallFlow(call) => call_flow::execute(node, call, state, ctx),
        NodeKind::Handoff(handoff) => handoff::execute(node, handoff, state, ctx),
        NodeKind::Entry | NodeKind::End | NodeKind::ErrorExit => {
            ExecOutcome::Advance { delta: FlowDelta::empty(),
                                   to: node.next }
        }
    }
}

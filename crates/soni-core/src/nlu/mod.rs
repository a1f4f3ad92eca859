//! Contrato del colaborador NLU.
//!
//! El core trata al NLU como un colaborador enchufable con dos puntos de
//! entrada (ambos awaitables):
//! - `understand_full`: intención + slots sobre el mensaje completo.
//! - `understand_slot`: entendimiento ligero cuando la sesión espera un slot
//!   o una confirmación concreta.
//!
//! Qué entrada se usa en cada turno lo decide el router del runtime según
//! `conversation_state`. Los fallos de NLU se propagan como errores de step;
//! fallos repetidos escalan vía `on_no_progress`.

mod scope;

pub use scope::{available_commands, CommandScope};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::state::Message;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("nlu: {0}")]
pub struct NluError(pub String);

/// Comando estructurado emitido por el NLU (tras el mapeo de scoping).
/// El orquestador los aplica en orden de prioridad fija, no en el orden en
/// que el NLU los produjo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NluCommand {
    CancelFlow,
    StartFlow { flow: String },
    SetSlot { name: String, value: Value },
    ConfirmYes,
    ConfirmNo,
    Correct { slot: String, value: Value },
    Modify { slot: String, value: Value },
    /// Pregunta lateral sin abandono del flujo activo.
    Digression { flow: String },
    OutOfScope,
}

impl NluCommand {
    /// Prioridad de aplicación: CancelFlow < StartFlow < SetSlot < Confirm*.
    pub fn priority(&self) -> u8 {
        match self {
            NluCommand::CancelFlow => 0,
            NluCommand::StartFlow { .. } | NluCommand::Digression { .. } | NluCommand::OutOfScope => 1,
            NluCommand::SetSlot { .. } => 2,
            NluCommand::ConfirmYes
            | NluCommand::ConfirmNo
            | NluCommand::Correct { .. }
            | NluCommand::Modify { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Information,
    Question,
    Chitchat,
    Unknown,
}

/// Resultado del punto de entrada completo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullUnderstanding {
    pub message_type: MessageType,
    /// Nombre de flujo/acción declarado en el documento, si se reconoció.
    pub command: Option<String>,
    #[serde(default)]
    pub slots: HashMap<String, Value>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Clasificación de la respuesta del usuario cuando se esperaba un slot o
/// una confirmación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAnswerKind {
    SlotValue,
    IntentChange,
    Question,
    Clarification,
    Correction,
    Cancellation,
    Confirmation,
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotUnderstanding {
    pub kind: SlotAnswerKind,
    /// Valor extraído (para `slot_value`/`correction`) o booleano (para
    /// `confirmation`).
    #[serde(default)]
    pub value: Option<Value>,
    /// Slot al que apunta una corrección, si no es el que se esperaba.
    #[serde(default)]
    pub target_slot: Option<String>,
    pub confidence: f64,
}

/// Contexto entregado al NLU: el vocabulario de comandos permitido en este
/// punto del diálogo y los slots esperados.
#[derive(Debug, Clone, PartialEq)]
pub struct NluContext {
    pub available_flows: Vec<String>,
    pub expected_slots: Vec<String>,
    pub waiting_slot: Option<String>,
    pub can_cancel: bool,
    pub language: Option<String>,
}

#[async_trait]
pub trait NluEngine: Send + Sync {
    async fn understand_full(&self,
                             message: &str,
                             history: &[Message],
                             ctx: &NluContext)
                             -> Result<FullUnderstanding, NluError>;

    async fn understand_slot(&self,
                             message: &str,
                             waiting_slot: &str,
                             ctx: &NluContext)
                             -> Result<SlotUnderstanding, NluError>;

    /// Punto de entrada generativo usado por el step `generate`.
    async fn generate(&self, instruction: &str, context: &Map<String, Value>) -> Result<String, NluError>;
}

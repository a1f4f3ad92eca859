//! Taxonomía de errores del core.
//!
//! Tres familias:
//! - `CompileError`: fail-fast al compilar el documento a grafos.
//! - `ActionFailure` + `ErrorKind`: errores de step en runtime. Los kinds
//!   locales se enrutan por `on_error` (step → flujo → terminar con ERROR);
//!   los terminales cierran el flujo directamente.
//! - `RuntimeError`: errores del bucle de turnos (sesión, checkpoint, NLU).
//!
//! `ErrorKind::as_str` es el valor observable en `_error_type`; los detalles
//! por tipo (`_error_details`) los construyen los helpers de `ActionFailure`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileError {
    #[error("flow '{flow}' step '{step}': unknown target '{target}'")]
    UnknownStepTarget { flow: String, step: String, target: String },
    #[error("flow '{flow}': duplicate step id '{step}'")]
    DuplicateStepId { flow: String, step: String },
    #[error("flow '{flow}': step '{step}' is unreachable from entry")]
    UnreachableNode { flow: String, step: String },
    #[error("flow '{flow}': cycle without blocking step: {cycle:?}")]
    UnsafeCycle { flow: String, cycle: Vec<String> },
    #[error("flow '{flow}' step '{step}': action '{action}' is not registered")]
    UnknownAction { flow: String, step: String, action: String },
    #[error("slot '{slot}': validator '{validator}' is not registered")]
    UnknownValidator { slot: String, validator: String },
    #[error("slot '{slot}': normalizer '{normalizer}' is not registered")]
    UnknownNormalizer { slot: String, normalizer: String },
    #[error("flow '{flow}' step '{step}': called flow '{target}' does not exist")]
    UnknownFlow { flow: String, step: String, target: String },
    #[error("flow '{flow}' step '{step}': invalid expression: {detail}")]
    InvalidExpression { flow: String, step: String, detail: String },
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

/// Clase de error observable en `_error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Locales: enrutables por on_error.
    Timeout,
    Connection,
    RateLimited,
    Validation,
    NotFound,
    Permission,
    PaymentFailed,
    QueueNotFound,
    HandoffUnavailable,
    // Terminales: el flujo termina con ERROR.
    LoopDetected,
    MissingInput,
    InvalidStateTransition,
    MaxStackDepth,
    UnknownRuntime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::PaymentFailed => "payment_failed",
            ErrorKind::QueueNotFound => "queue_not_found",
            ErrorKind::HandoffUnavailable => "handoff_unavailable",
            ErrorKind::LoopDetected => "loop_detected",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::MaxStackDepth => "max_stack_depth",
            ErrorKind::UnknownRuntime => "unknown_runtime",
        }
    }

    /// Los kinds terminales no se enrutan por `on_error`: cierran el flujo.
    pub fn is_terminal(&self) -> bool {
        matches!(self,
                 ErrorKind::LoopDetected
                 | ErrorKind::MissingInput
                 | ErrorKind::InvalidStateTransition
                 | ErrorKind::MaxStackDepth
                 | ErrorKind::UnknownRuntime)
    }

    pub fn parse(name: &str) -> Option<ErrorKind> {
        Some(match name {
            "timeout" => ErrorKind::Timeout,
            "connection" => ErrorKind::Connection,
            "rate_limited" => ErrorKind::RateLimited,
            "validation" => ErrorKind::Validation,
            "not_found" => ErrorKind::NotFound,
            "permission" => ErrorKind::Permission,
            "payment_failed" => ErrorKind::PaymentFailed,
            "queue_not_found" => ErrorKind::QueueNotFound,
            "handoff_unavailable" => ErrorKind::HandoffUnavailable,
            "loop_detected" => ErrorKind::LoopDetected,
            "missing_input" => ErrorKind::MissingInput,
            "invalid_state_transition" => ErrorKind::InvalidStateTransition,
            "max_stack_depth" => ErrorKind::MaxStackDepth,
            "unknown_runtime" => ErrorKind::UnknownRuntime,
            _ => return None,
        })
    }
}

/// Fallo de un step. Es el payload con el que se setean atómicamente las
/// variables `_error*` y el input de la regla de propagación.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct ActionFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl ActionFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind,
               message: message.into(),
               code: None,
               details: Value::Null }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// `timeout → {timeout_seconds, action_name}`
    pub fn timeout(action_name: &str, timeout_seconds: f64) -> Self {
        Self::new(ErrorKind::Timeout, format!("action '{action_name}' timed out")).with_details(json!({
                      "timeout_seconds": timeout_seconds,
                      "action_name": action_name,
                  }))
    }

    /// `connection → {url, status_code, retry_count}`
    pub fn connection(url: &str, status_code: u16, retry_count: u32) -> Self {
        Self::new(ErrorKind::Connection, format!("connection to {url} failed")).with_details(json!({
                      "url": url,
                      "status_code": status_code,
                      "retry_count": retry_count,
                  }))
    }

    /// `validation → {field, expected, actual}`
    pub fn validation(field: &str, expected: &str, actual: &Value) -> Self {
        Self::new(ErrorKind::Validation, format!("invalid value for '{field}'")).with_details(json!({
                      "field": field,
                      "expected": expected,
                      "actual": actual,
                  }))
    }

    /// `rate_limited → {retry_after_seconds, limit}`
    pub fn rate_limited(retry_after_seconds: f64, limit: u64) -> Self {
        Self::new(ErrorKind::RateLimited, "rate limit exceeded").with_details(json!({
                      "retry_after_seconds": retry_after_seconds,
                      "limit": limit,
                  }))
    }

    pub fn loop_detected(step: &str, executions: u32) -> Self {
        Self::new(ErrorKind::LoopDetected,
                  format!("step '{step}' exceeded {executions} executions")).with_details(json!({ "step": step, "executions": executions }))
    }

    pub fn missing_input(action: &str, input: &str) -> Self {
        Self::new(ErrorKind::MissingInput,
                  format!("action '{action}' requires input '{input}'")).with_details(json!({ "action": action, "input": input }))
    }
}

/// Errores del bucle de turnos. No se mezclan con los fallos de step: un
/// `RuntimeError` aborta el turno sin commit (el último checkpoint manda).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidStateTransition { from: String, to: String },
    #[error("flow stack depth limit reached ({depth})")]
    MaxStackDepth { depth: usize },
    #[error("a turn is already in flight for user '{user_id}'")]
    SessionBusy { user_id: String },
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("nlu error: {0}")]
    Nlu(String),
    #[error("internal: {0}")]
    Internal(String),
}

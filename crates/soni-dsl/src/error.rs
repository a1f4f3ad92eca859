//! Errores de parsing/validación del documento (fail-fast, estructurados).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DslError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unsupported document version '{0}'")]
    UnsupportedVersion(String),
    #[error("flow '{flow}': duplicate step id '{step}'")]
    DuplicateStepId { flow: String, step: String },
    #[error("flow '{flow}': step id '{step}' is a reserved keyword")]
    ReservedStepId { flow: String, step: String },
    #[error("flow '{flow}' step '{step}': missing required field '{field}' for type '{step_type}'")]
    MissingField {
        flow: String,
        step: String,
        field: &'static str,
        step_type: String,
    },
    #[error("flow '{flow}' step '{step}': field '{field}' is not valid for type '{step_type}'")]
    ForeignField {
        flow: String,
        step: String,
        field: &'static str,
        step_type: String,
    },
    #[error("flow '{flow}' step '{step}': references undeclared slot '{slot}'")]
    UnknownSlot { flow: String, step: String, slot: String },
    #[error("flow '{flow}' step '{step}': references undeclared action '{action}'")]
    UndeclaredAction { flow: String, step: String, action: String },
    #[error("flow '{flow}' step '{step}': references undeclared flow '{target}'")]
    UndeclaredFlow { flow: String, step: String, target: String },
    #[error("flow '{flow}' step '{step}': branch requires a case list in 'when'")]
    BranchWithoutCases { flow: String, step: String },
    #[error("flow '{flow}' step '{step}': branch case must have exactly one of condition/all/any")]
    AmbiguousBranchCase { flow: String, step: String },
    #[error("flow '{flow}': empty process")]
    EmptyProcess { flow: String },
    #[error("slot '{slot}': default value does not match declared type {expected}")]
    DefaultTypeMismatch { slot: String, expected: String },
    #[error("schema violation: {0}")]
    Schema(String),
}

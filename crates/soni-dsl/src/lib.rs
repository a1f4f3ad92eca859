//! soni-dsl: documento declarativo de flujos (parsing + validación).
//!
//! Propósito:
//! - Parsear el documento YAML de flujos (secciones `version`, `settings`,
//!   `responses`, `slots`, `actions`, `flows`) a una IR tipada con serde.
//! - Validar la forma estructural (ids únicos, campos por tipo de step,
//!   referencias a slots/acciones/flujos declarados) produciendo errores
//!   fail-fast.
//!
//! Lo que NO hace este crate:
//! - No resuelve targets a nodos ni detecta ciclos/alcanzabilidad: eso es
//!   trabajo del compilador de grafos (soni-core).
//! - No evalúa expresiones: las condiciones y plantillas se conservan como
//!   texto y se compilan después.
//!
//! El parsing es una función pura de texto → IR: el mismo documento produce
//! siempre la misma IR.

pub mod document;
pub mod error;
pub mod settings;
pub mod step;
pub mod validate;

pub use document::{ActionDef, FlowDef, FlowDocument, ResponseDef, ResponseEntry, SlotDef, SlotType, Translation,
                   TriggerDef};
pub use error::DslError;
pub use settings::{BusyPolicy, CollectionSettings, ConversationSettings, FlowManagementSettings, HandoffSettings,
                   I18nSettings, OnLimitReached, OnNoProgress, PersistenceSettings, RuntimeSettings, Settings};
pub use step::{BackoffKind, BranchCase, RetryDef, StepDef, StepType, WhenClause};

/// Palabras reservadas que no pueden usarse como id de step y que actúan como
/// targets especiales de `jump_to`/`then`/`on_*`.
pub const RESERVED_TARGETS: [&str; 4] = ["end", "error", "continue", "cancel_flow"];

/// Parsea y valida un documento de flujos desde texto YAML.
pub fn parse_document(text: &str) -> Result<FlowDocument, DslError> {
    let doc: FlowDocument = serde_yaml::from_str(text).map_err(|e| DslError::Parse(e.to_string()))?;
    validate::validate_document(&doc)?;
    Ok(doc)
}

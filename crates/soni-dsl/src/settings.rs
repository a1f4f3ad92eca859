//! Sección `settings` del documento.
//!
//! Cada sub-sección tiene defaults razonables; un documento vacío produce una
//! configuración completa. Las opciones reconocidas y su efecto están
//! documentadas campo a campo; claves desconocidas se rechazan en modo
//! estricto.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub persistence: PersistenceSettings,
    pub flow_management: FlowManagementSettings,
    pub conversation: ConversationSettings,
    pub collection: CollectionSettings,
    pub handoff: HandoffSettings,
    pub i18n: I18nSettings,
}

/// Límites del motor de ejecución.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Tope de ejecuciones por nodo y por frame (protección de bucles).
    pub max_step_executions: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { max_step_executions: 50 }
    }
}

/// Selección del backend de checkpoints. El valor es opaco para el core; el
/// host lo usa para elegir implementación concreta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceSettings {
    pub backend: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { backend: "memory".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FlowManagementSettings {
    /// Profundidad máxima del stack de flujos.
    pub max_stack_depth: usize,
    /// Política al alcanzar el límite de profundidad.
    pub on_limit_reached: OnLimitReached,
}

impl Default for FlowManagementSettings {
    fn default() -> Self {
        Self { max_stack_depth: 8,
               on_limit_reached: OnLimitReached::CancelOldest }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnLimitReached {
    CancelOldest,
    RejectNew,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConversationSettings {
    /// Flujo inicial al abrir sesión (opcional).
    pub default_flow: Option<String>,
    /// Flujo invocado ante comandos fuera de alcance.
    pub fallback_flow: Option<String>,
    /// Segundos de inactividad tras los cuales la sesión expira.
    pub session_timeout: u64,
    /// Turnos sin progreso antes de escalar.
    pub max_turns_without_progress: u32,
    pub on_no_progress: OnNoProgress,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self { default_flow: None,
               fallback_flow: None,
               session_timeout: 1800,
               max_turns_without_progress: 3,
               on_no_progress: OnNoProgress::Handoff }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnNoProgress {
    Handoff,
    Fallback,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CollectionSettings {
    /// Intentos de validación por slot antes de aplicar `on_invalid`.
    pub max_validation_attempts: u32,
    /// Segundos de espera máxima para validadores asíncronos.
    pub validation_timeout: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self { max_validation_attempts: 3,
               validation_timeout: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HandoffSettings {
    /// Cola destino cuando un handoff no especifica una.
    pub default_queue: String,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self { default_queue: "support".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct I18nSettings {
    pub default_language: String,
    pub supported_languages: Vec<String>,
    pub auto_detect: bool,
}

impl Default for I18nSettings {
    fn default() -> Self {
        Self { default_language: "en".to_string(),
               supported_languages: vec!["en".to_string()],
               auto_detect: false }
    }
}

/// Política del runtime ante un segundo turno concurrente del mismo usuario.
/// No viene del documento: la fija el host al construir el runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusyPolicy {
    /// El turno entrante espera a que termine el turno en vuelo.
    #[default]
    Wait,
    /// El turno entrante se rechaza con error.
    Reject,
}

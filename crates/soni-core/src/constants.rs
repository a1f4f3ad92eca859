//! Constantes del runtime core.

/// Versión lógica del motor. Participa en el hash de definición de cada grafo
/// compilado: un cambio de versión del motor invalida los hashes aunque el
/// documento no cambie.
pub const ENGINE_VERSION: &str = "DRC-1.0";

/// Targets reservados (no utilizables como id de step).
pub const TARGET_END: &str = "end";
pub const TARGET_ERROR: &str = "error";
pub const TARGET_CONTINUE: &str = "continue";
pub const TARGET_CANCEL_FLOW: &str = "cancel_flow";

/// Claves de metadata internas.
pub const META_TRACE: &str = "_trace";
pub const META_NO_PROGRESS: &str = "_turns_without_progress";

/// Turnos conservados en la traza compacta de `metadata._trace`.
pub const TRACE_CAP: usize = 20;

/// Confianza mínima del entendimiento ligero de slot; por debajo se cae al
/// NLU completo.
pub const SLOT_CONFIDENCE_FLOOR: f64 = 0.6;

/// Mensajes retenidos al construir `{conversation_summary}`.
pub const SUMMARY_WINDOW: usize = 10;

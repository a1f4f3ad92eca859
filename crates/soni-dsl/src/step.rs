//! Definición de steps del proceso de un flujo.
//!
//! Forma universal: `{step, type, when?, jump_to?}` más campos específicos por
//! tipo. Se modela como un único struct con la unión de campos (modo estricto
//! de serde sobre claves) y la verificación por-tipo (obligatorios/foráneos)
//! vive en `validate`. El compilador baja cada `StepDef` a su `NodeSpec`
//! según `step_type`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Collect,
    Action,
    Branch,
    Say,
    Confirm,
    Generate,
    CallFlow,
    Set,
    Handoff,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Collect => "collect",
            StepType::Action => "action",
            StepType::Branch => "branch",
            StepType::Say => "say",
            StepType::Confirm => "confirm",
            StepType::Generate => "generate",
            StepType::CallFlow => "call_flow",
            StepType::Set => "set",
            StepType::Handoff => "handoff",
        }
    }
}

/// Cláusula `when`: guardia escalar para cualquier step, o lista de casos
/// cuando el step es `branch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WhenClause {
    /// Expresión cruda (sin llaves); si evalúa falso el step se salta.
    Guard(String),
    /// Casos de un `branch`, evaluados en orden de declaración.
    Cases(Vec<BranchCase>),
}

/// Caso de un `branch`. Exactamente una de `condition`/`all`/`any` debe estar
/// presente; `all`/`any` equivalen a la conjunción/disyunción de sus
/// elementos.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BranchCase {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub all: Option<Vec<String>>,
    #[serde(default)]
    pub any: Option<Vec<String>>,
    pub then: String,
}

/// Política de reintentos de un `action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryDef {
    /// Intentos totales (incluido el primero).
    pub max_attempts: u32,
    /// Espera base entre intentos, en segundos.
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Si está presente, sólo estos `_error_type` disparan reintento.
    #[serde(default)]
    pub retry_on: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Step declarado. Unión de los campos de todos los tipos; `validate`
/// garantiza que cada instancia sólo usa los campos de su `step_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    /// Id del step, único dentro del flujo y distinto de toda palabra
    /// reservada.
    pub step: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub when: Option<WhenClause>,
    /// Target explícito tras completar el step (por defecto: el siguiente en
    /// orden de declaración).
    #[serde(default)]
    pub jump_to: Option<String>,

    // -- collect --
    #[serde(default)]
    pub slot: Option<String>,
    /// `true` limpia el slot antes de recolectar aunque ya tenga valor.
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub on_invalid: Option<String>,
    #[serde(default)]
    pub reprompt_message: Option<String>,

    // -- action --
    #[serde(default)]
    pub call: Option<String>,
    /// Renombrado salida-de-acción → slot destino.
    #[serde(default)]
    pub map_outputs: Option<IndexMap<String, String>>,
    /// Presupuesto de reloj por intento, en segundos.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry: Option<RetryDef>,
    #[serde(default)]
    pub on_error: Option<String>,
    #[serde(default)]
    pub on_timeout: Option<String>,

    // -- branch --
    #[serde(default, rename = "else")]
    pub else_to: Option<String>,

    // -- say / confirm / handoff --
    #[serde(default)]
    pub message: Option<String>,
    /// Nombre de entrada en la sección `responses`.
    #[serde(default)]
    pub response: Option<String>,

    // -- confirm --
    #[serde(default)]
    pub on_yes: Option<String>,
    #[serde(default)]
    pub on_no: Option<String>,
    #[serde(default)]
    pub on_change: Option<String>,
    #[serde(default)]
    pub on_correction: Option<String>,
    #[serde(default)]
    pub on_modification: Option<String>,

    // -- generate --
    #[serde(default)]
    pub instruction: Option<String>,
    /// Nombres de slots a incluir como contexto (generate/handoff).
    #[serde(default)]
    pub context: Option<Vec<String>>,
    #[serde(default)]
    pub store_as: Option<String>,

    // -- call_flow --
    #[serde(default)]
    pub flow: Option<String>,
    /// slot del hijo → expresión/slot del padre.
    #[serde(default)]
    pub inputs: Option<IndexMap<String, String>>,
    /// slot del hijo → slot del padre (propagación al hacer pop).
    #[serde(default)]
    pub outputs: Option<IndexMap<String, String>>,

    // -- set --
    #[serde(default)]
    pub values: Option<IndexMap<String, serde_json::Value>>,

    // -- handoff --
    #[serde(default)]
    pub queue: Option<String>,

    /// Bolsa libre; exenta del modo estricto.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl StepDef {
    /// Guardia escalar (`when` de tipo expresión), si existe.
    pub fn guard(&self) -> Option<&str> {
        match &self.when {
            Some(WhenClause::Guard(g)) => Some(g.as_str()),
            _ => None,
        }
    }

    /// Casos de branch, si `when` trae la forma de lista.
    pub fn branch_cases(&self) -> Option<&[BranchCase]> {
        match &self.when {
            Some(WhenClause::Cases(cases)) => Some(cases.as_slice()),
            _ => None,
        }
    }
}

//! IR del documento de flujos.
//!
//! Secciones top-level: `version`, `settings`, `responses`, `slots`,
//! `actions`, `flows`. Se usa `IndexMap` para conservar el orden de
//! declaración: el orden de los steps determina los sucesores secuenciales
//! por defecto en el compilador.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::Settings;
use crate::step::StepDef;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowDocument {
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub responses: IndexMap<String, ResponseDef>,
    #[serde(default)]
    pub slots: IndexMap<String, SlotDef>,
    #[serde(default)]
    pub actions: IndexMap<String, ActionDef>,
    pub flows: IndexMap<String, FlowDef>,
}

impl FlowDocument {
    /// Busca un slot declarado por nombre.
    pub fn slot(&self, name: &str) -> Option<&SlotDef> {
        self.slots.get(name)
    }

    /// Busca una acción declarada por nombre.
    pub fn action(&self, name: &str) -> Option<&ActionDef> {
        self.actions.get(name)
    }
}

/// Tipos de slot soportados.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Object,
}

impl SlotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotType::String => "string",
            SlotType::Integer => "integer",
            SlotType::Float => "float",
            SlotType::Boolean => "boolean",
            SlotType::Date => "date",
            SlotType::Object => "object",
        }
    }

    /// ¿El valor JSON es admisible para este tipo? `date` acepta strings
    /// (formato canónico YYYY-MM-DD tras normalización).
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            SlotType::String | SlotType::Date => value.is_string(),
            SlotType::Integer => value.is_i64() || value.is_u64(),
            SlotType::Float => value.is_number(),
            SlotType::Boolean => value.is_boolean(),
            SlotType::Object => value.is_object(),
        }
    }
}

/// Declaración de un slot. `validator`/`normalizer` son nombres semánticos
/// resueltos contra los registries en compilación.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlotDef {
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    pub prompt: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub normalizer: Option<String>,
    /// Mensaje mostrado cuando la validación falla (plantilla).
    #[serde(default)]
    pub invalid_message: Option<String>,
}

/// Contrato de una acción: sólo nombres de entrada/salida. La ejecución la
/// aporta el ActionRegistry; el documento nunca referencia código.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionDef {
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowDef {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: Option<TriggerDef>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Target de error a nivel de flujo (ver regla de propagación).
    #[serde(default)]
    pub on_error: Option<String>,
    pub process: Vec<StepDef>,
}

/// Frases de ejemplo para el entrenamiento/scoping del NLU.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TriggerDef {
    #[serde(default)]
    pub intents: Vec<String>,
}

/// Entrada de la sección `responses`. Formas admitidas:
/// texto plano, `{default, variations}`, o por-idioma (`<lang>: string` /
/// `<lang>: {default, variations}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseDef {
    Text(String),
    Entry(ResponseEntry),
}

/// Las claves distintas de `default`/`variations` se interpretan como códigos
/// de idioma (el flatten absorbe las traducciones, por eso esta struct no
/// participa del modo estricto).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseEntry {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub variations: Option<Vec<String>>,
    #[serde(flatten)]
    pub translations: IndexMap<String, Translation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Translation {
    Text(String),
    Entry {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        variations: Option<Vec<String>>,
    },
}

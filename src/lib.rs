//! Soni: framework de diálogo orientado a tareas.
//!
//! Este crate raíz es el cableado de demostración sobre el núcleo:
//! - `nlu`: un NLU de palabras clave, determinista, suficiente para la demo
//!   y los tests end-to-end (el NLU real es un colaborador externo).
//! - Helpers para poblar registries y compilar el documento de viajes.
//!
//! La lógica de diálogo vive en `soni-core`; el documento en
//! `demos/travel.yaml`.

pub mod nlu;

use std::sync::Arc;

use soni_core::{compile, CompiledConfig, Registries};

/// Documento de flujos de la demo (reserva de vuelos).
pub const TRAVEL_DOC: &str = include_str!("../demos/travel.yaml");

/// Registries con el catálogo builtin y las acciones de la demo.
pub fn build_registries() -> Arc<Registries> {
    let registries = Registries::new();
    soni_adapters::register_builtins(&registries);
    soni_adapters::actions::register_demo_actions(&registries);
    Arc::new(registries)
}

/// Parsea y compila el documento de la demo contra los registries dados.
pub fn load_demo_config(registries: &Registries) -> CompiledConfig {
    let document = soni_dsl::parse_document(TRAVEL_DOC).expect("demo document parses");
    compile(&document, registries).expect("demo document compiles")
}

//! soni-adapters: validadores, normalizadores y acciones de demostración.
//!
//! El core nunca incluye implementaciones concretas; este crate aporta el
//! catálogo builtin que los documentos pueden referenciar por nombre y un
//! punto de entrada (`register_builtins`) para poblar los registries en el
//! arranque.

pub mod actions;
pub mod normalizers;
pub mod validators;

use soni_core::Registries;

/// Puebla los tres registries con el catálogo builtin. Idempotente: volver a
/// registrar sobreescribe con las mismas implementaciones.
pub fn register_builtins(registries: &Registries) {
    validators::register(registries);
    normalizers::register(registries);
}

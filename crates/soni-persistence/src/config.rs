//! Configuración de persistencia desde entorno (.env).

use once_cell::sync::Lazy;
use std::env;

/// Ruta por defecto cuando `SONI_DB_PATH` no está definida.
pub const DEFAULT_DB_PATH: &str = "soni.db";

static DB_PATH: Lazy<String> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
    env::var("SONI_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
});

/// Ruta de la base de datos, evaluada una sola vez.
pub fn database_path_from_env() -> &'static str {
    DB_PATH.as_str()
}

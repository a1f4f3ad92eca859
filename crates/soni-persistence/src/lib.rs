//! soni-persistence
//!
//! Backend durable del `Checkpointer` sobre SQLite embebido, con paridad de
//! contrato respecto al backend en memoria del core:
//! - Una fila por sesión (`session_id` PK, estado JSON, `updated_at`).
//! - Escrituras linealizables por sesión: upsert dentro de transacción bajo
//!   una conexión serializada.
//! - Reintento con backoff corto ante errores transitorios (`busy/locked`).
//! - Las llamadas bloqueantes de rusqlite corren fuera del reactor
//!   (`spawn_blocking`).
//!
//! Módulos:
//! - `sqlite`: implementación del trait del core.
//! - `config`: ruta de base de datos desde entorno (.env).

pub mod config;
pub mod sqlite;

pub use config::database_path_from_env;
pub use sqlite::SqliteCheckpointer;

//! Implementación SQLite del `Checkpointer`.

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use soni_core::checkpoint::{CheckpointError, Checkpointer};
use soni_core::DialogueState;

/// Reintentos ante errores transitorios (`database is locked`).
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dialogue_checkpoints (
    session_id TEXT PRIMARY KEY,
    state      TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Checkpointer durable sobre una base SQLite embebida.
///
/// La conexión única tras un mutex serializa todas las escrituras, lo que
/// sobra para cumplir la linealizabilidad por sesión que exige el core; las
/// llamadas corren en el pool bloqueante de tokio.
pub struct SqliteCheckpointer {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let conn = Connection::open_with_flags(path.as_ref(),
                                               OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        // journal_mode devuelve el modo resultante; hay que leerlo.
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Base en memoria (tests).
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory().map_err(|e| CheckpointError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, CheckpointError>
        where T: Send + 'static,
              F: Fn(&Connection) -> Result<T, rusqlite::Error> + Send + Sync + 'static
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock()
                            .map_err(|_| CheckpointError::Storage("connection mutex poisoned".to_string()))?;
            let mut last_err: Option<rusqlite::Error> = None;
            for attempt in 1..=MAX_ATTEMPTS {
                match op(&guard) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                        log::warn!("transient sqlite error (attempt {attempt}/{MAX_ATTEMPTS}): {e}");
                        std::thread::sleep(RETRY_BASE * attempt);
                        last_err = Some(e);
                    }
                    Err(e) => return Err(CheckpointError::Storage(e.to_string())),
                }
            }
            Err(CheckpointError::Storage(last_err.map(|e| e.to_string())
                                                 .unwrap_or_else(|| "retries exhausted".to_string())))
        }).await
          .map_err(|e| CheckpointError::Storage(format!("join error: {e}")))?
    }
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(e,
             rusqlite::Error::SqliteFailure(err, _)
             if matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked))
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, CheckpointError> {
        let session_id_owned = session_id.to_string();
        let row: Option<String> = self.run_blocking(move |conn| {
                                          conn.query_row("SELECT state FROM dialogue_checkpoints WHERE session_id = ?1",
                                                         [session_id_owned.as_str()],
                                                         |row| row.get(0))
                                              .map(Some)
                                              .or_else(|e| match e {
                                                  rusqlite::Error::QueryReturnedNoRows => Ok(None),
                                                  other => Err(other),
                                              })
                                      })
                                      .await?;
        match row {
            None => Ok(None),
            Some(text) => {
                let state = serde_json::from_str(&text).map_err(|e| CheckpointError::Corrupt {
                                                           session_id: session_id.to_string(),
                                                           detail: e.to_string(),
                                                       })?;
                Ok(Some(state))
            }
        }
    }

    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), CheckpointError> {
        let session_id = session_id.to_string();
        let serialized = serde_json::to_string(state).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        self.run_blocking(move |conn| {
                // Upsert transaccional: o se ve el estado anterior completo o
                // el nuevo completo, nunca uno parcial.
                conn.execute_batch("BEGIN IMMEDIATE")?;
                let result = conn.execute("INSERT INTO dialogue_checkpoints (session_id, state, updated_at) \
                                           VALUES (?1, ?2, datetime('now')) \
                                           ON CONFLICT(session_id) DO UPDATE SET \
                                           state = excluded.state, updated_at = excluded.updated_at",
                                          [session_id.as_str(), serialized.as_str()]);
                match result {
                    Ok(_) => conn.execute_batch("COMMIT"),
                    Err(e) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
                conn.execute("DELETE FROM dialogue_checkpoints WHERE session_id = ?1", [session_id.as_str()])
                    .map(|_| ())
            })
            .await
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        self.run_blocking(|conn| {
                let mut stmt = conn.prepare("SELECT session_id FROM dialogue_checkpoints ORDER BY session_id")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soni_core::ConversationState;

    #[tokio::test]
    async fn save_load_roundtrip() {
        let cp = SqliteCheckpointer::open_in_memory().expect("open");
        let mut state = DialogueState::new();
        state.turn_count = 3;
        state.conversation_state = ConversationState::Understanding;
        state.session_slots.insert("tier".into(), serde_json::json!("gold"));

        cp.save("u1", &state).await.expect("save");
        let loaded = cp.load("u1").await.expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn save_overwrites_previous_state() {
        let cp = SqliteCheckpointer::open_in_memory().expect("open");
        let mut state = DialogueState::new();
        cp.save("u1", &state).await.expect("save 1");
        state.turn_count = 9;
        cp.save("u1", &state).await.expect("save 2");

        let loaded = cp.load("u1").await.expect("load").expect("present");
        assert_eq!(loaded.turn_count, 9);
        assert_eq!(cp.sessions().await.expect("sessions"), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn delete_and_missing_load() {
        let cp = SqliteCheckpointer::open_in_memory().expect("open");
        cp.save("u1", &DialogueState::new()).await.expect("save");
        cp.delete("u1").await.expect("delete");
        assert!(cp.load("u1").await.expect("load").is_none());
        assert!(cp.load("ghost").await.expect("load").is_none());
    }
}

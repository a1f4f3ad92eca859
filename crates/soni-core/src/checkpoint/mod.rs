//! Checkpointer: snapshot/restore durable por sesión.
//!
//! Contrato que el core exige al backend:
//! - `save` es linealizable por `session_id`; saves de sesiones distintas
//!   pueden proceder en paralelo.
//! - `load` tras `save` observa el valor escrito (read-your-writes sobre la
//!   misma sesión).
//! - Ambas operaciones son atómicas desde la perspectiva del llamador: nunca
//!   se persiste el estado parcial de un turno.
//!
//! El core no cachea más allá del estado en-turno: lo que hay en el
//! checkpoint es la verdad.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::state::DialogueState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt checkpoint for session '{session_id}': {detail}")]
    Corrupt { session_id: String, detail: String },
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, CheckpointError>;
    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), CheckpointError>;
    async fn delete(&self, session_id: &str) -> Result<(), CheckpointError>;
    /// Sesiones actualmente almacenadas (para el barrido de expiración).
    async fn sessions(&self) -> Result<Vec<String>, CheckpointError>;
}

#[async_trait]
impl<T: Checkpointer + ?Sized> Checkpointer for std::sync::Arc<T> {
    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, CheckpointError> {
        (**self).load(session_id).await
    }

    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), CheckpointError> {
        (**self).save(session_id, state).await
    }

    async fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        (**self).delete(session_id).await
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        (**self).sessions().await
    }
}

/// Backend en memoria: referencia simple y soporte de tests. Volátil.
pub struct InMemoryCheckpointer {
    inner: DashMap<String, DialogueState>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for InMemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, CheckpointError> {
        Ok(self.inner.get(session_id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), CheckpointError> {
        self.inner.insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.inner.remove(session_id);
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(self.inner.iter().map(|entry| entry.key().clone()).collect())
    }
}

//! Registries de extensión: acciones, validadores y normalizadores.
//!
//! Contrato:
//! - Tablas process-wide direccionadas por nombre; se pueblan en el arranque
//!   y después son de sólo lectura (lecturas concurrentes seguras).
//! - El compilador resuelve cada referencia del documento contra estas
//!   tablas: un binding ausente es error de compilación, no de runtime.
//! - Handlers y validadores/normalizadores son asíncronos; el runtime los
//!   espera con el timeout configurado.
//!
//! La normalización se cachea por `(normalizer, valor crudo)` con TTL
//! acotado: el mismo texto del usuario no paga dos veces un normalizador
//! caro.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::errors::ActionFailure;
use soni_dsl::SlotType;

/// Contexto entregado a validadores/normalizadores.
#[derive(Debug, Clone)]
pub struct SlotContext {
    pub slot: String,
    pub slot_type: SlotType,
    pub language: Option<String>,
}

/// Operación con efectos, resuelta por nombre. Entradas y salidas son dicts
/// estructurados; puede ser de larga duración y puede fallar.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure>;
}

/// Chequeo de un valor candidato. `Err` lleva un mensaje de motivo (se
/// loggea; el usuario ve el `invalid_message` del slot).
#[async_trait]
pub trait SlotValidator: Send + Sync {
    async fn validate(&self, value: &Value, ctx: &SlotContext) -> Result<(), String>;
}

/// Canonicaliza un valor crudo antes de validar. Lo que devuelve es lo que
/// ve la validación y lo que almacena el slot.
#[async_trait]
pub trait SlotNormalizer: Send + Sync {
    async fn normalize(&self, value: &Value, ctx: &SlotContext) -> Result<Value, String>;
}

pub struct ActionRegistry {
    inner: DashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.inner.insert(name.into(), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.inner.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ValidatorRegistry {
    inner: DashMap<String, Arc<dyn SlotValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn register(&self, name: impl Into<String>, validator: Arc<dyn SlotValidator>) {
        self.inner.insert(name.into(), validator);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn SlotValidator>> {
        self.inner.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NormalizerRegistry {
    inner: DashMap<String, Arc<dyn SlotNormalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn register(&self, name: impl Into<String>, normalizer: Arc<dyn SlotNormalizer>) {
        self.inner.insert(name.into(), normalizer);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn SlotNormalizer>> {
        self.inner.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache de normalización por `(normalizer, valor crudo)`.
pub struct NormalizationCache {
    entries: DashMap<(String, String), (Value, DateTime<Utc>)>,
    ttl: Duration,
    capacity: usize,
}

impl NormalizationCache {
    pub fn new(ttl_seconds: i64, capacity: usize) -> Self {
        Self { entries: DashMap::new(),
               ttl: Duration::seconds(ttl_seconds),
               capacity }
    }

    fn key(normalizer: &str, raw: &Value) -> (String, String) {
        (normalizer.to_string(), crate::hashing::to_canonical_json(raw))
    }

    pub fn get(&self, normalizer: &str, raw: &Value) -> Option<Value> {
        let key = Self::key(normalizer, raw);
        let entry = self.entries.get(&key)?;
        let (value, at) = entry.value();
        if Utc::now() - *at > self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, normalizer: &str, raw: &Value, canonical: Value) {
        if self.entries.len() >= self.capacity {
            // Purga perezosa: fuera lo expirado; si no alcanza, no se cachea.
            let now = Utc::now();
            self.entries.retain(|_, (_, at)| now - *at <= self.ttl);
            if self.entries.len() >= self.capacity {
                return;
            }
        }
        self.entries.insert(Self::key(normalizer, raw), (canonical, Utc::now()));
    }
}

/// Las tres tablas juntas, tal como las consume compilador y runtime.
pub struct Registries {
    pub actions: ActionRegistry,
    pub validators: ValidatorRegistry,
    pub normalizers: NormalizerRegistry,
    pub normalization_cache: NormalizationCache,
}

impl Registries {
    pub fn new() -> Self {
        Self { actions: ActionRegistry::new(),
               validators: ValidatorRegistry::new(),
               normalizers: NormalizerRegistry::new(),
               normalization_cache: NormalizationCache::new(300, 1024) }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn call(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
            Ok(inputs)
        }
    }

    #[tokio::test]
    async fn action_registry_resolves_by_name() {
        let registry = ActionRegistry::new();
        registry.register("echo", Arc::new(Echo));
        let handler = registry.resolve("echo").expect("resolve");
        let mut inputs = Map::new();
        inputs.insert("a".into(), json!(1));
        let out = handler.call(inputs.clone()).await.expect("call");
        assert_eq!(out, inputs);
        assert!(registry.resolve("ghost").is_none());
    }

    #[test]
    fn normalization_cache_expires() {
        let cache = NormalizationCache::new(0, 16);
        cache.put("trim", &json!(" x "), json!("x"));
        // TTL de cero segundos: cualquier lectura posterior ya expiró.
        assert_eq!(cache.get("trim", &json!(" x ")), None);

        let cache = NormalizationCache::new(60, 16);
        cache.put("trim", &json!(" x "), json!("x"));
        assert_eq!(cache.get("trim", &json!(" x ")), Some(json!("x")));
        assert_eq!(cache.get("trim", &json!(" y ")), None);
    }
}

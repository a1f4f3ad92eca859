//! Acciones de demostración y dobles de test.
//!
//! `FnAction` adapta un cierre síncrono a `ActionHandler` (suficiente para
//! demos y tests); `FlakyAction` falla un número configurable de veces antes
//! de responder, para ejercitar la política de reintentos del runtime.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use soni_core::{ActionFailure, ActionHandler, Registries};

type ActionFn = dyn Fn(Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> + Send + Sync;

pub struct FnAction {
    f: Box<ActionFn>,
}

impl FnAction {
    pub fn new(f: impl Fn(Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> + Send + Sync + 'static)
               -> Arc<Self> {
        Arc::new(Self { f: Box::new(f) })
    }
}

#[async_trait]
impl ActionHandler for FnAction {
    async fn call(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        (self.f)(inputs)
    }
}

/// Falla con `failure` en los primeros `failures` intentos y luego delega en
/// `inner`.
pub struct FlakyAction {
    failures: u32,
    calls: AtomicU32,
    failure: ActionFailure,
    inner: Arc<dyn ActionHandler>,
}

impl FlakyAction {
    pub fn new(failures: u32, failure: ActionFailure, inner: Arc<dyn ActionHandler>) -> Arc<Self> {
        Arc::new(Self { failures,
                        calls: AtomicU32::new(0),
                        failure,
                        inner })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for FlakyAction {
    async fn call(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.failure.clone());
        }
        self.inner.call(inputs).await
    }
}

/// Registra las acciones del documento de viajes de la demo.
pub fn register_demo_actions(registries: &Registries) {
    registries.actions.register("search_flights",
                                FnAction::new(|inputs| {
                                    let origin = inputs.get("origin").cloned().unwrap_or(Value::Null);
                                    let destination = inputs.get("destination").cloned().unwrap_or(Value::Null);
                                    let mut out = Map::new();
                                    out.insert("results".to_string(),
                                               json!([
                                                   {"flight": "SN100", "from": origin, "to": destination, "price": 120},
                                                   {"flight": "SN200", "from": origin, "to": destination, "price": 95},
                                               ]));
                                    Ok(out)
                                }));

    registries.actions.register("book_flight",
                                FnAction::new(|inputs| {
                                    let Some(results) = inputs.get("results").and_then(|v| v.as_array()) else {
                                        return Err(ActionFailure::validation("results", "non-empty array",
                                                                             inputs.get("results")
                                                                                   .unwrap_or(&Value::Null)));
                                    };
                                    let Some(first) = results.first() else {
                                        return Err(ActionFailure::new(soni_core::ErrorKind::NotFound,
                                                                      "no flights available"));
                                    };
                                    let mut out = Map::new();
                                    out.insert("booking_id".to_string(), json!("BK-2024-0042"));
                                    out.insert("booked_flight".to_string(), first.clone());
                                    Ok(out)
                                }));

    registries.actions.register("charge",
                                FnAction::new(|inputs| {
                                    let amount = inputs.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0);
                                    if amount <= 0.0 {
                                        return Err(ActionFailure::new(soni_core::ErrorKind::PaymentFailed,
                                                                      "amount must be positive"));
                                    }
                                    let mut out = Map::new();
                                    out.insert("receipt".to_string(), json!(format!("RCPT-{amount:.2}")));
                                    Ok(out)
                                }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use soni_core::ErrorKind;

    #[tokio::test]
    async fn flaky_action_recovers_after_failures() {
        let inner = FnAction::new(|_| Ok(Map::new()));
        let flaky = FlakyAction::new(2, ActionFailure::timeout("book", 1.0), inner);

        assert!(flaky.call(Map::new()).await.is_err());
        assert!(flaky.call(Map::new()).await.is_err());
        assert!(flaky.call(Map::new()).await.is_ok());
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn charge_rejects_non_positive_amounts() {
        let registries = Registries::new();
        register_demo_actions(&registries);
        let charge = registries.actions.resolve("charge").expect("registered");

        let mut inputs = Map::new();
        inputs.insert("amount".to_string(), json!(0));
        let err = charge.call(inputs).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PaymentFailed);
    }
}

//! Validadores builtin.
//!
//! Devuelven `Ok(())` o `Err(motivo)`; el motivo se loggea, el usuario ve el
//! `invalid_message` del slot. Son puros y baratos; la infraestructura
//! async existe para validadores externos (servicios), no porque estos la
//! necesiten.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;

use soni_core::registry::SlotContext;
use soni_core::{Registries, SlotValidator};

pub fn register(registries: &Registries) {
    registries.validators.register("non_empty", Arc::new(NonEmpty));
    registries.validators.register("email", Arc::new(Email));
    registries.validators.register("positive_number", Arc::new(PositiveNumber));
    registries.validators.register("future_date", Arc::new(FutureDate));
}

struct NonEmpty;

#[async_trait]
impl SlotValidator for NonEmpty {
    async fn validate(&self, value: &Value, _ctx: &SlotContext) -> Result<(), String> {
        match value {
            Value::String(s) if s.trim().is_empty() => Err("empty string".to_string()),
            Value::Null => Err("null value".to_string()),
            _ => Ok(()),
        }
    }
}

struct Email;

#[async_trait]
impl SlotValidator for Email {
    async fn validate(&self, value: &Value, _ctx: &SlotContext) -> Result<(), String> {
        let text = value.as_str().ok_or("not a string")?;
        let Some((local, domain)) = text.split_once('@') else {
            return Err(format!("'{text}' has no '@'"));
        };
        if local.is_empty() || domain.is_empty() || !domain.contains('.') || text.contains(char::is_whitespace) {
            return Err(format!("'{text}' is not a valid address"));
        }
        Ok(())
    }
}

struct PositiveNumber;

#[async_trait]
impl SlotValidator for PositiveNumber {
    async fn validate(&self, value: &Value, _ctx: &SlotContext) -> Result<(), String> {
        let n = value.as_f64().ok_or("not a number")?;
        if n > 0.0 {
            Ok(())
        } else {
            Err(format!("{n} is not positive"))
        }
    }
}

struct FutureDate;

#[async_trait]
impl SlotValidator for FutureDate {
    async fn validate(&self, value: &Value, _ctx: &SlotContext) -> Result<(), String> {
        let text = value.as_str().ok_or("not a string")?;
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| format!("'{text}': {e}"))?;
        if date >= Utc::now().date_naive() {
            Ok(())
        } else {
            Err(format!("'{text}' is in the past"))
        }
    }
}

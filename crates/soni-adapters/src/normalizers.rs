//! Normalizadores builtin. Su salida canónica es lo que ve la validación y
//! lo que almacena el slot.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;

use soni_core::registry::SlotContext;
use soni_core::{Registries, SlotNormalizer};

pub fn register(registries: &Registries) {
    registries.normalizers.register("trim", Arc::new(Trim));
    registries.normalizers.register("lowercase", Arc::new(Lowercase));
    registries.normalizers.register("digits_only", Arc::new(DigitsOnly));
    registries.normalizers.register("date_iso", Arc::new(DateIso));
}

struct Trim;

#[async_trait]
impl SlotNormalizer for Trim {
    async fn normalize(&self, value: &Value, _ctx: &SlotContext) -> Result<Value, String> {
        match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            other => Ok(other.clone()),
        }
    }
}

struct Lowercase;

#[async_trait]
impl SlotNormalizer for Lowercase {
    async fn normalize(&self, value: &Value, _ctx: &SlotContext) -> Result<Value, String> {
        match value {
            Value::String(s) => Ok(Value::String(s.trim().to_lowercase())),
            other => Ok(other.clone()),
        }
    }
}

struct DigitsOnly;

#[async_trait]
impl SlotNormalizer for DigitsOnly {
    async fn normalize(&self, value: &Value, _ctx: &SlotContext) -> Result<Value, String> {
        match value {
            Value::String(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    Err(format!("'{s}' contains no digits"))
                } else {
                    Ok(Value::String(digits))
                }
            }
            other => Ok(other.clone()),
        }
    }
}

/// Acepta `YYYY-MM-DD`, `DD/MM/YYYY` y `DD-MM-YYYY`; canónico ISO-8601.
struct DateIso;

#[async_trait]
impl SlotNormalizer for DateIso {
    async fn normalize(&self, value: &Value, _ctx: &SlotContext) -> Result<Value, String> {
        let Some(text) = value.as_str() else {
            return Ok(value.clone());
        };
        let text = text.trim();
        for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(text, format) {
                return Ok(Value::String(date.format("%Y-%m-%d").to_string()));
            }
        }
        Err(format!("'{text}' is not a recognized date"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soni_dsl::SlotType;

    fn ctx() -> SlotContext {
        SlotContext { slot: "x".into(),
                      slot_type: SlotType::String,
                      language: None }
    }

    #[tokio::test]
    async fn date_iso_canonicalizes_common_formats() {
        let n = DateIso;
        assert_eq!(n.normalize(&json!("03/11/2026"), &ctx()).await.unwrap(), json!("2026-11-03"));
        assert_eq!(n.normalize(&json!("2026-11-03"), &ctx()).await.unwrap(), json!("2026-11-03"));
        assert!(n.normalize(&json!("tomorrow"), &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn digits_only_strips_noise() {
        let n = DigitsOnly;
        assert_eq!(n.normalize(&json!("+34 600-123-456"), &ctx()).await.unwrap(), json!("34600123456"));
        assert!(n.normalize(&json!("no numbers"), &ctx()).await.is_err());
    }
}

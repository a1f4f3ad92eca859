//! Canonicalización JSON y hash de definiciones.
//!
//! Notas:
//! - Ordena claves de objetos y mantiene el orden de arrays; así dos
//!   compilaciones del mismo documento producen el mismo hash.
//! - No usar NaN/Inf en valores del documento (JSON no los representa).

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Escritura recursiva sobre un buffer único. Las claves de objeto se
/// ordenan con un sort sobre la lista de claves; nada más se reordena.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s).unwrap_or_default()),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

/// Hashea un string y devuelve hex.
pub fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hashea un JSON Value aplicando primero canonicalización.
pub fn hash_value(v: &Value) -> String {
    hash_str(&to_canonical_json(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(to_canonical_json(&a), to_canonical_json(&b));
        assert_eq!(to_canonical_json(&a), r#"{"a":[1,2],"b":1}"#);
    }

    #[test]
    fn hash_is_stable() {
        let v = json!({"x": "y"});
        assert_eq!(hash_value(&v), hash_value(&v));
    }
}

//! Plantillas de texto y valores de `set`.
//!
//! Formas:
//! - `{name}`: interpolación simple de variable (con puntos permitidos, p.ej.
//!   `{session.user}`); indefinido → `""`.
//! - `{{ expr }}`: expresión tipada. Dentro de texto se stringifica; como
//!   valor de `set`, si la plantilla es exactamente una expresión, el valor
//!   conserva su tipo.
//! - Llaves que no abren una forma válida se tratan como texto literal.
//!
//! Las plantillas se parsean en compilación (los errores de sintaxis de
//! expresión son errores de compilación) y se renderizan en runtime con
//! política total (error → `""`).

use serde_json::Value;

use super::eval::{eval, EvalError, VarResolver};
use super::parser::{parse_expression, Expr};

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    /// `{name}` — ruta de variable con puntos opcionales.
    Interp(String),
    /// `{{ expr }}`
    Expr(Expr),
}

/// Plantilla de valor para `set`: o un escalar tal cual, o una expresión
/// única tipada, o una plantilla de string.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTemplate {
    Literal(Value),
    Typed(Expr),
    Text(Vec<Segment>),
}

impl ValueTemplate {
    /// Compila un valor declarado en `set.values`. Strings pasan por el
    /// detector de plantillas; el resto se conserva literal.
    pub fn compile(value: &Value) -> Result<ValueTemplate, EvalError> {
        let text = match value {
            Value::String(s) => s,
            other => return Ok(ValueTemplate::Literal(other.clone())),
        };
        let trimmed = text.trim();
        if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..trimmed.len() - 2].contains("{{") {
            let inner = &trimmed[2..trimmed.len() - 2];
            return Ok(ValueTemplate::Typed(parse_expression(inner)?));
        }
        let segments = parse_template(text)?;
        if segments.iter().all(|s| matches!(s, Segment::Literal(_))) {
            return Ok(ValueTemplate::Literal(Value::String(text.clone())));
        }
        Ok(ValueTemplate::Text(segments))
    }

    /// Evalúa la plantilla. Totalidad: un error en la expresión tipada
    /// produce `null` (el llamador loggea); en texto produce `""` por
    /// segmento.
    pub fn render(&self, vars: &dyn VarResolver) -> Value {
        match self {
            ValueTemplate::Literal(v) => v.clone(),
            ValueTemplate::Typed(expr) => super::eval_or_null(expr, vars),
            ValueTemplate::Text(segments) => Value::String(render_segments(segments, vars)),
        }
    }
}

/// Parsea un texto con `{name}` y `{{ expr }}` a segmentos.
pub fn parse_template(text: &str) -> Result<Vec<Segment>, EvalError> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '{' && chars.get(i + 1) == Some(&'{') {
            // {{ expr }}
            let close = find_close(&chars, i + 2)?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let inner: String = chars[i + 2..close].iter().collect();
            segments.push(Segment::Expr(parse_expression(inner.trim())?));
            i = close + 2;
        } else if chars[i] == '{' {
            // {name} — sólo si el contenido es una ruta simple.
            if let Some(close) = chars[i + 1..].iter().position(|&c| c == '}') {
                let close = i + 1 + close;
                let inner: String = chars[i + 1..close].iter().collect();
                if is_simple_path(&inner) {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Interp(inner));
                    i = close + 1;
                    continue;
                }
            }
            literal.push('{');
            i += 1;
        } else {
            literal.push(chars[i]);
            i += 1;
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn find_close(chars: &[char], from: usize) -> Result<usize, EvalError> {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '}' && chars[i + 1] == '}' {
            return Ok(i);
        }
        i += 1;
    }
    Err(EvalError::Syntax("unterminated '{{' expression".to_string()))
}

fn is_simple_path(text: &str) -> bool {
    !text.is_empty()
    && text.split('.')
           .all(|part| {
               !part.is_empty()
               && part.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
               && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
           })
}

/// Renderiza una plantilla ya parseada. Totalidad: errores e indefinidos
/// resuelven a `""`.
pub fn render_template(text: &str, vars: &dyn VarResolver) -> String {
    match parse_template(text) {
        Ok(segments) => render_segments(&segments, vars),
        Err(e) => {
            log::debug!("template parse failed, rendering raw text: {e}");
            text.to_string()
        }
    }
}

pub fn render_segments(segments: &[Segment], vars: &dyn VarResolver) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Interp(path) => {
                let value = resolve_path(path, vars);
                out.push_str(&stringify(&value));
            }
            Segment::Expr(expr) => match eval(expr, vars) {
                Ok(v) => out.push_str(&stringify(&v)),
                Err(e) => {
                    log::debug!("template expression error, rendering empty: {e}");
                }
            },
        }
    }
    out
}

fn resolve_path(path: &str, vars: &dyn VarResolver) -> Value {
    let mut parts = path.split('.');
    let root = parts.next().unwrap_or_default();
    let mut value = vars.resolve(root).unwrap_or(Value::Null);
    for part in parts {
        value = match value {
            Value::Object(map) => map.get(part).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    value
}

/// Representación de usuario de un valor: `null` → `""`, strings sin
/// comillas, estructuras como JSON compacto.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, Value>);

    impl VarResolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    fn vars(pairs: &[(&str, Value)]) -> MapResolver {
        MapResolver(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn interpolates_simple_names() {
        let r = vars(&[("origin", json!("Madrid"))]);
        assert_eq!(render_template("From {origin} to {destination}", &r), "From Madrid to ");
    }

    #[test]
    fn dotted_interpolation_reaches_session() {
        let r = vars(&[("session", json!({"user": "ana"}))]);
        assert_eq!(render_template("Hi {session.user}", &r), "Hi ana");
    }

    #[test]
    fn typed_expression_inside_text_is_stringified() {
        let r = vars(&[("count", json!(3))]);
        assert_eq!(render_template("total: {{ count * 2 }}", &r), "total: 6");
    }

    #[test]
    fn expression_errors_render_empty() {
        let r = vars(&[]);
        assert_eq!(render_template("x{{ 'a' - 1 }}y", &r), "xy");
    }

    #[test]
    fn unknown_brace_content_is_literal() {
        let r = vars(&[]);
        assert_eq!(render_template("a {not a name} b", &r), "a {not a name} b");
    }

    #[test]
    fn value_template_detects_pure_expression() {
        let t = ValueTemplate::compile(&json!("{{ 2 + 3 }}")).expect("compile");
        let r = vars(&[]);
        assert_eq!(t.render(&r), json!(5));
    }

    #[test]
    fn value_template_keeps_literals() {
        let t = ValueTemplate::compile(&json!(42)).expect("compile");
        let r = vars(&[]);
        assert_eq!(t.render(&r), json!(42));
        let t = ValueTemplate::compile(&json!("plain")).expect("compile");
        assert_eq!(t.render(&r), json!("plain"));
    }

    #[test]
    fn value_template_interpolates_strings() {
        let t = ValueTemplate::compile(&json!("hello {name}")).expect("compile");
        let r = vars(&[("name", json!("bo"))]);
        assert_eq!(t.render(&r), json!("hello bo"));
    }
}

//! Evaluador del AST sobre `serde_json::Value`.
//!
//! Reglas de tipos:
//! - Aritmética: enteros permanecen enteros; cualquier operando flotante
//!   promueve a flotante. `+` sobre dos strings concatena.
//! - Igualdad: coerción numérica (1 == 1.0); el resto compara por Value.
//! - Orden: números entre sí, strings entre sí; mezclar tipos es error (y el
//!   llamador lo degrada según su política de totalidad).
//! - `and`/`or` cortocircuitan y devuelven booleano.
//! - Variable no resuelta → `null` (no es error; el "indefinido" del DSL).

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::parser::{BinOp, Expr, UnaryOp};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// Resolución de variables raíz. Los espacios `flow`/`session` y las
/// variables builtin (`_error`, `_validation_attempts`, …) se entregan como
/// valores; el orden de resolución lo implementa el proveedor.
pub trait VarResolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// Verdad de un valor: `null`, `false`, `0`, `""` y colecciones vacías son
/// falsos.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn eval(expr: &Expr, vars: &dyn VarResolver) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(vars.resolve(name).unwrap_or(Value::Null)),
        Expr::Member(base, name) => {
            let base = eval(base, vars)?;
            match base {
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(EvalError::Type(format!("member access '.{name}' on non-object {other}"))),
            }
        }
        Expr::Index(base, index) => {
            let base = eval(base, vars)?;
            let index = eval(index, vars)?;
            match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n.as_i64().ok_or_else(|| EvalError::Type("non-integer index".to_string()))?;
                    let i = if i < 0 { items.len() as i64 + i } else { i };
                    Ok(items.get(i.max(0) as usize).cloned().unwrap_or(Value::Null))
                }
                (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
                (Value::Null, _) => Ok(Value::Null),
                _ => Err(EvalError::Type(format!("cannot index {base} with {index}"))),
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, vars)?);
            }
            call_builtin(name, &values)
        }
        Expr::Filter { expr, name } => {
            let value = eval(expr, vars)?;
            apply_filter(name, &value)
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, vars)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match value {
                    Value::Number(n) if n.is_i64() => Ok(Value::from(-n.as_i64().unwrap_or(0))),
                    Value::Number(n) => Ok(Value::from(-n.as_f64().unwrap_or(0.0))),
                    other => Err(EvalError::Type(format!("cannot negate {other}"))),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, vars),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, vars: &dyn VarResolver) -> Result<Value, EvalError> {
    // Cortocircuito lógico antes de evaluar el lado derecho.
    if op == BinOp::And {
        let l = eval(lhs, vars)?;
        if !truthy(&l) {
            return Ok(Value::Bool(false));
        }
        let r = eval(rhs, vars)?;
        return Ok(Value::Bool(truthy(&r)));
    }
    if op == BinOp::Or {
        let l = eval(lhs, vars)?;
        if truthy(&l) {
            return Ok(Value::Bool(true));
        }
        let r = eval(rhs, vars)?;
        return Ok(Value::Bool(truthy(&r)));
    }

    let l = eval(lhs, vars)?;
    let r = eval(rhs, vars)?;
    match op {
        BinOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => numeric_op(&l, &r, i64::checked_add, |a, b| a + b),
        },
        BinOp::Sub => numeric_op(&l, &r, i64::checked_sub, |a, b| a - b),
        BinOp::Mul => numeric_op(&l, &r, i64::checked_mul, |a, b| a * b),
        BinOp::Div => {
            let (a, b) = as_floats(&l, &r)?;
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::from(a / b))
        }
        BinOp::Mod => match (l.as_i64(), r.as_i64()) {
            (Some(_), Some(0)) => Err(EvalError::DivisionByZero),
            (Some(a), Some(b)) => Ok(Value::from(a % b)),
            _ => {
                let (a, b) = as_floats(&l, &r)?;
                if b == 0.0 {
                    return Err(EvalError::DivisionByZero);
                }
                Ok(Value::from(a % b))
            }
        },
        BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&l, &r)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn numeric_op(l: &Value,
              r: &Value,
              int_op: fn(i64, i64) -> Option<i64>,
              float_op: fn(f64, f64) -> f64)
              -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        return int_op(a, b).map(Value::from)
                           .ok_or_else(|| EvalError::Type("integer overflow".to_string()));
    }
    let (a, b) = as_floats(l, r)?;
    Ok(Value::from(float_op(a, b)))
}

fn as_floats(l: &Value, r: &Value) -> Result<(f64, f64), EvalError> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EvalError::Type(format!("expected numbers, got {l} and {r}"))),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a == b;
    }
    l == r
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a.partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("incomparable numbers".to_string()));
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::Type(format!("cannot order {l} and {r}")))
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match (name, args.len()) {
        ("today", 0) => Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string())),
        ("now", 0) => Ok(Value::String(Utc::now().to_rfc3339())),
        ("uuid", 0) => Ok(Value::String(Uuid::new_v4().to_string())),
        ("today" | "now" | "uuid", n) => Err(EvalError::Type(format!("{name}() takes no arguments, got {n}"))),
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

fn apply_filter(name: &str, value: &Value) -> Result<Value, EvalError> {
    match name {
        "upper" => match value {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(EvalError::Type(format!("upper expects a string, got {other}"))),
        },
        "lower" => match value {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(EvalError::Type(format!("lower expects a string, got {other}"))),
        },
        "trim" => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            other => Err(EvalError::Type(format!("trim expects a string, got {other}"))),
        },
        "length" => match value {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(a) => Ok(Value::from(a.len() as i64)),
            Value::Object(o) => Ok(Value::from(o.len() as i64)),
            other => Err(EvalError::Type(format!("length expects string/array/object, got {other}"))),
        },
        _ => Err(EvalError::UnknownFilter(name.to_string())),
    }
}

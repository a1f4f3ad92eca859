//! Motor de expresiones del DSL.
//!
//! Dos formas sintácticas en plantillas, más las condiciones crudas:
//! - `{name}`: interpolación de string; indefinido → `""`.
//! - `{{ expr }}`: evaluación tipada (el valor conserva su tipo JSON).
//! - `when`/`condition`: expresión cruda sin llaves, evaluada a verdad.
//!
//! El motor es total hacia afuera: un error de evaluación en una condición
//! vale `false`, en un `set` produce `null` (y se loggea), en interpolación
//! produce `""`. Internamente `eval` sí devuelve `Result` para que cada
//! llamador aplique su política.
//!
//! Precedencia (de mayor a menor): postfijos (miembro, índice, llamada,
//! filtro) > `not`/`-` unario > `*` `/` `%` > `+` `-` > comparaciones >
//! `and` > `or`. Paréntesis anulan.

mod eval;
mod lexer;
mod parser;
mod template;

pub use eval::{eval, truthy, EvalError, VarResolver};
pub use parser::{parse_expression, BinOp, Expr, UnaryOp};
pub use template::{parse_template, render_template, stringify, Segment, ValueTemplate};

use serde_json::Value;

/// Evalúa una condición cruda con política total: cualquier error → `false`.
pub fn eval_condition(expr: &Expr, vars: &dyn VarResolver) -> bool {
    match eval(expr, vars) {
        Ok(v) => truthy(&v),
        Err(e) => {
            log::debug!("condition evaluated to false due to error: {e}");
            false
        }
    }
}

/// Evalúa una expresión de `set` con política total: error → `null` + log.
pub fn eval_or_null(expr: &Expr, vars: &dyn VarResolver) -> Value {
    match eval(expr, vars) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("set expression failed, storing null: {e}");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
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

    fn eval_str(text: &str, resolver: &dyn VarResolver) -> Value {
        let expr = parse_expression(text).expect("parse");
        eval(&expr, resolver).expect("eval")
    }

    #[test]
    fn arithmetic_precedence() {
        let r = vars(&[]);
        assert_eq!(eval_str("1 + 2 * 3", &r), json!(7));
        assert_eq!(eval_str("(1 + 2) * 3", &r), json!(9));
        assert_eq!(eval_str("10 % 3", &r), json!(1));
        assert_eq!(eval_str("7 / 2", &r), json!(3.5));
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let r = vars(&[]);
        assert_eq!(eval_str("2 + 3", &r), json!(5));
        assert!(eval_str("2 + 3", &r).is_i64());
        assert!(eval_str("2.0 + 3", &r).is_f64());
    }

    #[test]
    fn comparison_and_logic() {
        let r = vars(&[("total", json!(150))]);
        assert_eq!(eval_str("total > 100", &r), json!(true));
        assert_eq!(eval_str("total > 100 and total < 200", &r), json!(true));
        assert_eq!(eval_str("total < 100 or total == 150", &r), json!(true));
        assert_eq!(eval_str("not total < 100", &r), json!(true));
    }

    #[test]
    fn numeric_equality_coerces() {
        let r = vars(&[]);
        assert_eq!(eval_str("1 == 1.0", &r), json!(true));
        assert_eq!(eval_str("1 != 2", &r), json!(true));
    }

    #[test]
    fn member_and_index_access() {
        let r = vars(&[("order", json!({"items": ["a", "b"], "total": 9}))]);
        assert_eq!(eval_str("order.total", &r), json!(9));
        assert_eq!(eval_str("order.items[1]", &r), json!("b"));
        assert_eq!(eval_str("order.items[0] == 'a'", &r), json!(true));
    }

    #[test]
    fn filters() {
        let r = vars(&[("name", json!("madrid")), ("items", json!([1, 2, 3]))]);
        assert_eq!(eval_str("name | upper", &r), json!("MADRID"));
        assert_eq!(eval_str("items | length", &r), json!(3));
        assert_eq!(eval_str("'  x ' | trim", &r), json!("x"));
        assert_eq!(eval_str("name | length > 2", &r), json!(2 < 6));
    }

    #[test]
    fn builtins_have_expected_shape() {
        let r = vars(&[]);
        let today = eval_str("today()", &r);
        let today = today.as_str().expect("string");
        assert_eq!(today.len(), 10, "YYYY-MM-DD");
        let id = eval_str("uuid()", &r);
        assert_eq!(id.as_str().expect("string").len(), 36);
    }

    #[test]
    fn condition_errors_are_false() {
        let r = vars(&[]);
        let expr = parse_expression("missing_var - 3 > 0").expect("parse");
        assert!(!eval_condition(&expr, &r));
    }

    #[test]
    fn undefined_var_is_null() {
        let r = vars(&[]);
        assert_eq!(eval_str("ghost", &r), Value::Null);
    }

    #[test]
    fn string_concat_with_plus() {
        let r = vars(&[("a", json!("fo"))]);
        assert_eq!(eval_str("a + 'o'", &r), json!("foo"));
    }

    #[test]
    fn not_binds_tighter_than_comparison() {
        // `not x == y` es `(not x) == y` según la precedencia declarada.
        let r = vars(&[("x", json!(false))]);
        assert_eq!(eval_str("not x == true", &r), json!(true));
    }
}

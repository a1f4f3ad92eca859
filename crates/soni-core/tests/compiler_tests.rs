use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use soni_core::{compile, ActionFailure, ActionHandler, CompileError, Registries};

struct Noop;

#[async_trait]
impl ActionHandler for Noop {
    async fn call(&self, _inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        Ok(Map::new())
    }
}

fn registries_with(actions: &[&str]) -> Registries {
    let registries = Registries::new();
    for name in actions {
        registries.actions.register(*name, Arc::new(Noop));
    }
    registries
}

fn parse(text: &str) -> soni_dsl::FlowDocument {
    soni_dsl::parse_document(text).expect("document parses")
}

#[test]
fn compiles_linear_flow_with_synthetic_nodes() {
    let doc = parse(r#"
version: "1"
slots:
  name:
    type: string
    prompt: "name?"
flows:
  greet:
    process:
      - step: ask
        type: collect
        slot: name
      - step: hello
        type: say
        message: "hi {name}"
"#);
    let compiled = compile(&doc, &registries_with(&[])).expect("compiles");
    let graph = compiled.graph("greet").expect("graph");
    // ENTRY + 2 steps + END + ERROR
    assert_eq!(graph.nodes.len(), 5);
    assert_eq!(graph.entry_step(), Some("ask"));
    assert!(graph.warnings.is_empty());
}

#[test]
fn recompilation_is_structurally_equal() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
      - step: b
        type: say
        message: "b"
"#);
    let registries = registries_with(&[]);
    let first = compile(&doc, &registries).expect("first");
    let second = compile(&doc, &registries).expect("second");
    assert_eq!(first, second);
    assert_eq!(first.graph("f").map(|g| &g.definition_hash),
               second.graph("f").map(|g| &g.definition_hash));
}

#[test]
fn unknown_jump_target_fails() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
        jump_to: ghost
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnknownStepTarget { ref target, .. } if target == "ghost"),
            "got {err:?}");
}

#[test]
fn reserved_targets_resolve() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
        jump_to: end
      - step: b
        type: say
        message: "b"
        jump_to: error
"#);
    // `b` es inalcanzable (a salta a end) — debe fallar por eso.
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnreachableNode { ref step, .. } if step == "b"),
            "got {err:?}");
}

#[test]
fn unreachable_node_fails() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
        jump_to: c
      - step: b
        type: say
        message: "never"
      - step: c
        type: say
        message: "c"
"#);
    // `b` queda fuera: a → c → b… no, c cae secuencialmente a b. Alcanzable.
    compile(&doc, &registries_with(&[])).expect("b is reachable through c");

    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
        jump_to: end
      - step: orphan
        type: say
        message: "orphan"
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnreachableNode { ref step, .. } if step == "orphan"));
}

#[test]
fn cycle_without_blocking_step_is_unsafe() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: a
        type: say
        message: "a"
      - step: b
        type: say
        message: "b"
        jump_to: a
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnsafeCycle { .. }), "got {err:?}");
}

#[test]
fn cycle_through_collect_is_allowed() {
    let doc = parse(r#"
version: "1"
slots:
  item:
    type: string
    prompt: "item?"
flows:
  f:
    process:
      - step: ask
        type: collect
        slot: item
      - step: more
        type: branch
        when:
          - condition: "item == 'more'"
            then: ask
        else: done
      - step: done
        type: say
        message: "ok"
"#);
    compile(&doc, &registries_with(&[])).expect("blocking cycle is safe");
}

#[test]
fn action_must_be_registered() {
    let doc = parse(r#"
version: "1"
actions:
  search:
    description: "search"
    inputs: []
    outputs: []
flows:
  f:
    process:
      - step: s
        type: action
        call: search
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnknownAction { ref action, .. } if action == "search"));

    compile(&doc, &registries_with(&["search"])).expect("registered action compiles");
}

#[test]
fn validator_and_normalizer_must_be_registered() {
    let doc = parse(r#"
version: "1"
slots:
  email:
    type: string
    prompt: "email?"
    validator: email
flows:
  f:
    process:
      - step: ask
        type: collect
        slot: email
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::UnknownValidator { ref validator, .. } if validator == "email"));
}

#[test]
fn branch_without_else_warns_but_compiles() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: decide
        type: branch
        when:
          - condition: "1 == 2"
            then: special
      - step: fallthrough
        type: say
        message: "default"
        jump_to: end
      - step: special
        type: say
        message: "special"
"#);
    let compiled = compile(&doc, &registries_with(&[])).expect("compiles with warning");
    let graph = compiled.graph("f").expect("graph");
    assert_eq!(graph.warnings.len(), 1);
    assert!(graph.warnings[0].contains("branch without else"));
}

#[test]
fn bad_expression_fails_compilation() {
    let doc = parse(r#"
version: "1"
flows:
  f:
    process:
      - step: decide
        type: branch
        when:
          - condition: "total >"
            then: t
      - step: t
        type: say
        message: "t"
"#);
    let err = compile(&doc, &registries_with(&[])).unwrap_err();
    assert!(matches!(err, CompileError::InvalidExpression { .. }), "got {err:?}");
}

#[test]
fn call_flow_target_must_exist_in_document() {
    // La referencia a un flujo inexistente se rechaza ya en el DSL.
    let err = soni_dsl::parse_document(r#"
version: "1"
flows:
  f:
    process:
      - step: go
        type: call_flow
        flow: missing
"#).unwrap_err();
    assert!(matches!(err, soni_dsl::DslError::UndeclaredFlow { .. }));
}

#[test]
fn on_timeout_targets_count_for_reachability() {
    let doc = parse(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "from?"
actions:
  noop:
    description: "noop"
    inputs: []
    outputs: []
flows:
  f:
    process:
      - step: ask
        type: collect
        slot: origin
        timeout: 30.0
        on_timeout: nag
      - step: act
        type: action
        call: noop
        timeout: 1.0
        on_timeout: cleanup
        jump_to: end
      - step: nag
        type: say
        message: "still there?"
        jump_to: end
      - step: cleanup
        type: say
        message: "cleaning up"
"#);
    // `nag` y `cleanup` sólo se alcanzan vía on_timeout; deben contar como
    // alcanzables y el lowering debe conservar plazo y target.
    let compiled = compile(&doc, &registries_with(&["noop"])).expect("on_timeout edges are reachable");
    let graph = compiled.graph("f").expect("graph");

    let ask = graph.node(graph.resolve_step("ask").expect("ask"));
    match &ask.kind {
        soni_core::NodeKind::Collect(collect) => {
            assert_eq!(collect.timeout, Some(30.0));
            assert!(collect.on_timeout.is_some());
        }
        other => panic!("expected collect, got {other:?}"),
    }

    let act = graph.node(graph.resolve_step("act").expect("act"));
    match &act.kind {
        soni_core::NodeKind::Action(action) => {
            assert!(action.on_timeout.is_some());
        }
        other => panic!("expected action, got {other:?}"),
    }
}

//! Escenarios end-to-end del runtime con un NLU guionizado.
//!
//! El guion entrega entendimientos predefinidos en orden, lo que hace cada
//! turno completamente determinista y permite afirmar sobre estados,
//! respuestas y señales exactas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use soni_core::nlu::{FullUnderstanding, MessageType, NluContext, NluEngine, NluError, SlotAnswerKind,
                     SlotUnderstanding};
use soni_core::{compile, ActionFailure, ActionHandler, Checkpointer, ConversationState, ErrorKind,
                InMemoryCheckpointer, Message, Registries, Runtime};

// ---------- NLU guionizado ----------

#[derive(Default)]
struct ScriptedNlu {
    full: Mutex<Vec<FullUnderstanding>>,
    slot: Mutex<Vec<SlotUnderstanding>>,
}

impl ScriptedNlu {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_full(&self, command: Option<&str>, slots: &[(&str, Value)]) {
        self.full
            .lock()
            .unwrap()
            .push(FullUnderstanding { message_type: MessageType::Command,
                                      command: command.map(|c| c.to_string()),
                                      slots: slots.iter()
                                                  .map(|(k, v)| (k.to_string(), v.clone()))
                                                  .collect::<HashMap<_, _>>(),
                                      confidence: 0.95,
                                      reasoning: None });
    }

    fn push_slot(&self, kind: SlotAnswerKind, value: Option<Value>, target: Option<&str>) {
        self.slot
            .lock()
            .unwrap()
            .push(SlotUnderstanding { kind,
                                      value,
                                      target_slot: target.map(|t| t.to_string()),
                                      confidence: 0.9 });
    }
}

#[async_trait]
impl NluEngine for ScriptedNlu {
    async fn understand_full(&self,
                             _message: &str,
                             _history: &[Message],
                             _ctx: &NluContext)
                             -> Result<FullUnderstanding, NluError> {
        let mut queue = self.full.lock().unwrap();
        if queue.is_empty() {
            return Err(NluError("full script exhausted".to_string()));
        }
        Ok(queue.remove(0))
    }

    async fn understand_slot(&self,
                             _message: &str,
                             _waiting_slot: &str,
                             _ctx: &NluContext)
                             -> Result<SlotUnderstanding, NluError> {
        let mut queue = self.slot.lock().unwrap();
        if queue.is_empty() {
            return Err(NluError("slot script exhausted".to_string()));
        }
        Ok(queue.remove(0))
    }

    async fn generate(&self, instruction: &str, _context: &Map<String, Value>) -> Result<String, NluError> {
        Ok(format!("gen:{instruction}"))
    }
}

// ---------- Acciones de test ----------

struct RecordedAction {
    calls: Arc<AtomicU32>,
    outputs: Map<String, Value>,
}

#[async_trait]
impl ActionHandler for RecordedAction {
    async fn call(&self, _inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outputs.clone())
    }
}

struct TimesOutThenOk {
    calls: Arc<AtomicU32>,
    failures: u32,
    outputs: Map<String, Value>,
}

#[async_trait]
impl ActionHandler for TimesOutThenOk {
    async fn call(&self, _inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ActionFailure::timeout("book", 1.0));
        }
        Ok(self.outputs.clone())
    }
}

struct AlwaysFails {
    failure: ActionFailure,
}

#[async_trait]
impl ActionHandler for AlwaysFails {
    async fn call(&self, _inputs: Map<String, Value>) -> Result<Map<String, Value>, ActionFailure> {
        Err(self.failure.clone())
    }
}

// ---------- Infraestructura común ----------

struct Harness {
    runtime: Runtime<Arc<InMemoryCheckpointer>>,
    checkpointer: Arc<InMemoryCheckpointer>,
    nlu: Arc<ScriptedNlu>,
}

fn harness(doc_text: &str, registries: Registries) -> Harness {
    let document = soni_dsl::parse_document(doc_text).expect("document parses");
    let compiled = compile(&document, &registries).expect("document compiles");
    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let nlu = ScriptedNlu::new();
    let runtime = Runtime::new(compiled, Arc::clone(&checkpointer), Arc::new(registries),
                               nlu.clone() as Arc<dyn NluEngine>);
    Harness { runtime,
              checkpointer,
              nlu }
}

async fn assert_invariants(h: &Harness, user: &str) {
    let state = h.checkpointer.load(user).await.expect("load").expect("state");
    state.check_invariants().expect("universal invariants");
}

// ---------- Escenario 1: collect feliz ----------

#[tokio::test]
async fn happy_path_collect_runs_action_and_responds() {
    let registries = Registries::new();
    let search_calls = Arc::new(AtomicU32::new(0));
    let mut outputs = Map::new();
    outputs.insert("results".to_string(), json!([{"flight": "X1"}]));
    registries.actions.register("search",
                                Arc::new(RecordedAction { calls: Arc::clone(&search_calls),
                                                          outputs }));

    let h = harness(r#"
version: "1"
responses:
  success: "Here is what I found."
slots:
  origin:
    type: string
    prompt: "From where?"
  destination:
    type: string
    prompt: "To where?"
actions:
  search:
    description: "search"
    inputs: [origin, destination]
    outputs: [results]
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
      - step: ask_destination
        type: collect
        slot: destination
      - step: run_search
        type: action
        call: search
      - step: done
        type: say
        response: success
"#, registries);

    h.nlu.push_full(Some("book"), &[("origin", json!("Madrid")), ("destination", json!("Paris"))]);

    let outcome = h.runtime.process_turn("u1", "from Madrid to Paris").await.expect("turn");
    assert_eq!(search_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.responses, vec!["Here is what I found.".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.conversation_state, ConversationState::Idle);
    assert!(state.flow_stack.is_empty());
    assert_eq!(state.turn_count, 1);
    assert_invariants(&h, "u1").await;
}

// ---------- Escenario 2: corrección durante confirm ----------

#[tokio::test]
async fn correction_during_confirm_redisplays_with_new_value() {
    let h = harness(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "From where?"
  destination:
    type: string
    prompt: "To where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
      - step: ask_destination
        type: collect
        slot: destination
      - step: confirm_it
        type: confirm
        message: "Fly to {destination}?"
      - step: done
        type: say
        message: "booked"
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[("origin", json!("NYC")), ("destination", json!("SFO"))]);
    let first = h.runtime.process_turn("u1", "to SFO from NYC").await.expect("turn 1");
    assert_eq!(first.responses, vec!["Fly to SFO?".to_string()]);

    h.nlu.push_slot(SlotAnswerKind::Correction, Some(json!("San Diego")), Some("destination"));
    let second = h.runtime.process_turn("u1", "actually I meant San Diego").await.expect("turn 2");
    assert_eq!(second.responses, vec!["Fly to San Diego?".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.turn_count, 2);
    assert_eq!(state.get_slot("destination"), Some(&json!("San Diego")));
    assert_eq!(state.conversation_state, ConversationState::Confirming);
    assert_invariants(&h, "u1").await;
}

// ---------- Escenario 3: reintentos de validación hasta handoff ----------

struct RejectAll;

#[async_trait]
impl soni_core::SlotValidator for RejectAll {
    async fn validate(&self, _value: &Value, _ctx: &soni_core::registry::SlotContext) -> Result<(), String> {
        Err("never valid".to_string())
    }
}

#[tokio::test]
async fn validation_retries_escalate_to_handoff() {
    let registries = Registries::new();
    registries.validators.register("strict_email", Arc::new(RejectAll));

    let h = harness(r#"
version: "1"
settings:
  handoff:
    default_queue: human_support
responses:
  slot_invalid: "That is not a valid email."
slots:
  email:
    type: string
    prompt: "Your email?"
    validator: strict_email
flows:
  signup:
    trigger:
      intents: ["sign me up"]
    process:
      - step: ask_email
        type: collect
        slot: email
        max_attempts: 2
      - step: done
        type: say
        message: "registered"
"#, registries);

    h.nlu.push_full(Some("signup"), &[]);
    let first = h.runtime.process_turn("u1", "sign me up").await.expect("turn 1");
    assert_eq!(first.responses, vec!["Your email?".to_string()]);

    h.nlu.push_slot(SlotAnswerKind::SlotValue, Some(json!("nope")), Some("email"));
    let second = h.runtime.process_turn("u1", "nope").await.expect("turn 2");
    assert_eq!(second.responses, vec!["That is not a valid email.".to_string()]);
    assert!(second.handoff.is_none());

    h.nlu.push_slot(SlotAnswerKind::SlotValue, Some(json!("also nope")), Some("email"));
    let third = h.runtime.process_turn("u1", "also nope").await.expect("turn 3");
    assert_eq!(third.responses, vec!["That is not a valid email.".to_string()]);
    let handoff = third.handoff.expect("handoff signal");
    assert_eq!(handoff.queue, "human_support");

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.conversation_state, ConversationState::Completed);
    assert_invariants(&h, "u1").await;
}

// ---------- Escenario 4: reintentos de acción con backoff exponencial ----------

#[tokio::test(start_paused = true)]
async fn action_retry_with_exponential_backoff() {
    let registries = Registries::new();
    let calls = Arc::new(AtomicU32::new(0));
    let mut outputs = Map::new();
    outputs.insert("receipt".to_string(), json!("R-1"));
    registries.actions.register("book",
                                Arc::new(TimesOutThenOk { calls: Arc::clone(&calls),
                                                          failures: 2,
                                                          outputs }));

    let h = harness(r#"
version: "1"
actions:
  book:
    description: "book"
    inputs: []
    outputs: [receipt]
flows:
  run:
    trigger:
      intents: ["run it"]
    process:
      - step: do_book
        type: action
        call: book
        retry:
          max_attempts: 3
          delay: 1.0
          backoff: exponential
          retry_on: [timeout]
      - step: done
        type: say
        message: "got {receipt}"
"#, registries);

    h.nlu.push_full(Some("run"), &[]);
    let started = tokio::time::Instant::now();
    let outcome = h.runtime.process_turn("u1", "run it").await.expect("turn");
    let elapsed = started.elapsed();

    // Esperas de 1 s y 2 s entre los tres intentos.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(elapsed >= std::time::Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < std::time::Duration::from_secs(4), "elapsed {elapsed:?}");
    assert_eq!(outcome.responses, vec!["got R-1".to_string()]);
    assert_invariants(&h, "u1").await;
}

// ---------- Escenario 5: cancelación durante collect ----------

#[tokio::test]
async fn cancellation_during_collect_pops_and_idles() {
    let h = harness(r#"
version: "1"
responses:
  cancellation_acknowledged: "Okay, cancelled."
slots:
  origin:
    type: string
    prompt: "From where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
      - step: done
        type: say
        message: "done"
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[]);
    let first = h.runtime.process_turn("u1", "book a flight").await.expect("turn 1");
    assert_eq!(first.responses, vec!["From where?".to_string()]);

    h.nlu.push_slot(SlotAnswerKind::Cancellation, None, None);
    let second = h.runtime.process_turn("u1", "forget it").await.expect("turn 2");
    assert_eq!(second.responses, vec!["Okay, cancelled.".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert!(state.flow_stack.is_empty());
    assert_eq!(state.conversation_state, ConversationState::Idle);
    assert_invariants(&h, "u1").await;
}

// ---------- Escenario 6: propagación de error desde un sub-flujo ----------

#[tokio::test]
async fn subflow_error_propagates_to_parent_on_error() {
    let registries = Registries::new();
    registries.actions
              .register("charge",
                        Arc::new(AlwaysFails { failure: ActionFailure::new(ErrorKind::PaymentFailed,
                                                                           "card declined") }));

    let h = harness(r#"
version: "1"
actions:
  charge:
    description: "charge the card"
    inputs: []
    outputs: [receipt]
flows:
  book:
    trigger:
      intents: ["book a flight"]
    on_error: apologize
    process:
      - step: pay
        type: call_flow
        flow: collect_payment
      - step: ok
        type: say
        message: "paid"
        jump_to: end
      - step: apologize
        type: say
        message: "problem: {_error_type}"
        jump_to: end
  collect_payment:
    process:
      - step: charge_it
        type: action
        call: charge
"#, registries);

    h.nlu.push_full(Some("book"), &[]);
    let outcome = h.runtime.process_turn("u1", "book a flight").await.expect("turn");
    assert_eq!(outcome.responses, vec!["problem: payment_failed".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert!(state.flow_stack.is_empty());
    assert_eq!(state.conversation_state, ConversationState::Idle);
    assert_invariants(&h, "u1").await;
}

// ---------- Propiedades transversales ----------

#[tokio::test]
async fn checkpoint_roundtrip_preserves_blocked_state() {
    let h = harness(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "From where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
      - step: done
        type: say
        message: "done"
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[]);
    h.runtime.process_turn("u1", "book a flight").await.expect("turn");

    let saved = h.checkpointer.load("u1").await.expect("load").expect("state");
    let text = serde_json::to_string(&saved).expect("serialize");
    let restored: soni_core::DialogueState = serde_json::from_str(&text).expect("deserialize");
    assert_eq!(saved, restored);
    assert_eq!(restored.conversation_state, ConversationState::WaitingForSlot);
    assert_eq!(restored.current_step.as_deref(), Some("ask_origin"));
}

#[tokio::test]
async fn filled_slot_skips_collect_prompt() {
    let h = harness(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "From where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
      - step: done
        type: say
        message: "origin is {origin}"
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[("origin", json!("Madrid"))]);
    let outcome = h.runtime.process_turn("u1", "from Madrid").await.expect("turn");
    assert_eq!(outcome.responses, vec!["origin is Madrid".to_string()]);
}

#[tokio::test]
async fn session_sweep_removes_expired_sessions() {
    let h = harness(r#"
version: "1"
settings:
  conversation:
    session_timeout: 60
flows:
  book:
    trigger:
      intents: ["book"]
    process:
      - step: done
        type: say
        message: "hi"
"#, Registries::new());

    h.nlu.push_full(None, &[]);
    h.runtime.process_turn("u1", "hello").await.expect("turn");
    assert_eq!(h.checkpointer.sessions().await.expect("sessions").len(), 1);

    let removed = h.runtime
                   .sweep_expired(chrono::Utc::now() + chrono::Duration::seconds(120))
                   .await
                   .expect("sweep");
    assert_eq!(removed, 1);
    assert!(h.checkpointer.sessions().await.expect("sessions").is_empty());
}

#[tokio::test]
async fn busy_policy_reject_refuses_second_turn() {
    use soni_dsl::BusyPolicy;

    let registries = Registries::new();
    let document = soni_dsl::parse_document(r#"
version: "1"
flows:
  f:
    process:
      - step: s
        type: say
        message: "hi"
"#).expect("parse");
    let compiled = compile(&document, &registries).expect("compile");
    let nlu = ScriptedNlu::new();
    let runtime = Runtime::new(compiled, InMemoryCheckpointer::new(), Arc::new(registries),
                               nlu.clone() as Arc<dyn NluEngine>).with_busy_policy(BusyPolicy::Reject);

    // Sin guion: el primer turno falla en NLU pero igualmente adquiere y
    // suelta el mutex; lo que se comprueba es que dos turnos secuenciales
    // no chocan y que el mutex queda libre.
    nlu.push_full(None, &[]);
    runtime.process_turn("u1", "a").await.expect("first turn");
    nlu.push_full(None, &[]);
    runtime.process_turn("u1", "b").await.expect("second turn");
}

// ---------- Comportamiento de borde: jump_to error y bucles ----------

#[tokio::test]
async fn jump_to_error_skips_own_on_error() {
    let h = harness(r#"
version: "1"
flows:
  f:
    trigger:
      intents: ["go"]
    on_error: apologize
    process:
      - step: bail
        type: say
        message: "bailing"
        jump_to: error
      - step: apologize
        type: say
        message: "apologized"
        jump_to: end
"#, Registries::new());

    h.nlu.push_full(Some("f"), &[]);
    let outcome = h.runtime.process_turn("u1", "go").await.expect("turn");

    // La salida intencional nunca pasa por el on_error del propio flujo.
    assert_eq!(outcome.responses,
               vec!["bailing".to_string(), "Something went wrong. Please try again.".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.conversation_state, ConversationState::Error);
    assert!(state.flow_stack.is_empty());
    assert_invariants(&h, "u1").await;
}

#[tokio::test]
async fn runtime_loop_hits_loop_detected() {
    let h = harness(r#"
version: "1"
settings:
  runtime:
    max_step_executions: 5
slots:
  item:
    type: string
    prompt: "item?"
flows:
  spin:
    trigger:
      intents: ["spin"]
    process:
      - step: ask
        type: collect
        slot: item
      - step: back
        type: branch
        when:
          - condition: "true"
            then: ask
"#, Registries::new());

    // El slot llega lleno, así que el collect nunca bloquea y el ciclo
    // collect→branch gira hasta el tope.
    h.nlu.push_full(Some("spin"), &[("item", json!("x"))]);
    let outcome = h.runtime.process_turn("u1", "spin").await.expect("turn");
    assert_eq!(outcome.responses, vec!["Something went wrong. Please try again.".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.conversation_state, ConversationState::Error);
    assert_eq!(state.metadata.get("_error_type"), Some(&json!("loop_detected")));
    assert_invariants(&h, "u1").await;
}

#[tokio::test]
async fn branch_falls_through_without_else() {
    let h = harness(r#"
version: "1"
flows:
  f:
    trigger:
      intents: ["go"]
    process:
      - step: decide
        type: branch
        when:
          - condition: "1 == 2"
            then: special
      - step: fallthrough
        type: say
        message: "default path"
        jump_to: end
      - step: special
        type: say
        message: "special path"
"#, Registries::new());

    h.nlu.push_full(Some("f"), &[]);
    let outcome = h.runtime.process_turn("u1", "go").await.expect("turn");
    assert_eq!(outcome.responses, vec!["default path".to_string()]);
}

// ---------- Plazo de respuesta del collect ----------

#[tokio::test]
async fn collect_timeout_defaults_to_single_reprompt() {
    let h = harness(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "From where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
        timeout: 60.0
      - step: done
        type: say
        message: "origin is {origin}"
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[]);
    let first = h.runtime.process_turn("u1", "book a flight").await.expect("turn 1");
    assert_eq!(first.responses, vec!["From where?".to_string()]);

    // Se simula la inactividad retrasando la última actividad persistida.
    let mut state = h.checkpointer.load("u1").await.expect("load").expect("state");
    state.last_activity = state.last_activity - chrono::Duration::seconds(120);
    h.checkpointer.save("u1", &state).await.expect("save");

    // Respuesta tardía: re-prompt default sin consultar al NLU (el guion de
    // slot está vacío; si se consultara, el turno emitiría el error genérico).
    let second = h.runtime.process_turn("u1", "hello?").await.expect("turn 2");
    assert_eq!(second.responses, vec!["From where?".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert_eq!(state.conversation_state, ConversationState::WaitingForSlot);
    assert!(matches!(state.pending_task,
                     Some(soni_core::PendingTask::Collect { reprompts: 1, .. })));
    assert_invariants(&h, "u1").await;

    // El re-prompt default es único: un segundo vencimiento procesa la
    // respuesta con normalidad.
    let mut state = h.checkpointer.load("u1").await.expect("load").expect("state");
    state.last_activity = state.last_activity - chrono::Duration::seconds(120);
    h.checkpointer.save("u1", &state).await.expect("save");

    h.nlu.push_slot(SlotAnswerKind::SlotValue, Some(json!("Madrid")), Some("origin"));
    let third = h.runtime.process_turn("u1", "Madrid").await.expect("turn 3");
    assert_eq!(third.responses, vec!["origin is Madrid".to_string()]);
    assert_invariants(&h, "u1").await;
}

#[tokio::test]
async fn collect_timeout_routes_to_on_timeout() {
    let h = harness(r#"
version: "1"
slots:
  origin:
    type: string
    prompt: "From where?"
flows:
  book:
    trigger:
      intents: ["book a flight"]
    process:
      - step: ask_origin
        type: collect
        slot: origin
        timeout: 60.0
        on_timeout: give_up
      - step: done
        type: say
        message: "got it"
        jump_to: end
      - step: give_up
        type: say
        message: "timed out, try again later"
        jump_to: end
"#, Registries::new());

    h.nlu.push_full(Some("book"), &[]);
    h.runtime.process_turn("u1", "book a flight").await.expect("turn 1");

    let mut state = h.checkpointer.load("u1").await.expect("load").expect("state");
    state.last_activity = state.last_activity - chrono::Duration::seconds(120);
    h.checkpointer.save("u1", &state).await.expect("save");

    let second = h.runtime.process_turn("u1", "sorry, got distracted").await.expect("turn 2");
    assert_eq!(second.responses, vec!["timed out, try again later".to_string()]);

    let state = h.checkpointer.load("u1").await.expect("load").expect("state");
    assert!(state.flow_stack.is_empty());
    assert_eq!(state.conversation_state, ConversationState::Idle);
    assert_invariants(&h, "u1").await;
}

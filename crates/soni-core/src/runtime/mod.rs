//! Bucle de turnos.
//!
//! Un turno:
//! 1. Adquisición de sesión: carga del checkpoint + mutex por usuario (como
//!    mucho un turno en vuelo por `user_id`; el segundo espera o se rechaza
//!    según `BusyPolicy`).
//! 2. Router por `conversation_state`: bloqueado en slot/confirmación → NLU
//!    ligero (con fallback al completo si la confianza no alcanza); libre →
//!    NLU completo.
//! 3. Aplicación determinista de comandos (prioridad fija) y ejecución del
//!    grafo hasta suspensión o completitud.
//! 4. Persistencia atómica del estado y liberación del mutex. Si el
//!    transporte cancela el turno, no se hace commit: el último checkpoint
//!    es autoritativo (el futuro se descarta antes del save).
//! 5. Respuestas en el orden producido; la variante streaming las entrega
//!    según se generan por un canal acotado.

pub(crate) mod engine;
pub(crate) mod orchestrator;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use soni_dsl::{BusyPolicy, OnNoProgress};

use crate::checkpoint::Checkpointer;
use crate::constants::{META_NO_PROGRESS, META_TRACE, SLOT_CONFIDENCE_FLOOR, TRACE_CAP};
use crate::errors::RuntimeError;
use crate::exec::{check_collect_timeout, conversation_summary, resume_collect, resume_confirm, CollectResume,
                  CollectTimeout, ConfirmResume, RuntimeContext};
pub use crate::exec::HandoffSignal;
use crate::flow::FlowManager;
use crate::graph::{CompiledConfig, NodeKind};
use crate::hashing::hash_str;
use crate::nlu::{available_commands, NluEngine, SlotAnswerKind, SlotUnderstanding};
use crate::registry::Registries;
use crate::state::{ConversationState, DialogueState, FlowDelta, Message, PendingTask};

use engine::{apply_and_emit, drive, generic_error_message, goto_target, path_to_completed, path_to_idle, settle};

/// Evento de la variante streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Granularidad fina cuando el colaborador NLU la ofrece.
    Token(String),
    Message(String),
    Handoff(HandoffSignal),
    Error(String),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub responses: Vec<String>,
    /// Etiqueta opaca del estado persistido (cambia en cada commit).
    pub state_tag: String,
    pub handoff: Option<HandoffSignal>,
}

/// Acumulador de salidas del turno. Mantiene el orden de producción y, si
/// hay canal de streaming, entrega cada mensaje según se genera (el canal es
/// acotado: un consumidor lento bloquea a este productor, no a otras
/// sesiones).
pub(crate) struct TurnSink<'a> {
    pub responses: Vec<String>,
    pub handoff: Option<HandoffSignal>,
    tx: Option<&'a mpsc::Sender<Event>>,
}

impl<'a> TurnSink<'a> {
    fn new(tx: Option<&'a mpsc::Sender<Event>>) -> Self {
        Self { responses: Vec::new(),
               handoff: None,
               tx }
    }

    pub async fn message(&mut self, text: &str) {
        self.responses.push(text.to_string());
        if let Some(tx) = self.tx {
            let _ = tx.send(Event::Message(text.to_string())).await;
        }
    }

    pub async fn handoff(&mut self, signal: HandoffSignal) {
        if let Some(tx) = self.tx {
            let _ = tx.send(Event::Handoff(signal.clone())).await;
        }
        self.handoff = Some(signal);
    }
}

pub struct Runtime<C: Checkpointer> {
    config: Arc<CompiledConfig>,
    checkpointer: C,
    registries: Arc<Registries>,
    nlu: Arc<dyn NluEngine>,
    flow_manager: FlowManager,
    sessions: DashMap<String, Arc<Mutex<()>>>,
    busy_policy: BusyPolicy,
}

impl<C: Checkpointer> Runtime<C> {
    pub fn new(config: CompiledConfig, checkpointer: C, registries: Arc<Registries>, nlu: Arc<dyn NluEngine>) -> Self {
        let flow_manager = FlowManager::new(&config.document.settings.flow_management);
        Self { config: Arc::new(config),
               checkpointer,
               registries,
               nlu,
               flow_manager,
               sessions: DashMap::new(),
               busy_policy: BusyPolicy::default() }
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn config(&self) -> &CompiledConfig {
        &self.config
    }

    fn context(&self) -> RuntimeContext<'_> {
        RuntimeContext { config: &self.config,
                         registries: &self.registries,
                         nlu: self.nlu.as_ref(),
                         flow_manager: &self.flow_manager }
    }

    async fn acquire(&self, user_id: &str) -> Result<tokio::sync::OwnedMutexGuard<()>, RuntimeError> {
        let lock = self.sessions
                       .entry(user_id.to_string())
                       .or_insert_with(|| Arc::new(Mutex::new(())))
                       .clone();
        match self.busy_policy {
            BusyPolicy::Wait => Ok(lock.lock_owned().await),
            BusyPolicy::Reject => lock.try_lock_owned()
                                      .map_err(|_| RuntimeError::SessionBusy { user_id: user_id.to_string() }),
        }
    }

    /// Abre una sesión explícitamente: estado fresco, idioma fijado y, si el
    /// documento declara `default_flow`, el saludo inicial de ese flujo.
    pub async fn start_session(&self, user_id: &str, language: Option<&str>) -> Result<TurnOutcome, RuntimeError> {
        let _guard = self.acquire(user_id).await?;
        let ctx = self.context();
        let mut sink = TurnSink::new(None);

        let mut state = DialogueState::new();
        state.language = language.map(|l| l.to_string());

        if let Some(default_flow) = ctx.settings().conversation.default_flow.clone() {
            state = settle(&state, &ctx, &[ConversationState::Understanding]).await?;
            state = orchestrator::apply_commands(&state, &ctx, &mut sink,
                                                 vec![crate::nlu::NluCommand::StartFlow { flow: default_flow }]).await?;
            state = drive(state, &ctx, &mut sink).await?;
        }

        self.commit(user_id, &state, &mut sink).await
    }

    /// Procesa un turno completo y devuelve las respuestas acumuladas.
    pub async fn process_turn(&self, user_id: &str, message: &str) -> Result<TurnOutcome, RuntimeError> {
        let _guard = self.acquire(user_id).await?;
        self.process_locked(user_id, message, None).await
    }

    /// Variante streaming: entrega `Event`s por un canal acotado según se
    /// producen y termina con `Done` (o `Error`).
    pub fn stream_turn(self: Arc<Self>, user_id: &str, message: &str) -> mpsc::Receiver<Event>
        where C: 'static
    {
        let (tx, rx) = mpsc::channel(32);
        let runtime = self;
        let user_id = user_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move {
            let guard = match runtime.acquire(&user_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    let _ = tx.send(Event::Error(e.to_string())).await;
                    let _ = tx.send(Event::Done).await;
                    return;
                }
            };
            let result = runtime.process_locked(&user_id, &message, Some(&tx)).await;
            drop(guard);
            match result {
                Ok(_) => {
                    let _ = tx.send(Event::Done).await;
                }
                Err(e) => {
                    let _ = tx.send(Event::Error(e.to_string())).await;
                    let _ = tx.send(Event::Done).await;
                }
            }
        });
        rx
    }

    async fn process_locked(&self,
                            user_id: &str,
                            message: &str,
                            tx: Option<&mpsc::Sender<Event>>)
                            -> Result<TurnOutcome, RuntimeError> {
        let mut sink = TurnSink::new(tx);
        let loaded = self.checkpointer
                         .load(user_id)
                         .await
                         .map_err(|e| RuntimeError::Checkpoint(e.to_string()))?
                         .unwrap_or_default();

        match self.run_turn(loaded.clone(), message, &mut sink).await {
            Ok(state) => self.commit(user_id, &state, &mut sink).await,
            // Transición rechazada: el turno falla y el estado queda
            // coercionado a ERROR con un mensaje genérico.
            Err(RuntimeError::InvalidStateTransition { from, to }) => {
                log::error!("turn failed with invalid_state_transition {from} -> {to}");
                let mut coerced = loaded;
                coerced.conversation_state = ConversationState::Error;
                coerced.pending_task = None;
                coerced.turn_count += 1;
                let message = generic_error_message(&coerced, &self.context());
                sink.message(&message).await;
                self.commit(user_id, &coerced, &mut sink).await
            }
            Err(e) => Err(e),
        }
    }

    async fn commit(&self,
                    user_id: &str,
                    state: &DialogueState,
                    sink: &mut TurnSink<'_>)
                    -> Result<TurnOutcome, RuntimeError> {
        self.checkpointer
            .save(user_id, state)
            .await
            .map_err(|e| RuntimeError::Checkpoint(e.to_string()))?;
        let serialized = serde_json::to_string(state).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        Ok(TurnOutcome { responses: std::mem::take(&mut sink.responses),
                         state_tag: hash_str(&serialized),
                         handoff: sink.handoff.take() })
    }

    /// Pipeline de un turno sobre un estado ya cargado. No persiste.
    async fn run_turn(&self,
                      state: DialogueState,
                      text: &str,
                      sink: &mut TurnSink<'_>)
                      -> Result<DialogueState, RuntimeError> {
        let ctx = self.context();
        let mut state = state;

        // Una sesión COMPLETED (p.ej. tras handoff) arranca de nuevo: los
        // frames que quedaran son historia, no conversación viva.
        if state.conversation_state == ConversationState::Completed {
            state.flow_stack.clear();
            state.flow_slots.clear();
            state.pending_task = None;
            state.current_step = None;
            state = settle(&state, &ctx, path_to_idle(state.conversation_state)).await?;
        }

        // Inactividad desde el último turno: alimenta el deadline de los
        // collect en espera. Se captura antes de renovar `last_activity`.
        let idle_seconds = (Utc::now() - state.last_activity).num_milliseconds() as f64 / 1000.0;

        state.turn_count += 1;
        state.last_activity = Utc::now();
        state.messages.push(Message::user(text));

        let before = progress_snapshot(&state);

        state = match state.conversation_state {
            ConversationState::WaitingForSlot => {
                self.turn_waiting_slot(state, &ctx, text, idle_seconds, sink).await?
            }
            ConversationState::Confirming => self.turn_confirming(state, &ctx, text, sink).await?,
            // Turno interrumpido a mitad de ejecución: se retoma el grafo
            // sin consultar al NLU.
            ConversationState::ExecutingAction => drive(state, &ctx, sink).await?,
            _ => self.turn_full(state, &ctx, text, sink).await?,
        };

        state = self.track_progress(state, &ctx, before, sink).await?;

        // Traza compacta del turno en metadata.
        let record = json!({
            "turn": state.turn_count,
            "state": state.conversation_state.as_str(),
            "flow": state.top().map(|f| f.flow_id.clone()),
            "responses": sink.responses.len(),
        });
        push_trace(&mut state, record);

        if let Err(violation) = state.check_invariants() {
            log::error!("state invariant violated after turn {}: {violation}", state.turn_count);
        }
        Ok(state)
    }

    /// Camino NLU completo (IDLE/UNDERSTANDING/ERROR).
    async fn turn_full(&self,
                       state: DialogueState,
                       ctx: &RuntimeContext<'_>,
                       text: &str,
                       sink: &mut TurnSink<'_>)
                       -> Result<DialogueState, RuntimeError> {
        let mut state = state;
        if matches!(state.conversation_state, ConversationState::Idle | ConversationState::Error) {
            state = ctx.flow_manager
                       .apply(&state, &FlowDelta::empty().with_state(ConversationState::Understanding))?;
        }

        let scope = available_commands(&state, &self.config);
        let nlu_ctx = scope.to_nlu_context(&state);

        let understanding = match self.nlu.understand_full(text, &state.messages, &nlu_ctx).await {
            Ok(u) => u,
            Err(e) => {
                log::warn!("understand_full failed: {e}");
                let message = generic_error_message(&state, ctx);
                return apply_and_emit(&state, ctx, sink, &FlowDelta::empty().with_message(message)).await;
            }
        };
        log::debug!("nlu full: command={:?} slots={} confidence={:.2}",
                    understanding.command,
                    understanding.slots.len(),
                    understanding.confidence);

        let mut commands = orchestrator::map_full_understanding(&understanding, &scope, ctx);
        // Nada reconocido y ningún flujo activo: mismo tratamiento que un
        // comando fuera de alcance (flujo de fallback o aviso).
        if commands.is_empty() && state.flow_stack.is_empty() {
            commands.push(crate::nlu::NluCommand::OutOfScope);
        }
        state = orchestrator::apply_commands(&state, ctx, sink, commands).await?;

        drive(state, ctx, sink).await
    }

    /// Camino ligero: la sesión espera un slot concreto.
    async fn turn_waiting_slot(&self,
                               state: DialogueState,
                               ctx: &RuntimeContext<'_>,
                               text: &str,
                               idle_seconds: f64,
                               sink: &mut TurnSink<'_>)
                               -> Result<DialogueState, RuntimeError> {
        let Some(PendingTask::Collect { slot, attempts, reprompts }) = state.pending_task.clone() else {
            log::warn!("WAITING_FOR_SLOT without collect task, rerouting to full nlu");
            return self.reroute_full(state, ctx, text, sink).await;
        };

        // Deadline del collect antes de consultar al NLU.
        if let Some((_, collect)) = self.current_collect_node(&state, &slot) {
            match check_collect_timeout(&collect, &state, ctx, idle_seconds, attempts, reprompts) {
                CollectTimeout::NotExpired => {}
                CollectTimeout::Route { delta, to } => {
                    let state = apply_and_emit(&state, ctx, sink, &delta).await?;
                    let moved = goto_target(&state, ctx, sink, to).await?;
                    return drive(moved.state, ctx, sink).await;
                }
                CollectTimeout::Reprompt { delta } => {
                    return apply_and_emit(&state, ctx, sink, &delta).await;
                }
            }
        }

        let scope = available_commands(&state, &self.config);
        let nlu_ctx = scope.to_nlu_context(&state);
        let su = match self.nlu.understand_slot(text, &slot, &nlu_ctx).await {
            Ok(su) => su,
            Err(e) => {
                log::warn!("understand_slot failed: {e}");
                let message = generic_error_message(&state, ctx);
                return apply_and_emit(&state, ctx, sink, &FlowDelta::empty().with_message(message)).await;
            }
        };

        // Ambiguo o cambio de intención: NLU completo.
        if su.confidence < SLOT_CONFIDENCE_FLOOR || su.kind == SlotAnswerKind::IntentChange {
            return self.reroute_full(state, ctx, text, sink).await;
        }

        match su.kind {
            SlotAnswerKind::SlotValue | SlotAnswerKind::Correction => {
                self.resume_waiting_collect(state, ctx, sink, &slot, attempts, reprompts, &su).await
            }
            SlotAnswerKind::Cancellation => {
                orchestrator::cancel_active_flow(&state, ctx, sink).await
            }
            // Preguntas, confirmaciones sueltas o continuaciones: se repite
            // el prompt del slot sin consumir intentos.
            _ => {
                let prompt = self.slot_prompt(&state, &slot);
                apply_and_emit(&state, ctx, sink, &FlowDelta::empty().with_message(prompt)).await
            }
        }
    }

    async fn resume_waiting_collect(&self,
                                    state: DialogueState,
                                    ctx: &RuntimeContext<'_>,
                                    sink: &mut TurnSink<'_>,
                                    waiting_slot: &str,
                                    attempts: u32,
                                    reprompts: u32,
                                    su: &SlotUnderstanding)
                                    -> Result<DialogueState, RuntimeError> {
        let value = su.value.clone().unwrap_or(Value::Null);
        let target_slot = su.target_slot.clone().unwrap_or_else(|| waiting_slot.to_string());

        // Validando: la transición pasa por VALIDATING_SLOT.
        let mut state = ctx.flow_manager
                           .apply(&state, &FlowDelta::empty().with_state(ConversationState::ValidatingSlot))?;

        if target_slot != waiting_slot {
            // Corrección a otro slot: se escribe y el collect re-pregunta.
            let delta = FlowDelta::empty().with_task(None)
                                          .with_state(ConversationState::ExecutingAction);
            state = ctx.flow_manager.apply(&state, &delta)?;
            state = orchestrator::apply_commands(&state, ctx, sink,
                                                 vec![crate::nlu::NluCommand::SetSlot { name: target_slot,
                                                                                        value }]).await?;
            return drive(state, ctx, sink).await;
        }

        let Some((node, collect)) = self.current_collect_node(&state, waiting_slot) else {
            log::warn!("no collect node for waiting slot '{waiting_slot}', rerouting");
            let delta = FlowDelta::empty().with_task(None)
                                          .with_state(ConversationState::Understanding);
            let state = ctx.flow_manager.apply(&state, &delta)?;
            return drive(state, ctx, sink).await;
        };

        match resume_collect(&collect, &state, ctx, &value, attempts, reprompts).await? {
            CollectResume::Accepted { delta } => {
                // El avance es explícito: re-ejecutar el collect con
                // `force: true` volvería a vaciar el slot recién llenado.
                state = apply_and_emit(&state, ctx, sink, &delta).await?;
                let moved = goto_target(&state, ctx, sink, node.next).await?;
                drive(moved.state, ctx, sink).await
            }
            CollectResume::Rejected { delta } => apply_and_emit(&state, ctx, sink, &delta).await,
            CollectResume::Escalate { delta, target } => {
                state = apply_and_emit(&state, ctx, sink, &delta).await?;
                match target {
                    Some(target) => {
                        let state = ctx.flow_manager
                                       .apply(&state,
                                              &FlowDelta::empty().with_state(ConversationState::ExecutingAction))?;
                        let moved = goto_target(&state, ctx, sink, target).await?;
                        drive(moved.state, ctx, sink).await
                    }
                    // Default: handoff a la cola configurada.
                    None => {
                        let queue = ctx.settings().handoff.default_queue.clone();
                        let signal = HandoffSignal { queue,
                                                     context: Default::default(),
                                                     summary: conversation_summary(&state) };
                        sink.handoff(signal).await;
                        settle(&state, ctx, path_to_completed(state.conversation_state)).await
                    }
                }
            }
        }
    }

    /// Camino ligero: la sesión espera una confirmación.
    async fn turn_confirming(&self,
                             state: DialogueState,
                             ctx: &RuntimeContext<'_>,
                             text: &str,
                             sink: &mut TurnSink<'_>)
                             -> Result<DialogueState, RuntimeError> {
        let Some(PendingTask::Confirm { step_id, attempts }) = state.pending_task.clone() else {
            log::warn!("CONFIRMING without confirm task, rerouting to full nlu");
            return self.reroute_full(state, ctx, text, sink).await;
        };

        let scope = available_commands(&state, &self.config);
        let nlu_ctx = scope.to_nlu_context(&state);
        let su = match self.nlu.understand_slot(text, "_confirmation", &nlu_ctx).await {
            Ok(su) => su,
            Err(e) => {
                log::warn!("understand_slot (confirmation) failed: {e}");
                let message = generic_error_message(&state, ctx);
                return apply_and_emit(&state, ctx, sink, &FlowDelta::empty().with_message(message)).await;
            }
        };

        if su.confidence < SLOT_CONFIDENCE_FLOOR || su.kind == SlotAnswerKind::IntentChange {
            return self.reroute_full(state, ctx, text, sink).await;
        }

        if su.kind == SlotAnswerKind::Cancellation {
            return orchestrator::cancel_active_flow(&state, ctx, sink).await;
        }

        let command = match su.kind {
            SlotAnswerKind::Confirmation => match su.value.as_ref().and_then(|v| v.as_bool()) {
                Some(true) => Some(crate::nlu::NluCommand::ConfirmYes),
                Some(false) => Some(crate::nlu::NluCommand::ConfirmNo),
                None => None,
            },
            SlotAnswerKind::Correction | SlotAnswerKind::SlotValue => {
                su.target_slot
                  .clone()
                  .map(|slot| crate::nlu::NluCommand::Correct { slot,
                                                                value: su.value.clone().unwrap_or(Value::Null) })
            }
            _ => None,
        };

        let Some((node, confirm)) = self.current_confirm_node(&state, &step_id) else {
            log::warn!("no confirm node '{step_id}' for pending task, rerouting");
            return self.reroute_full(state, ctx, text, sink).await;
        };

        let Some(command) = command else {
            // Nada clasificable: el confirm se re-ejecuta y repite su prompt;
            // al agotar `max_attempts` se escala a handoff.
            log::debug!("unclassifiable confirmation reply at '{step_id}' (attempt {attempts})");
            let next_attempts = attempts + 1;
            if confirm.max_attempts.is_some_and(|max| next_attempts >= max) {
                let signal = HandoffSignal { queue: ctx.settings().handoff.default_queue.clone(),
                                             context: Default::default(),
                                             summary: conversation_summary(&state) };
                sink.handoff(signal).await;
                let state = ctx.flow_manager.apply(&state, &FlowDelta::empty().with_task(None))?;
                return settle(&state, ctx, path_to_completed(state.conversation_state)).await;
            }
            let mut state = ctx.flow_manager.apply(&state, &FlowDelta::empty().with_task(None))?;
            state = drive(state, ctx, sink).await?;
            if let Some(PendingTask::Confirm { step_id: pending_step, attempts: pending_attempts }) =
                &mut state.pending_task
            {
                if *pending_step == step_id {
                    *pending_attempts = next_attempts;
                }
            }
            return Ok(state);
        };

        match resume_confirm(&node, &confirm, &command) {
            ConfirmResume::Route { delta, to } => {
                let state = apply_and_emit(&state, ctx, sink, &delta).await?;
                let moved = goto_target(&state, ctx, sink, to).await?;
                drive(moved.state, ctx, sink).await
            }
            ConfirmResume::ReExecute { delta } => {
                let state = apply_and_emit(&state, ctx, sink, &delta).await?;
                drive(state, ctx, sink).await
            }
        }
    }

    /// Sale de un estado bloqueado hacia el camino NLU completo.
    async fn reroute_full(&self,
                          state: DialogueState,
                          ctx: &RuntimeContext<'_>,
                          text: &str,
                          sink: &mut TurnSink<'_>)
                          -> Result<DialogueState, RuntimeError> {
        let mut delta = FlowDelta::empty().with_task(None);
        if matches!(state.conversation_state,
                    ConversationState::WaitingForSlot
                    | ConversationState::Confirming
                    | ConversationState::ValidatingSlot)
        {
            delta = delta.with_state(ConversationState::Understanding);
        }
        let state = ctx.flow_manager.apply(&state, &delta)?;
        Box::pin(self.turn_full(state, ctx, text, sink)).await
    }

    fn slot_prompt(&self, state: &DialogueState, slot: &str) -> String {
        let resolver = crate::exec::StateResolver { state };
        self.config
            .document
            .slot(slot)
            .map(|def| crate::expr::render_template(&def.prompt, &resolver))
            .unwrap_or_default()
    }

    fn current_collect_node(&self,
                            state: &DialogueState,
                            slot: &str)
                            -> Option<(crate::graph::Node, crate::graph::CollectNode)> {
        let top = state.top()?;
        let graph = self.config.graphs.get(&top.flow_name)?;
        let node = graph.node(graph.resolve_step(&top.current_step)?);
        match &node.kind {
            NodeKind::Collect(collect) if collect.slot == slot => Some((node.clone(), collect.clone())),
            _ => None,
        }
    }

    fn current_confirm_node(&self,
                            state: &DialogueState,
                            step_id: &str)
                            -> Option<(crate::graph::Node, crate::graph::ConfirmNode)> {
        let top = state.top()?;
        let graph = self.config.graphs.get(&top.flow_name)?;
        let node = graph.node(graph.resolve_step(step_id)?);
        match &node.kind {
            NodeKind::Confirm(confirm) => Some((node.clone(), confirm.clone())),
            _ => None,
        }
    }

    /// Contabiliza el progreso del turno y escala al llegar al límite de
    /// turnos sin progreso.
    async fn track_progress(&self,
                            state: DialogueState,
                            ctx: &RuntimeContext<'_>,
                            before: ProgressSnapshot,
                            sink: &mut TurnSink<'_>)
                            -> Result<DialogueState, RuntimeError> {
        let mut state = state;
        let progressed = before != progress_snapshot(&state);
        let mut counter = state.metadata
                               .get(META_NO_PROGRESS)
                               .and_then(|v| v.as_u64())
                               .unwrap_or(0);
        counter = if progressed { 0 } else { counter + 1 };

        let limit = ctx.settings().conversation.max_turns_without_progress as u64;
        if counter >= limit && limit > 0 {
            log::warn!("session reached {counter} turns without progress, escalating");
            counter = 0;
            match ctx.settings().conversation.on_no_progress {
                OnNoProgress::Handoff => {
                    let signal = HandoffSignal { queue: ctx.settings().handoff.default_queue.clone(),
                                                 context: Default::default(),
                                                 summary: conversation_summary(&state) };
                    sink.handoff(signal).await;
                    state.pending_task = None;
                    state = settle(&state, ctx, path_to_completed(state.conversation_state)).await?;
                }
                OnNoProgress::Fallback => {
                    if let Some(fallback) = ctx.settings().conversation.fallback_flow.clone() {
                        state = self.reroute_into_flow(state, ctx, sink, &fallback).await?;
                    }
                }
                OnNoProgress::Retry => {
                    if let Some(last) = state.last_response.clone() {
                        sink.message(&last).await;
                    }
                }
            }
        }

        state.metadata.insert(META_NO_PROGRESS.to_string(), json!(counter));
        Ok(state)
    }

    async fn reroute_into_flow(&self,
                               state: DialogueState,
                               ctx: &RuntimeContext<'_>,
                               sink: &mut TurnSink<'_>,
                               flow: &str)
                               -> Result<DialogueState, RuntimeError> {
        let mut delta = FlowDelta::empty().with_task(None);
        if matches!(state.conversation_state,
                    ConversationState::WaitingForSlot
                    | ConversationState::Confirming
                    | ConversationState::ValidatingSlot)
        {
            delta = delta.with_state(ConversationState::Understanding);
        }
        let state = ctx.flow_manager.apply(&state, &delta)?;
        let state = orchestrator::apply_commands(&state, ctx, sink,
                                                 vec![crate::nlu::NluCommand::StartFlow { flow: flow.to_string() }])
                                   .await?;
        drive(state, ctx, sink).await
    }

    /// Barrido de sesiones expiradas por inactividad
    /// (`settings.conversation.session_timeout`). Devuelve cuántas cerró.
    pub async fn sweep_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize, RuntimeError> {
        let timeout = self.config.document.settings.conversation.session_timeout as i64;
        let mut removed = 0;
        let sessions = self.checkpointer
                           .sessions()
                           .await
                           .map_err(|e| RuntimeError::Checkpoint(e.to_string()))?;
        for session_id in sessions {
            let Some(state) = self.checkpointer
                                  .load(&session_id)
                                  .await
                                  .map_err(|e| RuntimeError::Checkpoint(e.to_string()))?
            else {
                continue;
            };
            if (now - state.last_activity).num_seconds() > timeout {
                self.checkpointer
                    .delete(&session_id)
                    .await
                    .map_err(|e| RuntimeError::Checkpoint(e.to_string()))?;
                self.sessions.remove(&session_id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

type ProgressSnapshot = (Vec<crate::state::FlowContext>,
                         HashMap<String, HashMap<String, Value>>,
                         HashMap<String, Value>,
                         Option<String>,
                         Option<PendingTask>);

/// Un turno progresa si movió la pila, los slots, el step actual o la tarea
/// pendiente.
fn progress_snapshot(state: &DialogueState) -> ProgressSnapshot {
    (state.flow_stack.clone(),
     state.flow_slots.clone(),
     state.session_slots.clone(),
     state.current_step.clone(),
     state.pending_task.clone())
}

fn push_trace(state: &mut DialogueState, record: Value) {
    let trace = state.metadata
                     .entry(META_TRACE.to_string())
                     .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = trace {
        items.push(record);
        if items.len() > TRACE_CAP {
            let excess = items.len() - TRACE_CAP;
            items.drain(0..excess);
        }
    }
}

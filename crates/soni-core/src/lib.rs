//! soni-core: Dialogue Runtime Core (DRC)
//!
//! Propósito:
//! - Compilar la IR declarativa (`soni-dsl`) a grafos ejecutables por flujo.
//! - Mantener el estado de diálogo por sesión como valor puro serializable y
//!   mutarlo únicamente vía deltas (`apply(state, delta) → state'`).
//! - Orquestar el turno: routing NLU, aplicación de comandos, ejecución del
//!   grafo hasta suspensión/completitud, checkpoint atómico y streaming de
//!   respuestas.
//!
//! Componentes principales:
//! - `expr`: motor de expresiones total (condiciones, `{{ expr }}`,
//!   interpolación `{name}`).
//! - `graph`: lowering + linking de steps a `FlowGraph` y su validador.
//! - `state`: `DialogueState`, `FlowDelta`, máquina de estados conversacional.
//! - `flow`: stack de flujos con slots por frame.
//! - `exec`: un executor por tipo de nodo.
//! - `runtime`: bucle de turnos, router, orquestador de comandos, sesiones.
//! - `registry`: acciones, validadores y normalizadores (name-addressed).
//! - `nlu`: contrato del colaborador NLU + scoping dinámico de comandos.
//! - `checkpoint`: snapshot/restore durable por sesión (trait + in-memory).
//! - `responses`: resolución i18n de la sección `responses`.
//!
//! Re-exports: se exponen los símbolos clave para uso desde binarios/tests.

pub mod checkpoint;
pub mod constants;
pub mod errors;
pub mod exec;
pub mod expr;
pub mod flow;
pub mod graph;
pub mod hashing;
pub mod nlu;
pub mod registry;
pub mod responses;
pub mod runtime;
pub mod state;

// Re-exports públicos principales
pub use checkpoint::{Checkpointer, CheckpointError, InMemoryCheckpointer};
pub use errors::{ActionFailure, CompileError, ErrorKind, RuntimeError};
pub use exec::{ExecOutcome, SuspendReason};
pub use flow::FlowManager;
pub use graph::{compile, CompiledConfig, FlowGraph, Node, NodeId, NodeKind, Target};
pub use nlu::{FullUnderstanding, MessageType, NluCommand, NluEngine, NluError, SlotAnswerKind, SlotUnderstanding};
pub use registry::{ActionHandler, Registries, SlotNormalizer, SlotValidator};
pub use runtime::{Event, HandoffSignal, Runtime, TurnOutcome};
pub use state::{ConversationState, DialogueState, FlowContext, FlowDelta, Message, PendingTask, Role};

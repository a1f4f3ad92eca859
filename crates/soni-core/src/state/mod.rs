//! Modelo de estado por sesión.
//!
//! `DialogueState` es un valor puro y serializable: el checkpoint es
//! exactamente este valor y nada más. Toda mutación pasa por
//! `FlowManager::apply(state, delta)`; los executors producen `FlowDelta`
//! inmutables y nunca tocan el estado en sitio.

mod delta;
mod dialogue;
mod transition;

pub use delta::{FlowDelta, FlowPush, PopMode, SlotScope, SlotUpdate};
pub use dialogue::{ConversationState, DialogueState, FlowContext, Message, PendingTask, Role};
pub use transition::StateTransitionValidator;

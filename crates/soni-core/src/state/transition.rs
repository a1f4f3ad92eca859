//! Validador de transiciones de la máquina conversacional.
//!
//! Tabla de adyacencia (sucesores permitidos):
//!
//! ```text
//! IDLE              → UNDERSTANDING, ERROR
//! UNDERSTANDING     → WAITING_FOR_SLOT, EXECUTING_ACTION, IDLE, ERROR
//! WAITING_FOR_SLOT  → VALIDATING_SLOT, UNDERSTANDING, ERROR
//! VALIDATING_SLOT   → WAITING_FOR_SLOT, UNDERSTANDING, EXECUTING_ACTION, ERROR
//! EXECUTING_ACTION  → COMPLETED, WAITING_FOR_SLOT, CONFIRMING, ERROR
//! CONFIRMING        → EXECUTING_ACTION, COMPLETED, UNDERSTANDING, ERROR
//! COMPLETED         → IDLE
//! ERROR             → UNDERSTANDING, IDLE
//! ```
//!
//! Quedarse en el mismo estado no es una transición y siempre se admite.

use crate::errors::RuntimeError;
use crate::state::ConversationState;

pub struct StateTransitionValidator;

impl StateTransitionValidator {
    pub fn allowed(from: ConversationState, to: ConversationState) -> bool {
        use ConversationState::*;
        if from == to {
            return true;
        }
        let successors: &[ConversationState] = match from {
            Idle => &[Understanding, Error],
            Understanding => &[WaitingForSlot, ExecutingAction, Idle, Error],
            WaitingForSlot => &[ValidatingSlot, Understanding, Error],
            ValidatingSlot => &[WaitingForSlot, Understanding, ExecutingAction, Error],
            ExecutingAction => &[Completed, WaitingForSlot, Confirming, Error],
            Confirming => &[ExecutingAction, Completed, Understanding, Error],
            Completed => &[Idle],
            Error => &[Understanding, Idle],
        };
        successors.contains(&to)
    }

    pub fn ensure(from: ConversationState, to: ConversationState) -> Result<(), RuntimeError> {
        if Self::allowed(from, to) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidStateTransition { from: from.as_str().to_string(),
                                                       to: to.as_str().to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConversationState::*;

    #[test]
    fn adjacency_matches_table() {
        assert!(StateTransitionValidator::allowed(Idle, Understanding));
        assert!(StateTransitionValidator::allowed(Understanding, ExecutingAction));
        assert!(StateTransitionValidator::allowed(WaitingForSlot, ValidatingSlot));
        assert!(StateTransitionValidator::allowed(ValidatingSlot, ExecutingAction));
        assert!(StateTransitionValidator::allowed(ExecutingAction, Confirming));
        assert!(StateTransitionValidator::allowed(Confirming, Completed));
        assert!(StateTransitionValidator::allowed(Completed, Idle));
        assert!(StateTransitionValidator::allowed(Error, Idle));
    }

    #[test]
    fn rejected_transitions() {
        assert!(!StateTransitionValidator::allowed(Idle, Completed));
        assert!(!StateTransitionValidator::allowed(Completed, Understanding));
        assert!(!StateTransitionValidator::allowed(WaitingForSlot, ExecutingAction));
        assert!(!StateTransitionValidator::allowed(Error, Confirming));
    }

    #[test]
    fn identity_is_always_allowed() {
        assert!(StateTransitionValidator::allowed(Understanding, Understanding));
        assert!(StateTransitionValidator::allowed(Error, Error));
    }

    #[test]
    fn every_state_reaches_error_except_completed() {
        for from in [Idle, Understanding, WaitingForSlot, ValidatingSlot, ExecutingAction, Confirming, Error] {
            assert!(StateTransitionValidator::allowed(from, Error), "{from:?} must reach ERROR");
        }
        assert!(!StateTransitionValidator::allowed(Completed, Error));
    }
}

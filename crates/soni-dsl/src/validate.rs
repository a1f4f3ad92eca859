//! Validación estructural del documento.
//!
//! Reglas aplicadas aquí (lo que se puede decidir mirando sólo la IR):
//! - `version` soportada.
//! - Ids de step únicos por flujo y nunca palabras reservadas.
//! - Campos obligatorios/foráneos por tipo de step.
//! - Referencias a slots/acciones/flujos declarados en el documento.
//! - Forma de los casos de branch (exactamente una de condition/all/any).
//! - Compatibilidad de defaults de slot con su tipo declarado.
//!
//! La resolución de targets, alcanzabilidad y ciclos queda para el compilador
//! de grafos, que ve el documento completo ya enlazado.

use crate::document::{FlowDocument, SlotDef};
use crate::error::DslError;
use crate::step::{StepDef, StepType, WhenClause};
use crate::RESERVED_TARGETS;
use std::collections::HashSet;

pub fn validate_document(doc: &FlowDocument) -> Result<(), DslError> {
    if !doc.version.starts_with('1') {
        return Err(DslError::UnsupportedVersion(doc.version.clone()));
    }

    for (name, slot) in &doc.slots {
        validate_slot_default(name, slot)?;
    }

    for (flow_name, flow) in &doc.flows {
        if flow.process.is_empty() {
            return Err(DslError::EmptyProcess { flow: flow_name.clone() });
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &flow.process {
            if RESERVED_TARGETS.contains(&step.step.as_str()) {
                return Err(DslError::ReservedStepId { flow: flow_name.clone(),
                                                      step: step.step.clone() });
            }
            if !seen.insert(step.step.as_str()) {
                return Err(DslError::DuplicateStepId { flow: flow_name.clone(),
                                                       step: step.step.clone() });
            }
            validate_step(doc, flow_name, step)?;
        }
    }
    Ok(())
}

fn validate_slot_default(name: &str, slot: &SlotDef) -> Result<(), DslError> {
    if let Some(default) = &slot.default {
        if !slot.slot_type.admits(default) {
            return Err(DslError::DefaultTypeMismatch { slot: name.to_string(),
                                                       expected: slot.slot_type.as_str().to_string() });
        }
    }
    Ok(())
}

/// Campos presentes en la parte específica-por-tipo del step.
fn present_fields(step: &StepDef) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if step.slot.is_some() {
        fields.push("slot");
    }
    if step.force.is_some() {
        fields.push("force");
    }
    if step.max_attempts.is_some() {
        fields.push("max_attempts");
    }
    if step.on_invalid.is_some() {
        fields.push("on_invalid");
    }
    if step.reprompt_message.is_some() {
        fields.push("reprompt_message");
    }
    if step.call.is_some() {
        fields.push("call");
    }
    if step.map_outputs.is_some() {
        fields.push("map_outputs");
    }
    if step.timeout.is_some() {
        fields.push("timeout");
    }
    if step.retry.is_some() {
        fields.push("retry");
    }
    if step.on_error.is_some() {
        fields.push("on_error");
    }
    if step.on_timeout.is_some() {
        fields.push("on_timeout");
    }
    if step.else_to.is_some() {
        fields.push("else");
    }
    if step.message.is_some() {
        fields.push("message");
    }
    if step.response.is_some() {
        fields.push("response");
    }
    if step.on_yes.is_some() {
        fields.push("on_yes");
    }
    if step.on_no.is_some() {
        fields.push("on_no");
    }
    if step.on_change.is_some() {
        fields.push("on_change");
    }
    if step.on_correction.is_some() {
        fields.push("on_correction");
    }
    if step.on_modification.is_some() {
        fields.push("on_modification");
    }
    if step.instruction.is_some() {
        fields.push("instruction");
    }
    if step.context.is_some() {
        fields.push("context");
    }
    if step.store_as.is_some() {
        fields.push("store_as");
    }
    if step.flow.is_some() {
        fields.push("flow");
    }
    if step.inputs.is_some() {
        fields.push("inputs");
    }
    if step.outputs.is_some() {
        fields.push("outputs");
    }
    if step.values.is_some() {
        fields.push("values");
    }
    if step.queue.is_some() {
        fields.push("queue");
    }
    fields
}

fn allowed_fields(step_type: StepType) -> &'static [&'static str] {
    match step_type {
        StepType::Collect => &["slot", "force", "max_attempts", "on_invalid", "reprompt_message", "timeout", "on_timeout"],
        StepType::Action => &["call", "map_outputs", "timeout", "retry", "on_error", "on_timeout"],
        StepType::Branch => &["else"],
        StepType::Say => &["message", "response"],
        StepType::Confirm => &["message",
                               "response",
                               "on_yes",
                               "on_no",
                               "on_change",
                               "on_correction",
                               "on_modification",
                               "max_attempts",
                               "timeout",
                               "on_timeout"],
        StepType::Generate => &["instruction", "context", "store_as", "on_error"],
        StepType::CallFlow => &["flow", "inputs", "outputs", "on_error"],
        StepType::Set => &["values"],
        StepType::Handoff => &["queue", "context", "message", "response"],
    }
}

fn require(cond: bool, flow: &str, step: &StepDef, field: &'static str) -> Result<(), DslError> {
    if cond {
        Ok(())
    } else {
        Err(DslError::MissingField { flow: flow.to_string(),
                                     step: step.step.clone(),
                                     field,
                                     step_type: step.step_type.as_str().to_string() })
    }
}

fn validate_step(doc: &FlowDocument, flow: &str, step: &StepDef) -> Result<(), DslError> {
    let allowed = allowed_fields(step.step_type);
    for field in present_fields(step) {
        if !allowed.contains(&field) {
            return Err(DslError::ForeignField { flow: flow.to_string(),
                                                step: step.step.clone(),
                                                field,
                                                step_type: step.step_type.as_str().to_string() });
        }
    }

    // Forma de `when`: sólo branch usa la lista de casos.
    match (&step.when, step.step_type) {
        (Some(WhenClause::Cases(_)), t) if t != StepType::Branch => {
            return Err(DslError::Schema(format!("step '{}': case-list 'when' is only valid on branch", step.step)));
        }
        (Some(WhenClause::Guard(_)) | None, StepType::Branch) => {
            return Err(DslError::BranchWithoutCases { flow: flow.to_string(),
                                                      step: step.step.clone() });
        }
        _ => {}
    }

    match step.step_type {
        StepType::Collect => {
            require(step.slot.is_some(), flow, step, "slot")?;
            let slot = step.slot.as_deref().unwrap_or_default();
            if !doc.slots.contains_key(slot) {
                return Err(DslError::UnknownSlot { flow: flow.to_string(),
                                                   step: step.step.clone(),
                                                   slot: slot.to_string() });
            }
        }
        StepType::Action => {
            require(step.call.is_some(), flow, step, "call")?;
            let call = step.call.as_deref().unwrap_or_default();
            if !doc.actions.contains_key(call) {
                return Err(DslError::UndeclaredAction { flow: flow.to_string(),
                                                        step: step.step.clone(),
                                                        action: call.to_string() });
            }
        }
        StepType::Branch => {
            let cases = step.branch_cases().unwrap_or_default();
            if cases.is_empty() {
                return Err(DslError::BranchWithoutCases { flow: flow.to_string(),
                                                          step: step.step.clone() });
            }
            for case in cases {
                let forms = [case.condition.is_some(), case.all.is_some(), case.any.is_some()];
                if forms.iter().filter(|present| **present).count() != 1 {
                    return Err(DslError::AmbiguousBranchCase { flow: flow.to_string(),
                                                               step: step.step.clone() });
                }
            }
        }
        StepType::Say | StepType::Confirm => {
            require(step.message.is_some() || step.response.is_some(), flow, step, "message")?;
        }
        StepType::Generate => {
            require(step.instruction.is_some(), flow, step, "instruction")?;
        }
        StepType::CallFlow => {
            require(step.flow.is_some(), flow, step, "flow")?;
            let target = step.flow.as_deref().unwrap_or_default();
            if !doc.flows.contains_key(target) {
                return Err(DslError::UndeclaredFlow { flow: flow.to_string(),
                                                      step: step.step.clone(),
                                                      target: target.to_string() });
            }
        }
        StepType::Set => {
            require(step.values.as_ref().is_some_and(|v| !v.is_empty()), flow, step, "values")?;
        }
        StepType::Handoff => {}
    }

    // Slots de contexto (generate/handoff) deben estar declarados.
    if let Some(context) = &step.context {
        for name in context {
            if !doc.slots.contains_key(name) {
                return Err(DslError::UnknownSlot { flow: flow.to_string(),
                                                   step: step.step.clone(),
                                                   slot: name.clone() });
            }
        }
    }
    Ok(())
}

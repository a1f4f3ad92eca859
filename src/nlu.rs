//! NLU de palabras clave para demo y tests.
//!
//! Determinista y sin dependencias: empareja triggers declarados en el
//! documento contra el mensaje, extrae pares origen/destino del patrón
//! "from X to Y" y clasifica respuestas bloqueadas (sí/no, cancelación,
//! corrección "change <slot> to <valor>", valor pelado). El NLU real es un
//! colaborador enchufable; éste sólo cubre el contrato.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;

use soni_core::nlu::{FullUnderstanding, MessageType, NluContext, NluEngine, NluError, SlotAnswerKind,
                     SlotUnderstanding};
use soni_core::Message;
use soni_dsl::FlowDocument;

const CANCEL_WORDS: [&str; 5] = ["forget it", "cancel", "never mind", "nevermind", "stop it"];
const YES_WORDS: [&str; 7] = ["yes", "yeah", "yep", "sure", "go ahead", "confirm", "ok"];
const NO_WORDS: [&str; 4] = ["no", "nope", "don't", "do not"];

pub struct KeywordNlu {
    /// flow → frases de trigger en minúsculas.
    triggers: Vec<(String, Vec<String>)>,
}

impl KeywordNlu {
    pub fn from_document(document: &FlowDocument) -> Self {
        let triggers = document.flows
                               .iter()
                               .filter_map(|(name, def)| {
                                   let trigger = def.trigger.as_ref()?;
                                   let phrases = trigger.intents
                                                        .iter()
                                                        .map(|p| p.to_lowercase())
                                                        .collect::<Vec<_>>();
                                   Some((name.clone(), phrases))
                               })
                               .collect();
        Self { triggers }
    }

    /// Mejor flujo por solapamiento de palabras de trigger (>2 letras).
    fn match_flow(&self, lower: &str, available: &[String]) -> Option<(String, f64)> {
        let mut best: Option<(String, f64)> = None;
        for (flow, phrases) in &self.triggers {
            if !available.iter().any(|f| f == flow) {
                continue;
            }
            for phrase in phrases {
                let words: Vec<&str> = phrase.split_whitespace().filter(|w| w.len() > 2).collect();
                if words.is_empty() {
                    continue;
                }
                let hits = words.iter().filter(|w| lower.contains(**w)).count();
                let score = hits as f64 / words.len() as f64;
                if score >= 0.5 && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                    best = Some((flow.clone(), score));
                }
            }
        }
        best
    }
}

/// Extrae `from X to Y` (cada parte hasta la siguiente preposición).
fn extract_route(lower: &str) -> (Option<String>, Option<String>) {
    let words: Vec<&str> = lower.split_whitespace().collect();
    let mut origin: Option<String> = None;
    let mut destination: Option<String> = None;
    let mut i = 0;
    while i < words.len() {
        match words[i] {
            "from" => {
                let mut parts = Vec::new();
                let mut j = i + 1;
                while j < words.len() && words[j] != "to" && words[j] != "from" {
                    parts.push(words[j]);
                    j += 1;
                }
                if !parts.is_empty() {
                    origin = Some(capitalize(&parts.join(" ")));
                }
                i = j;
            }
            "to" => {
                let mut parts = Vec::new();
                let mut j = i + 1;
                while j < words.len() && words[j] != "from" && words[j] != "on" {
                    parts.push(words[j]);
                    j += 1;
                }
                if !parts.is_empty() {
                    destination = Some(capitalize(&parts.join(" ")));
                }
                i = j;
            }
            _ => i += 1,
        }
    }
    (origin, destination)
}

fn capitalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl NluEngine for KeywordNlu {
    async fn understand_full(&self,
                             message: &str,
                             _history: &[Message],
                             ctx: &NluContext)
                             -> Result<FullUnderstanding, NluError> {
        let lower = message.to_lowercase();
        let matched = self.match_flow(&lower, &ctx.available_flows);

        let mut slots: HashMap<String, Value> = HashMap::new();
        let (origin, destination) = extract_route(&lower);
        if let Some(origin) = origin {
            slots.insert("origin".to_string(), Value::String(origin));
        }
        if let Some(destination) = destination {
            slots.insert("destination".to_string(), Value::String(destination));
        }

        let (command, confidence) = match matched {
            Some((flow, score)) => (Some(flow), 0.6 + 0.4 * score),
            None => (None, 0.3),
        };
        let message_type = if command.is_some() {
            MessageType::Command
        } else if slots.is_empty() {
            MessageType::Unknown
        } else {
            MessageType::Information
        };

        Ok(FullUnderstanding { message_type,
                               command,
                               slots,
                               confidence,
                               reasoning: None })
    }

    async fn understand_slot(&self,
                             message: &str,
                             waiting_slot: &str,
                             ctx: &NluContext)
                             -> Result<SlotUnderstanding, NluError> {
        let lower = message.to_lowercase();
        let trimmed = message.trim();

        if CANCEL_WORDS.iter().any(|w| lower.contains(w)) {
            return Ok(SlotUnderstanding { kind: SlotAnswerKind::Cancellation,
                                          value: None,
                                          target_slot: None,
                                          confidence: 0.95 });
        }

        // "change <slot> to <valor>" — corrección explícita.
        if let Some(rest) = lower.strip_prefix("change ") {
            if let Some((slot, value)) = rest.split_once(" to ") {
                return Ok(SlotUnderstanding { kind: SlotAnswerKind::Correction,
                                              value: Some(Value::String(capitalize(value.trim()))),
                                              target_slot: Some(slot.trim().to_string()),
                                              confidence: 0.9 });
            }
        }

        // Cambio de intención: el mensaje dispara un trigger de flujo.
        if self.match_flow(&lower, &ctx.available_flows).is_some() {
            return Ok(SlotUnderstanding { kind: SlotAnswerKind::IntentChange,
                                          value: None,
                                          target_slot: None,
                                          confidence: 0.9 });
        }

        if waiting_slot == "_confirmation" {
            let word = lower.split_whitespace().next().unwrap_or_default();
            if YES_WORDS.contains(&word) || YES_WORDS.iter().any(|w| lower.starts_with(w)) {
                return Ok(SlotUnderstanding { kind: SlotAnswerKind::Confirmation,
                                              value: Some(Value::Bool(true)),
                                              target_slot: None,
                                              confidence: 0.95 });
            }
            if NO_WORDS.contains(&word) {
                return Ok(SlotUnderstanding { kind: SlotAnswerKind::Confirmation,
                                              value: Some(Value::Bool(false)),
                                              target_slot: None,
                                              confidence: 0.95 });
            }
            return Ok(SlotUnderstanding { kind: SlotAnswerKind::Clarification,
                                          value: None,
                                          target_slot: None,
                                          confidence: 0.7 });
        }

        // Valor pelado para el slot en espera; "from X"/"to X" se limpia.
        let (origin, destination) = extract_route(&lower);
        let value = match waiting_slot {
            "origin" => origin.unwrap_or_else(|| capitalize(trimmed)),
            "destination" => destination.unwrap_or_else(|| capitalize(trimmed)),
            _ => trimmed.to_string(),
        };
        Ok(SlotUnderstanding { kind: SlotAnswerKind::SlotValue,
                               value: Some(Value::String(value)),
                               target_slot: Some(waiting_slot.to_string()),
                               confidence: 0.8 })
    }

    async fn generate(&self, instruction: &str, _context: &Map<String, Value>) -> Result<String, NluError> {
        Ok(format!("[auto] {instruction}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(flows: &[&str]) -> NluContext {
        NluContext { available_flows: flows.iter().map(|f| f.to_string()).collect(),
                     expected_slots: vec![],
                     waiting_slot: None,
                     can_cancel: true,
                     language: None }
    }

    fn nlu() -> KeywordNlu {
        let doc = soni_dsl::parse_document(crate::TRAVEL_DOC).expect("doc");
        KeywordNlu::from_document(&doc)
    }

    #[tokio::test]
    async fn matches_trigger_and_extracts_route() {
        let nlu = nlu();
        let fu = nlu.understand_full("I need a flight from madrid to paris", &[], &ctx(&["book_flight", "help"]))
                    .await
                    .expect("understand");
        assert_eq!(fu.command.as_deref(), Some("book_flight"));
        assert_eq!(fu.slots.get("origin"), Some(&Value::String("Madrid".into())));
        assert_eq!(fu.slots.get("destination"), Some(&Value::String("Paris".into())));
    }

    #[tokio::test]
    async fn out_of_scope_message_has_no_command() {
        let nlu = nlu();
        let fu = nlu.understand_full("tell me a joke", &[], &ctx(&["book_flight"]))
                    .await
                    .expect("understand");
        assert_eq!(fu.command, None);
        assert!(fu.confidence < 0.5);
    }

    #[tokio::test]
    async fn slot_reply_classification() {
        let nlu = nlu();
        let su = nlu.understand_slot("Madrid", "origin", &ctx(&[])).await.expect("slot");
        assert_eq!(su.kind, SlotAnswerKind::SlotValue);
        assert_eq!(su.value, Some(Value::String("Madrid".into())));

        let su = nlu.understand_slot("forget it", "origin", &ctx(&[])).await.expect("slot");
        assert_eq!(su.kind, SlotAnswerKind::Cancellation);

        let su = nlu.understand_slot("yes please", "_confirmation", &ctx(&[])).await.expect("slot");
        assert_eq!(su.kind, SlotAnswerKind::Confirmation);
        assert_eq!(su.value, Some(Value::Bool(true)));

        let su = nlu.understand_slot("change destination to san diego", "_confirmation", &ctx(&[]))
                    .await
                    .expect("slot");
        assert_eq!(su.kind, SlotAnswerKind::Correction);
        assert_eq!(su.target_slot.as_deref(), Some("destination"));
        assert_eq!(su.value, Some(Value::String("San Diego".into())));
    }
}

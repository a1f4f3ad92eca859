//! Resolución de la sección `responses`.
//!
//! Cadena de resolución: idioma de sesión → idioma por defecto → `default`
//! pelado → primera traducción → nombre de la clave. Las variaciones rotan
//! de forma determinista con `turn_count` (reproducible en tests, sin RNG).

use soni_dsl::{FlowDocument, ResponseDef, ResponseEntry, Translation};

/// Resuelve una respuesta por clave. Devuelve siempre algo mostrable: en el
/// peor caso, la clave misma.
pub fn resolve_response(document: &FlowDocument, key: &str, language: Option<&str>, turn: u32) -> String {
    let Some(def) = document.responses.get(key) else {
        return key.to_string();
    };
    match def {
        ResponseDef::Text(text) => text.clone(),
        ResponseDef::Entry(entry) => resolve_entry(document, entry, language, turn).unwrap_or_else(|| key.to_string()),
    }
}

fn resolve_entry(document: &FlowDocument, entry: &ResponseEntry, language: Option<&str>, turn: u32) -> Option<String> {
    // 1. Idioma de la sesión.
    if let Some(lang) = language {
        if let Some(text) = from_translation(entry.translations.get(lang), turn) {
            return Some(text);
        }
    }
    // 2. Idioma por defecto del documento.
    let default_lang = document.settings.i18n.default_language.as_str();
    if Some(default_lang) != language {
        if let Some(text) = from_translation(entry.translations.get(default_lang), turn) {
            return Some(text);
        }
    }
    // 3. `default` / `variations` pelados.
    if let Some(text) = pick(entry.default.as_deref(), entry.variations.as_deref(), turn) {
        return Some(text);
    }
    // 4. Primera traducción disponible.
    entry.translations
         .values()
         .find_map(|t| from_translation(Some(t), turn))
}

fn from_translation(translation: Option<&Translation>, turn: u32) -> Option<String> {
    match translation? {
        Translation::Text(text) => Some(text.clone()),
        Translation::Entry { default, variations } => pick(default.as_deref(), variations.as_deref(), turn),
    }
}

/// Elección determinista: con variaciones, rota por número de turno; si no,
/// el default.
fn pick(default: Option<&str>, variations: Option<&[String]>, turn: u32) -> Option<String> {
    if let Some(variations) = variations {
        if !variations.is_empty() {
            return Some(variations[turn as usize % variations.len()].clone());
        }
    }
    default.map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use soni_dsl::parse_document;

    fn doc() -> FlowDocument {
        parse_document(r#"
version: "1"
settings:
  i18n:
    default_language: en
    supported_languages: [en, es]
responses:
  plain: "Hello"
  varied:
    variations: ["One", "Two", "Three"]
  translated:
    default: "Bye"
    es: "Adiós"
  only_translation:
    fr: "Bonjour"
flows:
  f:
    process:
      - step: s1
        type: say
        response: plain
"#).expect("parse")
    }

    #[test]
    fn plain_text_resolves_directly() {
        assert_eq!(resolve_response(&doc(), "plain", None, 0), "Hello");
    }

    #[test]
    fn variations_rotate_by_turn() {
        let d = doc();
        assert_eq!(resolve_response(&d, "varied", None, 0), "One");
        assert_eq!(resolve_response(&d, "varied", None, 1), "Two");
        assert_eq!(resolve_response(&d, "varied", None, 3), "One");
    }

    #[test]
    fn session_language_wins() {
        let d = doc();
        assert_eq!(resolve_response(&d, "translated", Some("es"), 0), "Adiós");
        assert_eq!(resolve_response(&d, "translated", Some("de"), 0), "Bye");
    }

    #[test]
    fn falls_back_to_first_translation() {
        assert_eq!(resolve_response(&doc(), "only_translation", None, 0), "Bonjour");
    }

    #[test]
    fn unknown_key_resolves_to_key_name() {
        assert_eq!(resolve_response(&doc(), "missing_key", None, 0), "missing_key");
    }
}

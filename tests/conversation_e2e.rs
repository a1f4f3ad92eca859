//! Conversación end-to-end con el documento de viajes y el NLU de palabras
//! clave: el mismo camino que recorre la demo, pero con aserciones.

use std::sync::Arc;

use soni::nlu::KeywordNlu;
use soni::{build_registries, load_demo_config};
use soni_core::{Event, InMemoryCheckpointer, Runtime};

fn runtime() -> Arc<Runtime<Arc<InMemoryCheckpointer>>> {
    let registries = build_registries();
    let config = load_demo_config(&registries);
    let nlu = Arc::new(KeywordNlu::from_document(&config.document));
    Arc::new(Runtime::new(config, Arc::new(InMemoryCheckpointer::new()), registries, nlu))
}

#[tokio::test]
async fn full_booking_conversation() {
    let rt = runtime();
    let user = "traveller";

    // El trigger arranca el flujo y la ruta llena origen/destino de una vez.
    let t1 = rt.process_turn(user, "I need a flight from Madrid to Paris").await.expect("turn 1");
    assert_eq!(t1.responses, vec!["When do you want to leave? (YYYY-MM-DD)".to_string()]);

    // Fecha válida: búsqueda + confirmación.
    let t2 = rt.process_turn(user, "2099-12-24").await.expect("turn 2");
    assert_eq!(t2.responses,
               vec!["Booking Madrid -> Paris on 2099-12-24. Shall I go ahead?".to_string()]);

    // Corrección durante la confirmación: se re-muestra con el valor nuevo.
    let t3 = rt.process_turn(user, "change destination to San Diego").await.expect("turn 3");
    assert_eq!(t3.responses,
               vec!["Booking Madrid -> San Diego on 2099-12-24. Shall I go ahead?".to_string()]);

    // Confirmación: reserva y éxito con la referencia interpolada.
    let t4 = rt.process_turn(user, "yes").await.expect("turn 4");
    assert_eq!(t4.responses,
               vec!["All done! Your booking reference is BK-2024-0042.".to_string()]);
}

#[tokio::test]
async fn invalid_date_reprompts_with_invalid_message() {
    let rt = runtime();
    let user = "u1";

    rt.process_turn(user, "book a flight from Madrid to Paris").await.expect("turn 1");
    let t2 = rt.process_turn(user, "someday soon").await.expect("turn 2");
    assert_eq!(t2.responses, vec!["I need a future date like 2026-12-24.".to_string()]);
}

#[tokio::test]
async fn cancellation_acknowledged_and_session_idle() {
    let rt = runtime();
    let user = "u2";

    rt.process_turn(user, "book a flight").await.expect("turn 1");
    let t2 = rt.process_turn(user, "forget it").await.expect("turn 2");
    assert_eq!(t2.responses.len(), 1);
    assert!(t2.responses[0].to_lowercase().contains("cancel"), "got {:?}", t2.responses);
}

#[tokio::test]
async fn streaming_turn_emits_messages_then_done() {
    let rt = runtime();
    let mut events = rt.stream_turn("u3", "I need a flight from Madrid to Paris");

    let mut messages = Vec::new();
    let mut done = false;
    while let Some(event) = events.recv().await {
        match event {
            Event::Message(text) => messages.push(text),
            Event::Done => {
                done = true;
                break;
            }
            Event::Token(_) | Event::Handoff(_) => {}
            Event::Error(e) => panic!("unexpected error event: {e}"),
        }
    }
    assert!(done);
    assert_eq!(messages, vec!["When do you want to leave? (YYYY-MM-DD)".to_string()]);
}

#[tokio::test]
async fn spanish_session_uses_translations() {
    let registries = build_registries();
    let config = load_demo_config(&registries);
    let nlu = Arc::new(KeywordNlu::from_document(&config.document));
    let rt = Runtime::new(config, Arc::new(InMemoryCheckpointer::new()), registries, nlu);

    let opened = rt.start_session("es-user", Some("es")).await.expect("start session");
    // Sin default_flow el arranque no produce mensajes, sólo fija idioma.
    assert!(opened.responses.is_empty());

    rt.process_turn("es-user", "I need a flight from Madrid to Paris").await.expect("turn 1");
    rt.process_turn("es-user", "2099-12-24").await.expect("turn 2");
    let t3 = rt.process_turn("es-user", "yes").await.expect("turn 3");
    assert_eq!(t3.responses,
               vec!["¡Listo! Tu referencia de reserva es BK-2024-0042.".to_string()]);
}

#[tokio::test]
async fn out_of_scope_falls_back_to_help_flow() {
    let rt = runtime();
    let t1 = rt.process_turn("u4", "tell me a joke").await.expect("turn");
    assert_eq!(t1.responses, vec!["I can only help with flight bookings.".to_string()]);

    let state_tag_changes = rt.process_turn("u4", "tell me another joke").await.expect("turn 2");
    assert!(!state_tag_changes.state_tag.is_empty());
}

#[tokio::test]
async fn conversation_state_is_idle_after_completed_booking() {
    let rt = runtime();
    let user = "u5";
    rt.process_turn(user, "book a flight from Madrid to Paris").await.expect("t1");
    rt.process_turn(user, "2099-12-24").await.expect("t2");
    rt.process_turn(user, "yes").await.expect("t3");

    // Un turno posterior arranca de cero sin arrastrar estado del flujo.
    let t4 = rt.process_turn(user, "I need a flight from Lisbon to Rome").await.expect("t4");
    assert_eq!(t4.responses, vec!["When do you want to leave? (YYYY-MM-DD)".to_string()]);
}

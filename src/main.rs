//! Demo de conversación end-to-end sobre el runtime.
//!
//! Ejecuta una reserva de vuelo completa contra el documento
//! `demos/travel.yaml` con el NLU de palabras clave, mostrando el streaming
//! de eventos del último turno. Backend de checkpoints según
//! `settings.persistence.backend` (`memory` | `sqlite`).

use std::sync::Arc;

use soni::nlu::KeywordNlu;
use soni::{build_registries, load_demo_config};
use soni_core::{Checkpointer, Event, InMemoryCheckpointer, Runtime};
use soni_persistence::{database_path_from_env, SqliteCheckpointer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let registries = build_registries();
    let config = load_demo_config(&registries);
    let nlu = Arc::new(KeywordNlu::from_document(&config.document));

    let backend = config.document.settings.persistence.backend.clone();
    match backend.as_str() {
        "sqlite" => {
            let path = database_path_from_env();
            let checkpointer = SqliteCheckpointer::open(path).expect("open sqlite checkpointer");
            println!("== persistencia: sqlite ({path}) ==");
            run_demo(Runtime::new(config, checkpointer, registries, nlu)).await;
        }
        _ => {
            println!("== persistencia: memoria ==");
            run_demo(Runtime::new(config, InMemoryCheckpointer::new(), registries, nlu)).await;
        }
    }
}

async fn run_demo<C: Checkpointer + 'static>(runtime: Runtime<C>) {
    let runtime = Arc::new(runtime);
    let user = "demo-user";

    let turns = ["I need a flight from Madrid to Paris",
                 "2099-12-24",
                 "change destination to San Diego"];

    for text in turns {
        println!("\nuser> {text}");
        match runtime.process_turn(user, text).await {
            Ok(outcome) => {
                for response in &outcome.responses {
                    println!("soni> {response}");
                }
            }
            Err(e) => {
                eprintln!("turn failed: {e}");
                return;
            }
        }
    }

    // Último turno por el canal de streaming.
    println!("\nuser> yes");
    let mut events = Arc::clone(&runtime).stream_turn(user, "yes");
    while let Some(event) = events.recv().await {
        match event {
            Event::Token(token) => print!("{token}"),
            Event::Message(text) => println!("soni> {text}"),
            Event::Handoff(signal) => println!("[handoff -> {}]", signal.queue),
            Event::Error(e) => eprintln!("[error] {e}"),
            Event::Done => break,
        }
    }

    // Limpieza de sesiones inactivas (no debería tocar la recién usada).
    let swept = runtime.sweep_expired(chrono::Utc::now()).await.unwrap_or(0);
    println!("\n[sessions swept: {swept}]");
}

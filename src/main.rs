//! Conversa line server
//!
//! Reads one JSON envelope per line from stdin,
//! `{"request": {...}, "event": {...}}`, and writes one JSON outcome per line
//! to stdout. Events are handled concurrently; outcomes carry the event id.

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use conversa::{
    config::Settings,
    models::{InboundEvent, RequestDescriptor},
    services::{ConversationOrchestrator, ServiceFactory},
    state::LoggingNotifier,
    utils::logging,
};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    request: RequestDescriptor,
    event: InboundEvent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let settings = Settings::new().context("loading settings")?;
    settings.validate()?;

    // Initialize logging
    let _log_guard = logging::init_logging(&settings.logging)?;

    info!("Starting {}...", conversa::info());

    let mut services = ServiceFactory::new(&settings).await?;
    services.start_sweeper(Some(Arc::new(LoggingNotifier)));

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                error!(error = %e, "Failed to write outcome");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    info!("Conversa is ready, reading events from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let orchestrator = Arc::clone(&services.orchestrator);
                let out_tx = out_tx.clone();
                in_flight.spawn(async move {
                    let output = handle_line(&orchestrator, &line).await;
                    if out_tx.send(output).await.is_err() {
                        warn!("Outcome writer stopped");
                    }
                });
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Event task failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Event task failed");
        }
    }
    drop(out_tx);
    writer.await.context("joining outcome writer")?;

    services.shutdown().await;
    info!("Conversa has been shut down.");

    Ok(())
}

async fn handle_line(orchestrator: &ConversationOrchestrator, line: &str) -> String {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed event envelope");
            return error_line("invalid_input", &e.to_string());
        }
    };

    match orchestrator.handle(&envelope.request, &envelope.event).await {
        Ok(outcome) => serde_json::to_string(&outcome).unwrap_or_else(|e| error_line("serialization", &e.to_string())),
        Err(e) => {
            error!(user_id = %envelope.event.sender_id, error = %e, severity = %e.severity(), "Event rejected");
            error_line(e.code(), &e.to_string())
        }
    }
}

fn error_line(code: &str, message: &str) -> String {
    serde_json::json!({
        "status": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

#![allow(dead_code)]

pub mod greeter;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// One parsed `text/event-stream` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Parse SSE framing: events separated by blank lines, comment lines
/// ignored.
pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    for block in text.split("\n\n") {
        let mut event = SseEvent::default();
        let mut saw_field = false;
        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("id: ") {
                event.id = Some(value.to_string());
                saw_field = true;
            } else if let Some(value) = line.strip_prefix("event: ") {
                event.event = Some(value.to_string());
                saw_field = true;
            } else if let Some(value) = line.strip_prefix("data: ") {
                event.data.push_str(value);
                saw_field = true;
            }
        }
        if saw_field {
            events.push(event);
        }
    }
    events
}

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

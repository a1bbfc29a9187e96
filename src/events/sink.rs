//! Concrete telemetry transport: an SSE-compatible line writer over any
//! `tokio::io::AsyncWrite`. The bus itself (batching, replay, subscription) is transport-
//! agnostic; this is the one demonstration sink, additional transports being a Non-goal.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::bus::Subscription;
use super::types::EventEnvelope;

/// One SSE frame: `data: <json envelope>\n\n`.
#[must_use]
pub fn format_sse_frame(envelope: &EventEnvelope) -> String {
    let body = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    format!("data: {body}\n\n")
}

/// Drain `subscription` and write each envelope as an SSE frame to `writer`, flushing
/// after every frame so a tailing reader sees events promptly. Returns once the
/// subscription's underlying channel closes (bus dropped).
pub async fn run_sse_sink<W: AsyncWrite + Unpin>(
    mut subscription: Subscription,
    mut writer: W,
) -> std::io::Result<()> {
    while let Some(envelope) = subscription.recv().await {
        match serde_json::to_string(&envelope) {
            Ok(_) => {
                writer
                    .write_all(format_sse_frame(&envelope).as_bytes())
                    .await?;
                writer.flush().await?;
            }
            Err(err) => warn!(%err, "failed to serialize telemetry envelope"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventBusConfig, EventDraft, EventType};

    #[tokio::test]
    async fn formats_one_sse_frame_per_event() {
        let bus = EventBus::new(EventBusConfig::default());
        let mut subscription = bus.subscribe();
        bus.publish(EventDraft::new(EventType::CrawlStarted, "job-1", "basic"));

        let envelope = subscription.recv().await.expect("replayed event");
        let frame = format_sse_frame(&envelope);

        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"crawl:started\""));
        assert!(frame.contains("\"job-1\""));
    }

    #[tokio::test]
    async fn run_sse_sink_stops_when_bus_is_dropped() {
        let bus = EventBus::new(EventBusConfig::default());
        let subscription = bus.subscribe();
        bus.publish(EventDraft::new(EventType::CrawlStarted, "job-1", "basic"));
        drop(bus);

        let handle = tokio::spawn(async move {
            let mut out: Vec<u8> = Vec::new();
            run_sse_sink(subscription, &mut out).await.unwrap();
            out
        });
        let out = handle.await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"crawl:started\""));
    }
}

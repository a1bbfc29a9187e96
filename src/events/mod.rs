//! Telemetry bridge: turns engine events into a bounded, batched, replayable
//! broadcast stream consumed by CLI/SSE/test subscribers.

pub mod bus;
pub mod sink;
pub mod types;

pub use bus::{EventBus, EventBusConfig, Subscription};
pub use sink::{format_sse_frame, run_sse_sink};
pub use types::{CrawlPhase, EventDraft, EventEnvelope, EventType, Severity, SCHEMA_VERSION};

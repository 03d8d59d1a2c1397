//! Event handler seam.
//!
//! The ingest pipeline delivers events to whatever implements
//! [`EventSink`]; in production that is the curator, in tests a recording
//! stub.

use async_trait::async_trait;

use crate::event::Event;

/// Receiver of ingested events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one event from the given source relay URL.
    ///
    /// Errors are the handler's own business; the pipeline logs and moves
    /// on.
    async fn handle_event(&self, source: &str, event: Event) -> anyhow::Result<()>;
}

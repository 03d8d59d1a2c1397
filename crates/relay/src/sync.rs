//! Bidirectional event replication.
//!
//! Two passes per peer: pull stored events matching the requested kinds
//! since a watermark, feeding each into the event handler; then push the
//! local event set. Per-relay and per-event failures are tolerated and
//! counted, never fatal.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use protocol::event::Event;
use protocol::filter::Filter;
use protocol::messages::{ClientMessage, RelayMessage};
use protocol::sink::EventSink;

use crate::client::{self, RelayConnection};

/// Deadline for one inbound catch-up pass per relay.
pub const INBOUND_DEADLINE: Duration = Duration::from_secs(300);

/// Deadline for pushing the local set to one relay.
pub const OUTBOUND_DEADLINE: Duration = Duration::from_secs(120);

/// Counters from one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Events pulled in and handed to the handler
    pub pulled: usize,
    /// Events accepted by peers on the push pass
    pub pushed: usize,
    /// Relays whose pull pass failed
    pub pull_failures: usize,
    /// Events that could not be pushed (summed over relays)
    pub push_failures: usize,
}

/// Replicate events both ways with every peer in `urls`.
pub async fn bidirectional_sync(
    urls: &[String],
    kinds: &[u32],
    since: i64,
    local_events: &[Event],
    handler: &Arc<dyn EventSink>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let filter = Filter::new().kinds(kinds.to_vec()).since(since);

    // Pass 1: pull from every peer until end-of-stored-events.
    for url in urls {
        match client::fetch_events(url, vec![filter.clone()], INBOUND_DEADLINE).await {
            Ok(events) => {
                debug!("Pulled {} events from {}", events.len(), url);
                for event in events {
                    report.pulled += 1;
                    if let Err(e) = handler.handle_event(url, event).await {
                        warn!("Handler failed on event from {}: {}", url, e);
                    }
                }
            }
            Err(e) => {
                warn!("Pull from {} failed: {}", url, e);
                report.pull_failures += 1;
            }
        }
    }

    // Pass 2: push the local set to every peer.
    for url in urls {
        match push_events(url, local_events).await {
            Ok((pushed, failed)) => {
                report.pushed += pushed;
                report.push_failures += failed;
            }
            Err(e) => {
                warn!("Push to {} failed: {}", url, e);
                report.push_failures += local_events.len();
            }
        }
    }

    info!(
        pulled = report.pulled,
        pushed = report.pushed,
        pull_failures = report.pull_failures,
        push_failures = report.push_failures,
        "Bidirectional sync finished"
    );
    report
}

/// Push a batch of events over one connection, counting OK replies.
async fn push_events(url: &str, events: &[Event]) -> anyhow::Result<(usize, usize)> {
    if events.is_empty() {
        return Ok((0, 0));
    }

    let outcome = tokio::time::timeout(OUTBOUND_DEADLINE, async {
        let mut connection = RelayConnection::connect(url).await?;
        let mut pushed = 0usize;
        let mut failed = 0usize;

        for event in events {
            if let Err(e) = connection
                .send(&ClientMessage::Event(Box::new(event.clone())))
                .await
            {
                warn!("Send to {} failed: {}", url, e);
                failed += events.len() - pushed - failed;
                return Ok::<(usize, usize), shared::error::AppError>((pushed, failed));
            }

            // Wait for this event's OK before sending the next.
            loop {
                match connection.next_message().await? {
                    Some(RelayMessage::Ok {
                        event_id, accepted, ..
                    }) if event_id == event.id => {
                        if accepted {
                            pushed += 1;
                        } else {
                            failed += 1;
                        }
                        break;
                    }
                    Some(_) => continue,
                    None => {
                        failed += events.len() - pushed - failed;
                        return Ok((pushed, failed));
                    }
                }
            }
        }

        connection.close().await;
        Ok((pushed, failed))
    })
    .await;

    match outcome {
        Ok(result) => Ok(result?),
        Err(_) => anyhow::bail!("{}: push deadline exceeded", url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingSink {
        seen: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn handle_event(&self, _source: &str, event: Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sync_with_unreachable_peers_counts_failures() {
        let handler: Arc<dyn EventSink> = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let local = vec![protocol::identity::Keys::generate()
            .sign(2003, vec![], String::new(), 1_700_000_000)
            .unwrap()];

        let report = bidirectional_sync(
            &["ws://127.0.0.1:1".to_string()],
            &[2003],
            0,
            &local,
            &handler,
        )
        .await;

        assert_eq!(report.pulled, 0);
        assert_eq!(report.pull_failures, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(report.push_failures, 1);
    }

    #[tokio::test]
    async fn test_sync_with_no_peers_is_empty() {
        let handler: Arc<dyn EventSink> = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let report = bidirectional_sync(&[], &[2003], 0, &[], &handler).await;
        assert_eq!(report, SyncReport::default());
    }
}

//! Standalone WebSocket client helpers.
//!
//! One-shot connections used by discovery and sync: fetch stored events
//! until EOSE, or publish a batch of events and read the OK replies. The
//! long-lived per-relay connections live in [`crate::pool`].

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use uuid::Uuid;

use protocol::event::Event;
use protocol::filter::Filter;
use protocol::messages::{ClientMessage, RelayMessage};
use shared::error::{AppError, AppResult};

/// A single client connection to a remote relay.
pub struct RelayConnection {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayConnection {
    /// Connect to a relay URL.
    pub async fn connect(url: &str) -> AppResult<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| AppError::RelayUnavailable(format!("{}: {}", url, e)))?;

        Ok(Self {
            url: url.to_string(),
            stream,
        })
    }

    /// URL this connection is attached to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one client frame.
    pub async fn send(&mut self, message: &ClientMessage) -> AppResult<()> {
        let frame = message.to_json()?;
        self.stream
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| AppError::RelayUnavailable(format!("{}: {}", self.url, e)))
    }

    /// Next relay frame, skipping pings and undecodable messages.
    /// `None` when the connection closed.
    pub async fn next_message(&mut self) -> AppResult<Option<RelayMessage>> {
        while let Some(frame) = self.stream.next().await {
            let frame =
                frame.map_err(|e| AppError::RelayUnavailable(format!("{}: {}", self.url, e)))?;
            match frame {
                WsMessage::Text(text) => match RelayMessage::from_json(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => debug!("Undecodable frame from {}: {}", self.url, e),
                },
                WsMessage::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Subscribe with the given filters and collect stored events until EOSE.
pub async fn fetch_events(
    url: &str,
    filters: Vec<Filter>,
    deadline: Duration,
) -> AppResult<Vec<Event>> {
    let result = tokio::time::timeout(deadline, async {
        let mut connection = RelayConnection::connect(url).await?;
        let subscription_id = Uuid::new_v4().to_string();

        connection
            .send(&ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters,
            })
            .await?;

        let mut events = Vec::new();
        while let Some(message) = connection.next_message().await? {
            match message {
                RelayMessage::Event {
                    subscription_id: sub,
                    event,
                } if sub == subscription_id => events.push(*event),
                RelayMessage::Eose {
                    subscription_id: sub,
                } if sub == subscription_id => break,
                _ => {}
            }
        }

        connection
            .send(&ClientMessage::Close {
                subscription_id: subscription_id.clone(),
            })
            .await
            .ok();
        connection.close().await;
        Ok(events)
    })
    .await;

    match result {
        Ok(events) => events,
        Err(_) => Err(AppError::RelayUnavailable(format!(
            "{}: fetch deadline exceeded",
            url
        ))),
    }
}

/// Publish one event and wait for the relay's OK. Returns the acceptance
/// flag and reason.
pub async fn publish_event(
    url: &str,
    event: &Event,
    deadline: Duration,
) -> AppResult<(bool, String)> {
    let result = tokio::time::timeout(deadline, async {
        let mut connection = RelayConnection::connect(url).await?;
        connection
            .send(&ClientMessage::Event(Box::new(event.clone())))
            .await?;

        while let Some(message) = connection.next_message().await? {
            if let RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } = message
            {
                if event_id == event.id {
                    connection.close().await;
                    return Ok((accepted, message));
                }
            }
        }

        Err(AppError::RelayUnavailable(format!(
            "{}: connection closed before OK",
            url
        )))
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(AppError::RelayUnavailable(format!(
            "{}: publish deadline exceeded",
            url
        ))),
    }
}

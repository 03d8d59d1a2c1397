//! WebSocket message framing.
//!
//! Every frame is a JSON array whose first element is a string tag.
//! Clients send `EVENT`, `REQ`, and `CLOSE`; relays send `EVENT`, `OK`,
//! `EOSE`, and `NOTICE`.

use serde_json::{json, Value};

use shared::error::ProtocolError;

use crate::event::Event;
use crate::filter::Filter;

/// Frames sent by a client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Submit an event for admission
    Event(Box<Event>),
    /// Open a subscription with one or more filters
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Close a subscription
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(
                        serde_json::to_value(filter)
                            .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
                    );
                }
                Value::Array(frame)
            }
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };

        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a frame received from a client.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let frame = value
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedFrame("not a JSON array".to_string()))?;

        let tag = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame("missing frame tag".to_string()))?;

        match tag {
            "EVENT" => {
                let event = frame
                    .get(1)
                    .cloned()
                    .ok_or_else(|| ProtocolError::MalformedFrame("EVENT missing body".to_string()))?;
                let event: Event = serde_json::from_value(event)
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
                Ok(Self::Event(Box::new(event)))
            }
            "REQ" => {
                let subscription_id = frame
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("REQ missing subscription id".to_string())
                    })?
                    .to_string();
                let mut filters = Vec::new();
                for raw_filter in &frame[2..] {
                    filters.push(
                        serde_json::from_value(raw_filter.clone())
                            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?,
                    );
                }
                if filters.is_empty() {
                    filters.push(Filter::new());
                }
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                let subscription_id = frame
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("CLOSE missing subscription id".to_string())
                    })?
                    .to_string();
                Ok(Self::Close { subscription_id })
            }
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown frame tag: {}",
                other
            ))),
        }
    }
}

/// Frames sent by a relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// An event matching a subscription
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// Result of an EVENT submission
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// End of stored events for a subscription
    Eose { subscription_id: String },
    /// Human-readable notice
    Notice { message: String },
}

impl RelayMessage {
    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            Self::Notice { message } => json!(["NOTICE", message]),
        };

        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a frame received from a relay.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let frame = value
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedFrame("not a JSON array".to_string()))?;

        let tag = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame("missing frame tag".to_string()))?;

        match tag {
            "EVENT" => {
                let subscription_id = frame
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("EVENT missing subscription id".to_string())
                    })?
                    .to_string();
                let event = frame.get(2).cloned().ok_or_else(|| {
                    ProtocolError::MalformedFrame("EVENT missing body".to_string())
                })?;
                let event: Event = serde_json::from_value(event)
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => Ok(Self::Ok {
                event_id: frame
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "EOSE" => Ok(Self::Eose {
                subscription_id: frame
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("EOSE missing subscription id".to_string())
                    })?
                    .to_string(),
            }),
            "NOTICE" => Ok(Self::Notice {
                message: frame
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown frame tag: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;

    #[test]
    fn test_event_frame_round_trip() {
        let event = Keys::generate()
            .sign(2003, vec![], "body".to_string(), 1_700_000_000)
            .unwrap();

        let frame = ClientMessage::Event(Box::new(event)).to_json().unwrap();
        assert!(frame.starts_with("[\"EVENT\","));

        let parsed = ClientMessage::from_json(&frame).unwrap();
        match parsed {
            ClientMessage::Event(e) => e.verify().unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_req_frame_round_trip() {
        let msg = ClientMessage::Req {
            subscription_id: "sub-1".to_string(),
            filters: vec![Filter::new().kinds(vec![2003]).since(100)],
        };
        let frame = msg.to_json().unwrap();
        let parsed = ClientMessage::from_json(&frame).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_req_without_filters_gets_default() {
        let parsed = ClientMessage::from_json(r#"["REQ","sub-2"]"#).unwrap();
        match parsed {
            ClientMessage::Req { filters, .. } => assert_eq!(filters, vec![Filter::new()]),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_ok_frame_round_trip() {
        let msg = RelayMessage::Ok {
            event_id: "abc".to_string(),
            accepted: false,
            message: "blocked: pubkey".to_string(),
        };
        let frame = msg.to_json().unwrap();
        assert_eq!(frame, r#"["OK","abc",false,"blocked: pubkey"]"#);
        assert_eq!(RelayMessage::from_json(&frame).unwrap(), msg);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(ClientMessage::from_json("{}").is_err());
        assert!(ClientMessage::from_json(r#"["WHAT","x"]"#).is_err());
        assert!(ClientMessage::from_json(r#"["EVENT"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EOSE"]"#).is_err());
    }
}

//! Wire protocol for the Beacon federation.
//!
//! Events are pubkey-signed, kind-tagged JSON records exchanged over
//! WebSocket relays. This crate carries the event model and its canonical
//! signing form, the instance identity, subscription filters, the JSON-array
//! message framing, and the persistent event store.

pub mod event;
pub mod filter;
pub mod identity;
pub mod kinds;
pub mod messages;
pub mod sink;
pub mod store;

pub use event::{Event, TagName};
pub use sink::EventSink;
pub use filter::Filter;
pub use identity::Keys;
pub use messages::{ClientMessage, RelayMessage};
pub use store::EventStore;

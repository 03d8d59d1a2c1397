//! Relay plumbing: outbound client pool, inbound relay server, peer
//! discovery, and bidirectional replication.

pub mod admission;
pub mod client;
pub mod discovery;
pub mod pool;
pub mod server;
pub mod sync;

pub use admission::{AdmissionConfig, AdmissionVerdict, TorrentAdmissionPolicy};
pub use discovery::{DiscoveredRelay, Discovery, DiscoveryConfig, RelayInfo};
pub use pool::{ConnectionState, EventIngest, RelayPool, RelayPoolConfig};
pub use server::{RelayMode, RelayServer, RelayServerConfig};
pub use sync::{bidirectional_sync, SyncReport};

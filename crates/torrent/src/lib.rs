//! Torrent metadata records.
//!
//! A [`record::TorrentRecord`] is the immutable, typed view of a torrent
//! announcement event. The record is derived once at ingest and never
//! mutated; the ruleset engine evaluates against it.

pub mod record;
pub mod score;

pub use record::{DeriveError, TorrentFile, TorrentRecord};
pub use score::{metadata_score, metadata_score_for_fields};

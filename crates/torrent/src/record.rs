//! Torrent record derivation.
//!
//! A kind-2003 announcement carries its metadata in tags; the record pulls
//! the closed set of recognized tags into typed fields and preserves the
//! originating event id. Derivation is strict: a missing infohash, name,
//! or external id fails the whole record.

use serde::{Deserialize, Serialize};

use protocol::event::{Event, TagName};
use protocol::kinds;
use shared::types::normalize_infohash;

/// One file inside a torrent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub path: String,
    pub size: u64,
}

/// Typed view of a torrent announcement. Never mutated after derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    /// 40-hex lowercase infohash
    pub infohash: String,

    /// Display name
    pub name: String,

    /// Optional release title distinct from the name
    pub title: Option<String>,

    /// Payload size in bytes
    pub size: u64,

    /// Torznab category code
    pub category: Option<u32>,

    /// Free-form labels (`t` tags)
    pub labels: Vec<String>,

    /// File listing
    pub files: Vec<TorrentFile>,

    /// Uploader pubkey (= event author)
    pub uploader: String,

    /// External ids, e.g. `imdb:tt0000001`
    pub external_ids: Vec<String>,

    /// Release year
    pub year: Option<u32>,

    /// Long description (= event content)
    pub overview: Option<String>,

    /// Originating event id
    pub event_id: String,
}

/// Why a record could not be derived from an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeriveError {
    #[error("event kind {0} is not a torrent announcement")]
    WrongKind(u32),

    #[error("missing or invalid infohash tag")]
    MissingInfohash,

    #[error("missing name tag")]
    MissingName,

    #[error("missing external id tag")]
    MissingExternalId,
}

impl TorrentRecord {
    /// Derive a record from a torrent announcement event.
    pub fn from_event(event: &Event) -> Result<Self, DeriveError> {
        if event.kind != kinds::TORRENT {
            return Err(DeriveError::WrongKind(event.kind));
        }

        let infohash = TagName::Infohash
            .value(event)
            .and_then(|raw| normalize_infohash(raw).ok())
            .ok_or(DeriveError::MissingInfohash)?;

        let name = TagName::Name
            .value(event)
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .ok_or(DeriveError::MissingName)?;

        let external_ids: Vec<String> = event
            .tag_values("i")
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if external_ids.is_empty() {
            return Err(DeriveError::MissingExternalId);
        }

        // `title` only when it differs from the resolved name.
        let title = event
            .tag_value("title")
            .filter(|t| *t != name)
            .map(str::to_string);

        let size = TagName::Size
            .value(event)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let category = TagName::Category
            .value(event)
            .and_then(|c| c.parse::<u32>().ok());

        let year = TagName::Year
            .value(event)
            .and_then(|y| y.parse::<u32>().ok());

        let mut labels: Vec<String> = event
            .tag_values("t")
            .into_iter()
            .map(|l| l.to_lowercase())
            .collect();
        labels.sort();
        labels.dedup();

        let files = event
            .tags_named("file")
            .into_iter()
            .filter_map(|tag| {
                let path = tag.get(1)?.clone();
                let size = tag.get(2).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
                Some(TorrentFile { path, size })
            })
            .collect();

        let overview = if event.content.trim().is_empty() {
            None
        } else {
            Some(event.content.clone())
        };

        Ok(Self {
            infohash,
            name,
            title,
            size,
            category,
            labels,
            files,
            uploader: event.pubkey.clone(),
            external_ids,
            year,
            overview,
            event_id: event.id.clone(),
        })
    }
}

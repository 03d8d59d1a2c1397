//! Subscription filters.
//!
//! A filter selects events by id prefix, author prefix, kind, time window,
//! and tag constraints. Tag constraints arrive as `#<name>` keys whose value
//! is the set of accepted tag values. The same filter drives both the
//! stored-event query and live broadcast matching.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::event::Event;

/// Default and maximum number of events returned for one filter.
pub const DEFAULT_LIMIT: usize = 500;

/// Event selection criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event id prefixes (full ids or hex prefixes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey prefixes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Accepted kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    /// Inclusive lower bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Inclusive upper bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    /// Maximum results; capped at [`DEFAULT_LIMIT`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// `#<name>` tag constraints; other flattened keys are ignored
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Filter {
    /// New empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Restrict to events at or after the given time.
    pub fn since(mut self, ts: i64) -> Self {
        self.since = Some(ts);
        self
    }

    /// Restrict to events at or before the given time.
    pub fn until(mut self, ts: i64) -> Self {
        self.until = Some(ts);
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add a `#<name>` tag constraint.
    pub fn tag(mut self, name: &str, values: Vec<String>) -> Self {
        self.extra.insert(
            format!("#{}", name),
            serde_json::Value::Array(
                values.into_iter().map(serde_json::Value::String).collect(),
            ),
        );
        self
    }

    /// Effective result limit for this filter.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(DEFAULT_LIMIT)
    }

    /// Tag constraints as (tag name, accepted values) pairs.
    pub fn tag_constraints(&self) -> Vec<(&str, Vec<&str>)> {
        self.extra
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix('#')?;
                let values = value
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>();
                Some((name, values))
            })
            .collect()
    }

    /// Whether an event satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !prefix_match(ids, &event.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !prefix_match(authors, &event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        for (name, values) in self.tag_constraints() {
            let event_values = event.tag_values(name);
            if !values.iter().any(|v| event_values.contains(v)) {
                return false;
            }
        }

        true
    }
}

fn prefix_match(prefixes: &[String], value: &str) -> bool {
    prefixes
        .iter()
        .any(|p| !p.is_empty() && value.starts_with(p.as_str()))
}

//! Metadata quality scoring.
//!
//! A record's quality is a weighted presence score over its fields,
//! normalized to 0..1. The weights total 100:
//! name 15, size 15, category 10, title 10, year 5, external id 10,
//! overview 10, tags 5, files 20.

use crate::record::TorrentRecord;

const WEIGHTS: [(&str, u32); 9] = [
    ("name", 15),
    ("size", 15),
    ("category", 10),
    ("title", 10),
    ("year", 5),
    ("external_id", 10),
    ("overview", 10),
    ("tags", 5),
    ("files", 20),
];

fn field_present(record: &TorrentRecord, field: &str) -> bool {
    match field {
        "name" => !record.name.trim().is_empty(),
        "size" => record.size > 0,
        "category" => record.category.is_some(),
        "title" => record.title.as_deref().is_some_and(|t| !t.trim().is_empty()),
        "year" => record.year.is_some(),
        "external_id" => !record.external_ids.is_empty(),
        "overview" => record.overview.is_some(),
        "tags" => !record.labels.is_empty(),
        "files" => !record.files.is_empty(),
        _ => false,
    }
}

/// Quality score over all weighted fields, 0..1.
pub fn metadata_score(record: &TorrentRecord) -> f64 {
    let present: u32 = WEIGHTS
        .iter()
        .filter(|(field, _)| field_present(record, field))
        .map(|(_, weight)| weight)
        .sum();
    f64::from(present) / 100.0
}

/// Quality score restricted to the given fields, 0..1.
///
/// Unknown field names carry zero weight. Returns 1.0 for an empty or
/// all-unknown field list (nothing was required, nothing is missing).
pub fn metadata_score_for_fields(record: &TorrentRecord, fields: &[String]) -> f64 {
    let mut total = 0u32;
    let mut present = 0u32;

    for (field, weight) in WEIGHTS {
        if !fields.iter().any(|f| f == field) {
            continue;
        }
        total += weight;
        if field_present(record, field) {
            present += weight;
        }
    }

    if total == 0 {
        return 1.0;
    }
    f64::from(present) / f64::from(total)
}

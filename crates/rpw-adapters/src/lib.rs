//! Source column-map specs + row normalization into canonical candidates.
//!
//! Each fetcher hands over its native rows (JSON objects, or a TSV dump split
//! via [`rows_from_tsv`]); the normalizer projects them into
//! [`CandidateRecord`] before anything reaches the reconciliation engine.

use chrono::NaiveDate;
use rpw_core::CandidateRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "rpw-adapters";

/// The three upstream source families RPW tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    MetadataApi,
    ArchiveTsv,
    PublisherSite,
}

/// Native column names for one source, keyed to the canonical shape.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMap {
    pub id: &'static str,
    pub title: &'static str,
    pub authors: &'static str,
    pub publication_date: &'static str,
    pub abstract_text: &'static str,
    pub journal: &'static str,
    pub doi_or_url: &'static str,
}

/// A source's normalization contract: column map plus the id namespace
/// prefix that keeps identifiers from colliding across sources.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub source_id: &'static str,
    pub kind: SourceKind,
    pub id_prefix: &'static str,
    pub columns: ColumnMap,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("source {source_id}: row {row_index}: required field `{field}` is missing or empty")]
    MissingField {
        source_id: String,
        field: &'static str,
        row_index: usize,
    },
    #[error("source {source_id}: row {row_index}: field `{field}` is malformed: {reason}")]
    MalformedField {
        source_id: String,
        field: &'static str,
        row_index: usize,
        reason: String,
    },
}

/// Scholarly-metadata API rows (JSON, author objects, date-parts arrays).
pub fn metadata_api_spec() -> SourceSpec {
    SourceSpec {
        source_id: "crossref",
        kind: SourceKind::MetadataApi,
        id_prefix: "crossref",
        columns: ColumnMap {
            id: "DOI",
            title: "title",
            authors: "author",
            publication_date: "issued",
            abstract_text: "abstract",
            journal: "container-title",
            doi_or_url: "URL",
        },
    }
}

/// Working-paper archive TSV dumps (flat string columns).
pub fn archive_tsv_spec() -> SourceSpec {
    SourceSpec {
        source_id: "repec",
        kind: SourceKind::ArchiveTsv,
        id_prefix: "repec",
        columns: ColumnMap {
            id: "handle",
            title: "title",
            authors: "authors",
            publication_date: "creation_date",
            abstract_text: "abstract",
            journal: "series",
            doi_or_url: "url",
        },
    }
}

/// Scraped publisher site rows (flat, produced by the external scraper).
pub fn publisher_site_spec() -> SourceSpec {
    SourceSpec {
        source_id: "pubsite",
        kind: SourceKind::PublisherSite,
        id_prefix: "pubsite",
        columns: ColumnMap {
            id: "article_id",
            title: "title",
            authors: "authors",
            publication_date: "published",
            abstract_text: "summary",
            journal: "journal",
            doi_or_url: "link",
        },
    }
}

pub fn spec_for_kind(kind: SourceKind) -> SourceSpec {
    match kind {
        SourceKind::MetadataApi => metadata_api_spec(),
        SourceKind::ArchiveTsv => archive_tsv_spec(),
        SourceKind::PublisherSite => publisher_site_spec(),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn field_str(row: &JsonValue, column: &str) -> Option<String> {
    match row.get(column) {
        Some(JsonValue::String(s)) => text_or_none(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        // Some APIs wrap scalar text in a one-element array.
        Some(JsonValue::Array(items)) => items
            .first()
            .and_then(|v| v.as_str())
            .and_then(|s| text_or_none(s.to_string())),
        _ => None,
    }
}

/// Render the author list to its canonical semicolon-joined string form.
/// Accepts a pre-rendered string, an array of names, or an array of
/// `{given, family}` / `{name}` objects.
fn render_authors(row: &JsonValue, column: &str) -> String {
    match row.get(column) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => text_or_none(s.clone()),
                JsonValue::Object(_) => {
                    let family = item.get("family").and_then(|v| v.as_str());
                    let given = item.get("given").and_then(|v| v.as_str());
                    match (family, given) {
                        (Some(f), Some(g)) => Some(format!("{f}, {g}")),
                        (Some(f), None) => Some(f.to_string()),
                        _ => item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .and_then(|s| text_or_none(s.to_string())),
                    }
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

fn date_from_parts(parts: &[JsonValue]) -> Option<NaiveDate> {
    let year = parts.first()?.as_i64()?;
    let month = parts.get(1).and_then(|v| v.as_i64()).unwrap_or(1);
    let day = parts.get(2).and_then(|v| v.as_i64()).unwrap_or(1);
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
}

/// Parse the publication date from any shape the sources emit: `YYYY-MM-DD`,
/// `YYYY/MM/DD`, an RFC 3339 timestamp, or a `date-parts` array.
fn parse_publication_date(value: &JsonValue) -> Result<NaiveDate, String> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(date);
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y/%m/%d") {
                return Ok(date);
            }
            if s.len() >= 10 {
                if let Ok(date) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
                    return Ok(date);
                }
            }
            Err(format!("unrecognized date string {s:?}"))
        }
        JsonValue::Array(parts) => {
            // Crossref nests as {"date-parts": [[y, m, d]]}; accept both the
            // inner and outer array.
            let flat = match parts.first() {
                Some(JsonValue::Array(inner)) => inner.as_slice(),
                _ => parts.as_slice(),
            };
            date_from_parts(flat).ok_or_else(|| "date-parts out of range".to_string())
        }
        JsonValue::Object(_) => value
            .get("date-parts")
            .map(parse_publication_date)
            .unwrap_or_else(|| Err("object carries no date-parts".to_string())),
        other => Err(format!("unsupported date shape {other}")),
    }
}

/// Project one source-native row into the canonical candidate shape.
///
/// Required fields are id, title, and publication_date; a missing or
/// malformed required field is a [`SchemaError`]. Optional-field absence is
/// never an error. The returned id carries the source's namespace prefix.
pub fn normalize_row(
    spec: &SourceSpec,
    row_index: usize,
    row: &JsonValue,
) -> Result<CandidateRecord, SchemaError> {
    let raw_id = field_str(row, spec.columns.id).ok_or(SchemaError::MissingField {
        source_id: spec.source_id.to_string(),
        field: "id",
        row_index,
    })?;
    let title = field_str(row, spec.columns.title).ok_or(SchemaError::MissingField {
        source_id: spec.source_id.to_string(),
        field: "title",
        row_index,
    })?;
    let date_value = row
        .get(spec.columns.publication_date)
        .ok_or(SchemaError::MissingField {
            source_id: spec.source_id.to_string(),
            field: "publication_date",
            row_index,
        })?;
    let publication_date =
        parse_publication_date(date_value).map_err(|reason| SchemaError::MalformedField {
            source_id: spec.source_id.to_string(),
            field: "publication_date",
            row_index,
            reason,
        })?;

    Ok(CandidateRecord {
        id: format!("{}:{}", spec.id_prefix, raw_id),
        title,
        authors: render_authors(row, spec.columns.authors),
        publication_date,
        abstract_text: field_str(row, spec.columns.abstract_text),
        journal: field_str(row, spec.columns.journal).unwrap_or_default(),
        doi_or_url: field_str(row, spec.columns.doi_or_url).unwrap_or_default(),
    })
}

/// One source's normalization outcome: the usable candidates plus the rows
/// that were dropped, kept for the cycle summary count.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<CandidateRecord>,
    pub rejected: Vec<SchemaError>,
}

/// Normalize a whole dump. A bad row is dropped and counted, never aborts
/// the batch.
pub fn normalize_batch(spec: &SourceSpec, rows: &[JsonValue]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (row_index, row) in rows.iter().enumerate() {
        match normalize_row(spec, row_index, row) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!(source = spec.source_id, %err, "dropping candidate row");
                batch.rejected.push(err);
            }
        }
    }
    batch
}

/// Split a TSV dump (header row + data rows) into JSON rows keyed by the
/// header names, ready for [`normalize_batch`].
pub fn rows_from_tsv(text: &str) -> Vec<JsonValue> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<&str> = header_line.split('\t').map(str::trim).collect();

    lines
        .map(|line| {
            let mut object = serde_json::Map::new();
            for (header, cell) in headers.iter().zip(line.split('\t')) {
                let cell = cell.trim();
                if !cell.is_empty() {
                    object.insert(header.to_string(), JsonValue::String(cell.to_string()));
                }
            }
            JsonValue::Object(object)
        })
        .collect()
}

//! Core domain model for RPW: canonical paper records and lifecycle status.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rpw-core";

/// Lifecycle status assigned by the reconciliation engine. Transient:
/// recomputed on every cycle, never an intrinsic property of the paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaperStatus {
    New,
    Updated,
    Old,
}

impl std::fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaperStatus::New => "NEW",
            PaperStatus::Updated => "UPDATED",
            PaperStatus::Old => "OLD",
        };
        f.write_str(s)
    }
}

/// Uniform handoff contract from source normalizers into the reconciliation
/// engine. `id` carries the source's namespace prefix and is unique across
/// all sources; `authors` is the semicolon-joined rendered author list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub publication_date: NaiveDate,
    pub abstract_text: Option<String>,
    pub journal: String,
    pub doi_or_url: String,
}

/// One tracked paper in the persisted catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub publication_date: NaiveDate,
    pub abstract_text: Option<String>,
    pub journal: String,
    pub doi_or_url: String,
    pub status: PaperStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
}

impl PaperRecord {
    /// Promote a freshly fetched candidate into a NEW catalog record.
    pub fn from_candidate(candidate: &CandidateRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.id.clone(),
            title: candidate.title.clone(),
            authors: candidate.authors.clone(),
            publication_date: candidate.publication_date,
            abstract_text: candidate.abstract_text.clone(),
            journal: candidate.journal.clone(),
            doi_or_url: candidate.doi_or_url.clone(),
            status: PaperStatus::New,
            first_seen_at: now,
            last_changed_at: now,
        }
    }

    /// Rebuild an existing record from the new fetch's field values after a
    /// detected content change. `first_seen_at` is carried over unchanged.
    pub fn updated_from(previous: &PaperRecord, candidate: &CandidateRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.id.clone(),
            title: candidate.title.clone(),
            authors: candidate.authors.clone(),
            publication_date: candidate.publication_date,
            abstract_text: candidate.abstract_text.clone(),
            journal: candidate.journal.clone(),
            doi_or_url: candidate.doi_or_url.clone(),
            status: PaperStatus::Updated,
            first_seen_at: previous.first_seen_at,
            last_changed_at: now,
        }
    }
}

/// The explicit comparison column set for change detection. Named fields
/// rather than an implicit column intersection, so a source adding or
/// dropping a column cannot silently change reconciliation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareField {
    Title,
    Authors,
    PublicationDate,
    Abstract,
    Journal,
    DoiOrUrl,
}

impl CompareField {
    /// Every field the candidate shape carries; the default compare set.
    pub fn all() -> &'static [CompareField] {
        &[
            CompareField::Title,
            CompareField::Authors,
            CompareField::PublicationDate,
            CompareField::Abstract,
            CompareField::Journal,
            CompareField::DoiOrUrl,
        ]
    }
}

/// Rendered-string projection used for field equality. Collections and dates
/// compare on their rendered form, so an author reordering counts as a
/// content change.
pub trait RenderedFields {
    fn rendered_field(&self, field: CompareField) -> String;
}

impl RenderedFields for CandidateRecord {
    fn rendered_field(&self, field: CompareField) -> String {
        match field {
            CompareField::Title => self.title.clone(),
            CompareField::Authors => self.authors.clone(),
            CompareField::PublicationDate => self.publication_date.format("%Y-%m-%d").to_string(),
            CompareField::Abstract => self.abstract_text.clone().unwrap_or_default(),
            CompareField::Journal => self.journal.clone(),
            CompareField::DoiOrUrl => self.doi_or_url.clone(),
        }
    }
}

impl RenderedFields for PaperRecord {
    fn rendered_field(&self, field: CompareField) -> String {
        match field {
            CompareField::Title => self.title.clone(),
            CompareField::Authors => self.authors.clone(),
            CompareField::PublicationDate => self.publication_date.format("%Y-%m-%d").to_string(),
            CompareField::Abstract => self.abstract_text.clone().unwrap_or_default(),
            CompareField::Journal => self.journal.clone(),
            CompareField::DoiOrUrl => self.doi_or_url.clone(),
        }
    }
}

/// True when any field in `compare` differs between the new fetch's candidate
/// and the previously persisted record. Bookkeeping columns (`status`,
/// `first_seen_at`, `last_changed_at`) never participate.
pub fn fields_differ(candidate: &CandidateRecord, previous: &PaperRecord, compare: &[CompareField]) -> bool {
    compare
        .iter()
        .any(|&field| candidate.rendered_field(field) != previous.rendered_field(field))
}

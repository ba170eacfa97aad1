//! Reconciliation engine + batch cycle orchestration.
//!
//! The engine itself ([`reconcile`], [`filter_retained`], [`to_notify`]) is a
//! set of pure functions over in-memory tables: no clock reads, no I/O, no
//! ambient state. [`CyclePipeline`] wires those functions to the dump files,
//! the persisted catalog, the notification ledger, and the cycle reports.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rpw_adapters::{normalize_batch, rows_from_tsv, spec_for_kind, SourceKind};
use rpw_core::{fields_differ, CandidateRecord, CompareField, PaperRecord, PaperStatus};
use rpw_storage::{CatalogStore, LedgerStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpw-recon";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("both the new fetch and the previous catalog are empty; nothing safe to persist")]
    NoData,
}

fn sort_for_display(catalog: &mut [PaperRecord]) {
    // display policy only, no correctness contract attaches to the order
    catalog.sort_by(|a, b| {
        b.first_seen_at
            .cmp(&a.first_seen_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Three-way merge of the freshly fetched candidate set against the
/// previously persisted catalog.
///
/// - ids only in the fetch become NEW (`first_seen_at = last_changed_at = now`);
/// - ids only in the previous catalog age to OLD with every field retained
///   (disappearance is not a content change);
/// - ids in both compare on the rendered `compare` fields: any difference
///   makes the record UPDATED with the fetch's values and `last_changed_at =
///   now`, `first_seen_at` carried over; no difference keeps the previous
///   record verbatim, prior status included.
///
/// A totally empty fetch against a non-empty catalog passes the catalog
/// through with statuses untouched: that shape almost always means an
/// upstream fetch failure, not a mass disappearance.
pub fn reconcile(
    new_records: &[CandidateRecord],
    previous: &[PaperRecord],
    compare: &[CompareField],
    now: DateTime<Utc>,
) -> Result<Vec<PaperRecord>, ReconcileError> {
    if new_records.is_empty() && previous.is_empty() {
        return Err(ReconcileError::NoData);
    }
    if new_records.is_empty() {
        let mut catalog = previous.to_vec();
        sort_for_display(&mut catalog);
        return Ok(catalog);
    }

    let prev_by_id: BTreeMap<&str, &PaperRecord> =
        previous.iter().map(|r| (r.id.as_str(), r)).collect();
    let fetched_ids: BTreeSet<&str> = new_records.iter().map(|c| c.id.as_str()).collect();

    let mut catalog = Vec::with_capacity(new_records.len() + previous.len());
    for candidate in new_records {
        match prev_by_id.get(candidate.id.as_str()) {
            None => catalog.push(PaperRecord::from_candidate(candidate, now)),
            Some(prev) if fields_differ(candidate, prev, compare) => {
                catalog.push(PaperRecord::updated_from(prev, candidate, now));
            }
            Some(prev) => catalog.push((*prev).clone()),
        }
    }
    for prev in previous {
        if !fetched_ids.contains(prev.id.as_str()) {
            let mut aged = prev.clone();
            aged.status = PaperStatus::Old;
            catalog.push(aged);
        }
    }

    sort_for_display(&mut catalog);
    Ok(catalog)
}

/// Keep exactly the records with `first_seen_at >= as_of - window_days`.
/// Hard drop, no soft-delete. Applied strictly after [`reconcile`] so status
/// transitions are computed against the full previous catalog.
pub fn filter_retained(
    catalog: Vec<PaperRecord>,
    window_days: i64,
    as_of: DateTime<Utc>,
) -> Vec<PaperRecord> {
    let cutoff = as_of - Duration::days(window_days);
    catalog
        .into_iter()
        .filter(|record| record.first_seen_at >= cutoff)
        .collect()
}

/// The to-notify set: status NEW (a changed paper is not re-announced) and
/// id absent from the ledger. The ledger is the second line of defense: it
/// outlives the catalog record, so a paper reappearing after retention
/// expiry still cannot be announced twice.
pub fn to_notify(catalog: &[PaperRecord], ledger: &BTreeSet<String>) -> Vec<PaperRecord> {
    catalog
        .iter()
        .filter(|record| record.status == PaperStatus::New && !ledger.contains(&record.id))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub dump_path: PathBuf,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub retention_days: i64,
    pub compare_fields: Vec<CompareField>,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
}

impl CycleConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            data_dir: std::env::var("RPW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            retention_days: std::env::var("RPW_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(365),
            compare_fields: CompareField::all().to_vec(),
            scheduler_enabled: std::env::var("RPW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cycle_cron: std::env::var("RPW_CYCLE_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("notified.txt")
    }
}

/// Seam to the external notification collaborator. `Ok(())` is the success
/// signal that authorizes the ledger append; any error leaves the ledger
/// untouched and the ids eligible for the next cycle.
pub trait NotificationDispatch: Send + Sync {
    fn dispatch(&self, papers: &[PaperRecord]) -> Result<()>;
}

/// Default dispatcher: logs each paper in place of a real send.
#[derive(Default)]
pub struct LogDispatch;

impl NotificationDispatch for LogDispatch {
    fn dispatch(&self, papers: &[PaperRecord]) -> Result<()> {
        for paper in papers {
            info!(id = %paper.id, title = %paper.title, link = %paper.doi_or_url, "would notify");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub candidate_records: usize,
    pub rejected_rows: usize,
    pub new: usize,
    pub updated: usize,
    pub old: usize,
    pub retained: usize,
    pub notified: usize,
    pub catalog_path: String,
    pub catalog_sha256: String,
    pub reports_dir: String,
}

pub struct CyclePipeline {
    config: CycleConfig,
    catalog: CatalogStore,
    ledger: LedgerStore,
    dispatch: Box<dyn NotificationDispatch>,
}

impl CyclePipeline {
    pub fn new(config: CycleConfig) -> Self {
        let catalog = CatalogStore::new(config.catalog_path());
        let ledger = LedgerStore::new(config.ledger_path());
        Self {
            config,
            catalog,
            ledger,
            dispatch: Box::<LogDispatch>::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: Box<dyn NotificationDispatch>) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub async fn run_once(&self) -> Result<CycleSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// One full reconciliation cycle with an injected `now`, the only clock
    /// the engine ever sees.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = now;
        let registry = self.load_source_registry().await?;
        let enabled_sources: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();

        let mut candidates: Vec<CandidateRecord> = Vec::new();
        let mut rejected_rows = 0usize;
        for source in &enabled_sources {
            let Some(rows) = self.load_dump_rows(source).await? else {
                warn!(
                    source = %source.source_id,
                    "dump file missing; treating source as absent this cycle"
                );
                continue;
            };
            let spec = spec_for_kind(source.kind);
            let batch = normalize_batch(&spec, &rows);
            info!(
                source = %source.source_id,
                records = batch.records.len(),
                rejected = batch.rejected.len(),
                "normalized source dump"
            );
            rejected_rows += batch.rejected.len();
            candidates.extend(batch.records);
        }

        let previous = self.catalog.load().await?.unwrap_or_default();
        let ledger = self.ledger.load().await?;

        // NoData aborts here, before anything on disk is touched.
        let reconciled = reconcile(&candidates, &previous, &self.config.compare_fields, now)?;
        let retained = filter_retained(reconciled, self.config.retention_days, now);
        self.catalog.save(&retained).await?;

        let pending = to_notify(&retained, &ledger);
        let notified = if pending.is_empty() {
            0
        } else {
            match self.dispatch.dispatch(&pending) {
                Ok(()) => {
                    let ids: Vec<String> = pending.iter().map(|p| p.id.clone()).collect();
                    self.ledger.append(&ids).await?;
                    ids.len()
                }
                Err(err) => {
                    warn!(%err, "notification dispatch failed; ledger left untouched");
                    0
                }
            }
        };

        let count_status = |status: PaperStatus| retained.iter().filter(|r| r.status == status).count();
        let finished_at = Utc::now();
        let mut summary = CycleSummary {
            run_id,
            started_at,
            finished_at,
            enabled_sources: enabled_sources.len(),
            candidate_records: candidates.len(),
            rejected_rows,
            new: count_status(PaperStatus::New),
            updated: count_status(PaperStatus::Updated),
            old: count_status(PaperStatus::Old),
            retained: retained.len(),
            notified,
            catalog_path: self.catalog.path().display().to_string(),
            catalog_sha256: String::new(),
            reports_dir: String::new(),
        };
        summary.catalog_sha256 = self.catalog_manifest_hash().await?;
        summary.reports_dir = self
            .write_reports(&summary, &enabled_sources)
            .await?
            .display()
            .to_string();
        Ok(summary)
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `None` when the source's dump is missing, which the cycle treats as
    /// fetch absence for that source rather than an error.
    async fn load_dump_rows(&self, source: &SourceConfig) -> Result<Option<Vec<JsonValue>>> {
        let path = self.config.workspace_root.join(&source.dump_path);
        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !exists {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let rows = if path.extension().and_then(|e| e.to_str()) == Some("tsv") {
            rows_from_tsv(&text)
        } else {
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        };
        Ok(Some(rows))
    }

    async fn catalog_manifest_hash(&self) -> Result<String> {
        let bytes = fs::read(self.catalog.path())
            .await
            .with_context(|| format!("reading {}", self.catalog.path().display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    async fn write_reports(
        &self,
        summary: &CycleSummary,
        enabled_sources: &[SourceConfig],
    ) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let summary_json =
            serde_json::to_vec_pretty(summary).context("serializing cycle summary")?;
        fs::write(reports_dir.join("cycle_summary.json"), summary_json)
            .await
            .context("writing cycle_summary.json")?;

        let brief = format!(
            "# RPW Cycle Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {}\n- Candidates: {} ({} rejected)\n- Catalog: {} retained ({} new, {} updated, {} old)\n- Notified: {}\n- Catalog sha256: `{}`\n\n## Enabled Sources\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.enabled_sources,
            summary.candidate_records,
            summary.rejected_rows,
            summary.retained,
            summary.new,
            summary.updated,
            summary.old,
            summary.notified,
            summary.catalog_sha256,
            enabled_sources
                .iter()
                .map(|s| format!("- {} ({})", s.source_id, s.display_name))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("cycle_brief.md"), brief)
            .await
            .context("writing cycle_brief.md")?;

        Ok(reports_dir)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(self.config.cycle_cron.as_str(), |_uuid, _l| {
            Box::pin(async move {
                if let Err(err) = run_cycle_once_from_env().await {
                    warn!(%err, "scheduled cycle failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.cycle_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_cycle_once_from_env() -> Result<CycleSummary> {
    let config = CycleConfig::from_env();
    let pipeline = CyclePipeline::new(config);
    pipeline.run_once().await
}

/// Markdown digest of the most recent cycle reports, newest first.
pub fn report_recent_cycles(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# RPW Recent Cycles".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("cycle_summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let field = |name: &str| summary.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- candidates: {} ({} rejected)",
            field("candidate_records"),
            field("rejected_rows")
        ));
        lines.push(format!(
            "- catalog: {} retained ({} new, {} updated, {} old)",
            field("retained"),
            field("new"),
            field("updated"),
            field("old")
        ));
        lines.push(format!("- notified: {}", field("notified")));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Mutex;

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, hour, 0, 0).single().unwrap()
    }

    fn candidate(id: &str, title: &str) -> CandidateRecord {
        CandidateRecord {
            id: id.to_string(),
            title: title.to_string(),
            authors: "Doe, Jane".to_string(),
            publication_date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            abstract_text: Some("An abstract.".to_string()),
            journal: "Journal of Tests".to_string(),
            doi_or_url: format!("https://example.org/{id}"),
        }
    }

    fn by_id<'a>(catalog: &'a [PaperRecord], id: &str) -> &'a PaperRecord {
        catalog.iter().find(|r| r.id == id).expect("record present")
    }

    #[test]
    fn scenario_a_first_run_makes_everything_new() {
        let now = t(1, 6);
        let new = vec![
            candidate("crossref:a", "A"),
            candidate("repec:b", "B"),
            candidate("pubsite:c", "C"),
        ];
        let catalog = reconcile(&new, &[], CompareField::all(), now).unwrap();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.iter().all(|r| r.status == PaperStatus::New));
        assert!(catalog.iter().all(|r| r.first_seen_at == now && r.last_changed_at == now));

        let ledger = BTreeSet::new();
        assert_eq!(to_notify(&catalog, &ledger).len(), 3);
    }

    #[test]
    fn scenario_b_changed_title_becomes_updated_and_is_not_renotified() {
        let first = t(1, 6);
        let second = t(2, 6);
        let previous = reconcile(&[candidate("crossref:x1", "Foo")], &[], CompareField::all(), first).unwrap();

        let catalog =
            reconcile(&[candidate("crossref:x1", "Bar")], &previous, CompareField::all(), second).unwrap();
        let x1 = by_id(&catalog, "crossref:x1");
        assert_eq!(x1.status, PaperStatus::Updated);
        assert_eq!(x1.title, "Bar");
        assert_eq!(x1.first_seen_at, first);
        assert_eq!(x1.last_changed_at, second);

        let ledger = BTreeSet::new();
        assert!(to_notify(&catalog, &ledger).is_empty());
    }

    #[test]
    fn scenario_c_disappeared_record_ages_to_old_but_is_retained() {
        let first = t(1, 6);
        let second = t(2, 6);
        let previous = reconcile(
            &[candidate("crossref:x1", "One"), candidate("crossref:x2", "Two")],
            &[],
            CompareField::all(),
            first,
        )
        .unwrap();

        let catalog =
            reconcile(&[candidate("crossref:x1", "One")], &previous, CompareField::all(), second).unwrap();
        assert_eq!(catalog.len(), 2);

        let x2 = by_id(&catalog, "crossref:x2");
        assert_eq!(x2.status, PaperStatus::Old);
        assert_eq!(x2.title, "Two");
        assert_eq!(x2.last_changed_at, first);

        // unchanged re-fetch keeps its prior status, no forced downgrade
        assert_eq!(by_id(&catalog, "crossref:x1").status, PaperStatus::New);
    }

    #[test]
    fn scenario_d_ledger_blocks_renotification_of_new_records() {
        let now = t(1, 6);
        let catalog = reconcile(&[candidate("crossref:x1", "Back Again")], &[], CompareField::all(), now).unwrap();
        let ledger: BTreeSet<String> = ["crossref:x1".to_string()].into();
        assert!(to_notify(&catalog, &ledger).is_empty());
    }

    #[test]
    fn scenario_e_empty_inputs_fail_with_no_data() {
        assert_eq!(
            reconcile(&[], &[], CompareField::all(), t(1, 6)).unwrap_err(),
            ReconcileError::NoData
        );
    }

    #[test]
    fn reconcile_is_idempotent_for_a_fixed_now() {
        let now = t(1, 6);
        let later = t(2, 6);
        let new = vec![candidate("crossref:a", "A"), candidate("repec:b", "B")];
        let first = reconcile(&new, &[], CompareField::all(), now).unwrap();
        let second = reconcile(&new, &first, CompareField::all(), later).unwrap();
        let third = reconcile(&new, &second, CompareField::all(), later).unwrap();
        // nothing changed between runs, so repeated application is a fixpoint
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn classification_is_disjoint_and_total() {
        let first = t(1, 6);
        let second = t(2, 6);
        let previous = reconcile(
            &[
                candidate("crossref:keep", "Keep"),
                candidate("crossref:change", "Before"),
                candidate("crossref:drop", "Drop"),
            ],
            &[],
            CompareField::all(),
            first,
        )
        .unwrap();
        let catalog = reconcile(
            &[
                candidate("crossref:keep", "Keep"),
                candidate("crossref:change", "After"),
                candidate("crossref:fresh", "Fresh"),
            ],
            &previous,
            CompareField::all(),
            second,
        )
        .unwrap();

        assert_eq!(catalog.len(), 4);
        let count = |status| catalog.iter().filter(|r| r.status == status).count();
        // "keep" retains its prior NEW status; every record lands in exactly one bucket
        assert_eq!(count(PaperStatus::New) + count(PaperStatus::Updated) + count(PaperStatus::Old), 4);
        assert_eq!(count(PaperStatus::Updated), 1);
        assert_eq!(count(PaperStatus::Old), 1);
    }

    #[test]
    fn first_seen_is_immutable_across_cycles() {
        let first = t(1, 6);
        let second = t(5, 6);
        let previous = reconcile(&[candidate("crossref:a", "A")], &[], CompareField::all(), first).unwrap();
        let catalog =
            reconcile(&[candidate("crossref:a", "A, Revised")], &previous, CompareField::all(), second).unwrap();
        assert_eq!(by_id(&catalog, "crossref:a").first_seen_at, first);
    }

    #[test]
    fn empty_fetch_passes_previous_catalog_through_untouched() {
        let first = t(1, 6);
        let previous = reconcile(
            &[candidate("crossref:a", "A"), candidate("repec:b", "B")],
            &[],
            CompareField::all(),
            first,
        )
        .unwrap();
        let catalog = reconcile(&[], &previous, CompareField::all(), t(2, 6)).unwrap();
        assert_eq!(catalog, previous);
        assert!(catalog.iter().all(|r| r.status == PaperStatus::New));
    }

    #[test]
    fn restricted_compare_set_suppresses_out_of_set_changes() {
        let first = t(1, 6);
        let second = t(2, 6);
        let previous = reconcile(&[candidate("crossref:a", "A")], &[], CompareField::all(), first).unwrap();

        let mut fetched = candidate("crossref:a", "A");
        fetched.journal = "Renamed Journal".to_string();
        let catalog = reconcile(
            &[fetched],
            &previous,
            &[CompareField::Title, CompareField::Authors],
            second,
        )
        .unwrap();
        // journal changed but is outside the compare set: record kept verbatim
        assert_eq!(catalog, previous);
    }

    #[test]
    fn retention_keeps_the_boundary_and_drops_beyond_it() {
        let as_of = t(31, 6);
        let on_boundary = reconcile(&[candidate("crossref:edge", "Edge")], &[], CompareField::all(), t(1, 6)).unwrap();
        let expired = reconcile(
            &[candidate("crossref:stale", "Stale")],
            &[],
            CompareField::all(),
            t(1, 6) - Duration::days(1),
        )
        .unwrap();

        let mut catalog = on_boundary;
        catalog.extend(expired);
        let retained = filter_retained(catalog, 30, as_of);
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].id, "crossref:edge");
    }

    #[test]
    fn at_most_once_notification_across_expiry_and_reappearance() {
        let mut ledger: BTreeSet<String> = BTreeSet::new();

        // cycle 1: the paper appears and is notified
        let c1 = reconcile(&[candidate("crossref:p", "P")], &[], CompareField::all(), t(1, 6)).unwrap();
        let pending = to_notify(&c1, &ledger);
        assert_eq!(pending.len(), 1);
        ledger.extend(pending.iter().map(|p| p.id.clone()));

        // cycle 2: the paper is gone; retention expires the record entirely
        let c2 = reconcile(&[], &c1, CompareField::all(), t(2, 6)).unwrap();
        let c2 = filter_retained(c2, 0, t(10, 6));
        assert!(c2.is_empty());

        // cycle 3: it reappears and is NEW again, but the ledger still blocks it
        let c3 = reconcile(&[candidate("crossref:p", "P")], &c2, CompareField::all(), t(11, 6)).unwrap();
        assert_eq!(by_id(&c3, "crossref:p").status, PaperStatus::New);
        assert!(to_notify(&c3, &ledger).is_empty());
    }

    struct RecordingDispatch {
        sent: Mutex<Vec<String>>,
    }

    impl NotificationDispatch for RecordingDispatch {
        fn dispatch(&self, papers: &[PaperRecord]) -> Result<()> {
            self.sent
                .lock()
                .expect("lock")
                .extend(papers.iter().map(|p| p.id.clone()));
            Ok(())
        }
    }

    struct FailingDispatch;

    impl NotificationDispatch for FailingDispatch {
        fn dispatch(&self, _papers: &[PaperRecord]) -> Result<()> {
            anyhow::bail!("smtp relay unreachable")
        }
    }

    fn workspace_with_dump(dump: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("dumps")).expect("dumps dir");
        std::fs::write(
            dir.path().join("sources.yaml"),
            "sources:\n  - source_id: pubsite\n    display_name: Publisher site\n    enabled: true\n    kind: publisher_site\n    dump_path: dumps/pubsite.json\n  - source_id: crossref\n    display_name: Crossref\n    enabled: false\n    kind: metadata_api\n    dump_path: dumps/crossref.json\n",
        )
        .expect("registry");
        std::fs::write(dir.path().join("dumps").join("pubsite.json"), dump).expect("dump");
        dir
    }

    fn pipeline_for(dir: &tempfile::TempDir) -> CycleConfig {
        CycleConfig {
            workspace_root: dir.path().to_path_buf(),
            data_dir: dir.path().join("data"),
            retention_days: 365,
            compare_fields: CompareField::all().to_vec(),
            scheduler_enabled: false,
            cycle_cron: "0 6 * * *".to_string(),
        }
    }

    const DUMP: &str = r#"[
        {"article_id": "a1", "title": "First Paper", "published": "2026-05-01", "journal": "J1", "link": "https://example.org/a1"},
        {"article_id": "a2", "title": "Second Paper", "published": "2026-05-02", "journal": "J2", "link": "https://example.org/a2"},
        {"title": "Row Without Id", "published": "2026-05-03"}
    ]"#;

    #[tokio::test]
    async fn pipeline_cycle_persists_catalog_and_appends_ledger_once() {
        let dir = workspace_with_dump(DUMP);
        let config = pipeline_for(&dir);
        let pipeline = CyclePipeline::new(config.clone()).with_dispatch(Box::new(RecordingDispatch {
            sent: Mutex::new(Vec::new()),
        }));

        let summary = pipeline.run_once_at(t(1, 6)).await.expect("first cycle");
        assert_eq!(summary.candidate_records, 2);
        assert_eq!(summary.rejected_rows, 1);
        assert_eq!(summary.new, 2);
        assert_eq!(summary.notified, 2);
        assert!(dir.path().join("data").join("catalog.json").exists());
        assert_eq!(summary.catalog_sha256.len(), 64);

        let ledger = LedgerStore::new(config.ledger_path());
        assert_eq!(ledger.load().await.expect("ledger").len(), 2);

        // identical second cycle: statuses survive, nothing new to notify
        let summary = pipeline.run_once_at(t(2, 6)).await.expect("second cycle");
        assert_eq!(summary.new, 2);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.notified, 0);
        assert_eq!(ledger.load().await.expect("ledger").len(), 2);
    }

    #[tokio::test]
    async fn pipeline_aborts_on_no_data_without_writing() {
        let dir = workspace_with_dump("[]");
        let config = pipeline_for(&dir);
        let pipeline = CyclePipeline::new(config.clone());

        let err = pipeline.run_once_at(t(1, 6)).await.expect_err("no data");
        assert!(err.to_string().contains("nothing safe to persist"));
        assert!(!config.catalog_path().exists());
        assert!(!config.ledger_path().exists());
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_ledger_untouched_and_ids_eligible() {
        let dir = workspace_with_dump(DUMP);
        let config = pipeline_for(&dir);

        let failing = CyclePipeline::new(config.clone()).with_dispatch(Box::new(FailingDispatch));
        let summary = failing.run_once_at(t(1, 6)).await.expect("cycle succeeds");
        assert_eq!(summary.notified, 0);
        assert!(!config.ledger_path().exists());

        // next cycle with a working dispatcher picks the same ids up
        let working = CyclePipeline::new(config.clone()).with_dispatch(Box::new(RecordingDispatch {
            sent: Mutex::new(Vec::new()),
        }));
        let summary = working.run_once_at(t(2, 6)).await.expect("retry cycle");
        assert_eq!(summary.notified, 2);
    }

    #[tokio::test]
    async fn missing_dump_passes_previous_catalog_through() {
        let dir = workspace_with_dump(DUMP);
        let config = pipeline_for(&dir);
        let pipeline = CyclePipeline::new(config.clone());
        pipeline.run_once_at(t(1, 6)).await.expect("seed cycle");

        std::fs::remove_file(dir.path().join("dumps").join("pubsite.json")).expect("remove dump");
        let summary = pipeline.run_once_at(t(2, 6)).await.expect("outage cycle");
        assert_eq!(summary.candidate_records, 0);
        assert_eq!(summary.retained, 2);
        assert_eq!(summary.new, 2);
    }

    #[tokio::test]
    async fn report_digest_covers_recent_cycles() {
        let dir = workspace_with_dump(DUMP);
        let pipeline = CyclePipeline::new(pipeline_for(&dir));
        pipeline.run_once_at(t(1, 6)).await.expect("cycle");

        let digest = report_recent_cycles(3, Some(dir.path().to_path_buf())).expect("digest");
        assert!(digest.contains("# RPW Recent Cycles"));
        assert!(digest.contains("candidates: 2 (1 rejected)"));
    }
}

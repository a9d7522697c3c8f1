//! Run orchestration for CFR: reconcile, quality gate, store processing,
//! batch scheduling, merge, reports and snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfr_adapters::{Credentials, FixturePortalFactory, SessionFactory};
use cfr_core::{ConsolidatedDataset, FeeTotals, ProcessingDate, Store, StoreOutcome};
use cfr_storage::{file_stamp, sha256_hex, DatasetStore, SummaryLog, WrittenDataset};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod inputs;
pub mod processor;
pub mod quality;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;

pub use inputs::{load_dates, load_stores, LoadError};
pub use processor::{ProcessorPolicy, StoreProcessor, StoreReport, StoreStep};
pub use quality::{GateOutcome, GateState, QualityGate};
pub use reconcile::{reconcile, Reconciliation, RowContext};
pub use scheduler::{merge, partition, BatchResult, DateDispatch, WorkerFailure, WorkerPool};

pub const CRATE_NAME: &str = "cfr-sync";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workspace_root: PathBuf,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub stores_path: PathBuf,
    pub dates_path: PathBuf,
    pub base_filename: String,
    pub worker_count: usize,
    pub max_batch_size: usize,
    pub stagger: Duration,
    pub quality_max_attempts: usize,
    pub modal_max_attempts: usize,
    pub navigation_max_attempts: usize,
    pub retry_pause: Duration,
    pub portal_user: Option<String>,
    pub portal_password: Option<String>,
    pub fixtures_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            output_dir: PathBuf::from("base"),
            logs_dir: PathBuf::from("logs"),
            reports_dir: PathBuf::from("reports"),
            stores_path: PathBuf::from("stores.yaml"),
            dates_path: PathBuf::from("data_param.txt"),
            base_filename: "resumo_entregadores".to_string(),
            worker_count: 2,
            max_batch_size: 30,
            stagger: Duration::from_secs(10),
            quality_max_attempts: 3,
            modal_max_attempts: 3,
            navigation_max_attempts: 2,
            retry_pause: Duration::from_millis(2000),
            portal_user: None,
            portal_password: None,
            fixtures_dir: PathBuf::from("fixtures/portal-sample"),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: env_path("CFR_WORKSPACE_ROOT", defaults.workspace_root),
            output_dir: env_path("CFR_OUTPUT_DIR", defaults.output_dir),
            logs_dir: env_path("CFR_LOGS_DIR", defaults.logs_dir),
            reports_dir: env_path("CFR_REPORTS_DIR", defaults.reports_dir),
            stores_path: env_path("CFR_STORES_PATH", defaults.stores_path),
            dates_path: env_path("CFR_DATES_PATH", defaults.dates_path),
            base_filename: std::env::var("CFR_BASE_FILENAME").unwrap_or(defaults.base_filename),
            worker_count: env_parse("CFR_WORKERS", defaults.worker_count),
            max_batch_size: env_parse("CFR_MAX_BATCH_SIZE", defaults.max_batch_size),
            stagger: Duration::from_secs(env_parse("CFR_STAGGER_SECS", defaults.stagger.as_secs())),
            quality_max_attempts: env_parse("CFR_QUALITY_ATTEMPTS", defaults.quality_max_attempts),
            modal_max_attempts: env_parse("CFR_MODAL_ATTEMPTS", defaults.modal_max_attempts),
            navigation_max_attempts: env_parse(
                "CFR_NAVIGATION_ATTEMPTS",
                defaults.navigation_max_attempts,
            ),
            retry_pause: Duration::from_millis(env_parse(
                "CFR_RETRY_PAUSE_MS",
                defaults.retry_pause.as_millis() as u64,
            )),
            portal_user: std::env::var("PORTAL_USER").ok(),
            portal_password: std::env::var("PORTAL_PASSWORD").ok(),
            fixtures_dir: env_path("CFR_FIXTURES_DIR", defaults.fixtures_dir),
        }
    }

    /// Relative paths are taken from `workspace_root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn dataset_store(&self) -> DatasetStore {
        DatasetStore::new(self.resolve(&self.output_dir), self.base_filename.clone())
    }

    pub fn summary_log(&self) -> SummaryLog {
        SummaryLog::new(self.resolve(&self.logs_dir).join("daily_summary.log"))
    }

    pub fn processor_policy(&self) -> ProcessorPolicy {
        ProcessorPolicy {
            navigation_max_attempts: self.navigation_max_attempts,
            modal_max_attempts: self.modal_max_attempts,
            retry_pause: self.retry_pause,
            gate: QualityGate {
                max_attempts: self.quality_max_attempts,
                pause: self.retry_pause,
            },
        }
    }

    pub fn credentials(&self) -> Credentials {
        if self.portal_user.is_none() || self.portal_password.is_none() {
            warn!("PORTAL_USER/PORTAL_PASSWORD not set, logging in with empty credentials");
        }
        Credentials {
            user: self.portal_user.clone().unwrap_or_default(),
            password: self.portal_password.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub success_with_quality_warning: usize,
    pub pending: usize,
}

impl OutcomeCounts {
    pub fn tally<'a>(reports: impl IntoIterator<Item = &'a StoreReport>) -> Self {
        let mut counts = Self::default();
        for report in reports {
            match report.outcome {
                StoreOutcome::Success => counts.success += 1,
                StoreOutcome::SuccessWithQualityWarning => counts.success_with_quality_warning += 1,
                StoreOutcome::Pending => counts.pending += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateSummary {
    pub date: ProcessingDate,
    pub stores: Vec<StoreReport>,
    pub counts: OutcomeCounts,
    pub rows: usize,
    pub fee_totals: FeeTotals,
    pub batch_files: Vec<String>,
    pub final_file: Option<String>,
    pub snapshot_file: Option<String>,
    pub worker_failures: Vec<WorkerFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub active_stores: usize,
    pub batches: usize,
    pub dates: Vec<DateSummary>,
    pub reports_dir: String,
    pub manifest: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct MergedDate {
    pub final_file: WrittenDataset,
    pub snapshot_path: PathBuf,
    pub snapshot_sha256: String,
    pub snapshot_bytes: u64,
}

/// Orders store reports as the store list does, marking stores of a
/// worker that never reported as pending.
pub fn collect_reports(
    stores: &[Store],
    dispatch: &DateDispatch,
    date: ProcessingDate,
) -> Vec<StoreReport> {
    let mut by_store: HashMap<&str, StoreReport> = HashMap::new();
    for result in &dispatch.results {
        for report in &result.reports {
            by_store.insert(report.store.as_str(), report.clone());
        }
    }
    let failed: HashMap<&str, &WorkerFailure> = dispatch
        .failures
        .iter()
        .flat_map(|f| f.stores.iter().map(move |s| (s.as_str(), f)))
        .collect();

    stores
        .iter()
        .map(|store| {
            by_store.remove(store.name.as_str()).unwrap_or_else(|| {
                let reason = failed
                    .get(store.name.as_str())
                    .map(|f| format!("worker {} failed: {}", f.worker, f.error))
                    .unwrap_or_else(|| "not processed".to_string());
                StoreReport::pending(&store.name, date, reason)
            })
        })
        .collect()
}

/// Writes the final TSV for `date` plus its Parquet twin.
pub async fn write_merged_date(
    storage: &DatasetStore,
    date: ProcessingDate,
    merged: &ConsolidatedDataset,
    stamp: &str,
) -> Result<MergedDate> {
    let final_file = storage.write_final_file(date, merged, stamp).await?;
    let snapshot_path = final_file.path.with_extension("parquet");
    snapshot::write_dataset_parquet(&snapshot_path, merged)?;
    let bytes = fs::read(&snapshot_path)
        .await
        .with_context(|| format!("reading {}", snapshot_path.display()))?;
    Ok(MergedDate {
        final_file,
        snapshot_sha256: sha256_hex(&bytes),
        snapshot_bytes: bytes.len() as u64,
        snapshot_path,
    })
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

pub struct RunPipeline {
    config: RunConfig,
    factory: Arc<dyn SessionFactory>,
}

impl RunPipeline {
    pub fn new(config: RunConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        async {
            let stores = load_stores(&self.config.resolve(&self.config.stores_path)).await?;
            let dates = load_dates(&self.config.resolve(&self.config.dates_path)).await?;

            let storage = self.config.dataset_store();
            storage.clear_stale_batch_files().await?;

            let active = stores.into_iter().filter(|s| s.active).collect::<Vec<_>>();
            let batches = partition(
                &active,
                self.config.worker_count,
                self.config.max_batch_size,
            );
            if active.is_empty() {
                warn!("no active stores to process");
            } else {
                info!(
                    workers = self.config.worker_count,
                    sizes = ?batches.iter().map(Vec::len).collect::<Vec<_>>(),
                    "prepared batches"
                );
            }

            let pool = WorkerPool::new(
                Arc::clone(&self.factory),
                self.config.credentials(),
                self.config.processor_policy(),
                storage.clone(),
            )
            .with_workers(self.config.worker_count, self.config.stagger);

            let mut date_summaries = Vec::with_capacity(dates.len());
            let mut manifest = Vec::new();
            for date in dates {
                let summary = self
                    .run_date(&pool, &storage, &active, &batches, date, &mut manifest)
                    .await?;
                date_summaries.push(summary);
            }

            let finished_at = Utc::now();
            let mut summary = RunSummary {
                run_id,
                started_at,
                finished_at,
                active_stores: active.len(),
                batches: batches.len(),
                dates: date_summaries,
                reports_dir: String::new(),
                manifest,
            };
            let reports_dir = self.write_reports(&summary).await?;
            summary.reports_dir = display_path(&reports_dir);
            info!(
                dates = summary.dates.len(),
                reports = %summary.reports_dir,
                "run finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn run_date(
        &self,
        pool: &WorkerPool,
        storage: &DatasetStore,
        active: &[Store],
        batches: &[Vec<Store>],
        date: ProcessingDate,
        manifest: &mut Vec<ManifestFile>,
    ) -> Result<DateSummary> {
        info!(date = %date, "starting date");
        let stamp = file_stamp(Local::now().naive_local());
        let dispatch = pool.dispatch_date(batches, date, &stamp).await?;
        let stores = collect_reports(active, &dispatch, date);

        let batch_files = dispatch
            .results
            .iter()
            .filter_map(|r| r.batch_file.as_ref())
            .map(|f| display_path(&f.path))
            .collect::<Vec<_>>();
        let merged = merge(dispatch.results.iter().map(|r| r.dataset.clone()));

        let (final_file, snapshot_file) = if merged.is_empty() {
            warn!(date = %date, "no rows collected, no final file written");
            (None, None)
        } else {
            let written = write_merged_date(storage, date, &merged, &stamp).await?;
            manifest.push(ManifestFile {
                name: format!("final {}", date),
                path: display_path(&written.final_file.path),
                sha256: written.final_file.content_hash.clone(),
                bytes: written.final_file.byte_size as u64,
            });
            manifest.push(ManifestFile {
                name: format!("snapshot {}", date),
                path: display_path(&written.snapshot_path),
                sha256: written.snapshot_sha256.clone(),
                bytes: written.snapshot_bytes,
            });
            (
                Some(display_path(&written.final_file.path)),
                Some(display_path(&written.snapshot_path)),
            )
        };

        let summary = DateSummary {
            date,
            counts: OutcomeCounts::tally(&stores),
            rows: merged.len(),
            fee_totals: merged.fee_totals(),
            stores,
            batch_files,
            final_file,
            snapshot_file,
            worker_failures: dispatch.failures,
        };
        self.append_summary_log(&summary).await;
        Ok(summary)
    }

    async fn append_summary_log(&self, summary: &DateSummary) {
        let mut lines = vec![format!("==== date {} ====", summary.date)];
        lines.extend(
            summary
                .stores
                .iter()
                .map(|r| format!("  - {}: {}", r.store, r.outcome)),
        );
        lines.push(format!(
            "outcomes: SUCCESS={} SUCCESS_WITH_QUALITY_WARNING={} PENDING={}",
            summary.counts.success,
            summary.counts.success_with_quality_warning,
            summary.counts.pending
        ));
        lines.push(format!(
            "rows={} courier_fee_total={} fees_blank={} fees_unparsable={}",
            summary.rows,
            summary.fee_totals.courier_fee_total.round_dp(2),
            summary.fee_totals.blank_rows,
            summary.fee_totals.unparsable_rows
        ));
        if let Some(path) = &summary.final_file {
            lines.push(format!("final file: {path}"));
        }
        if let Err(err) = self
            .config
            .summary_log()
            .append(Local::now().naive_local(), "info", &lines)
            .await
        {
            warn!(error = %err, "could not append daily summary log");
        }
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .resolve(&self.config.reports_dir)
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("run_summary.md"), render_run_summary(summary))
            .await
            .context("writing run_summary.md")?;

        let outcomes = serde_json::to_vec_pretty(summary).context("serializing run outcomes")?;
        fs::write(reports_dir.join("outcomes.json"), outcomes)
            .await
            .context("writing outcomes.json")?;
        Ok(reports_dir)
    }
}

pub fn render_run_summary(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Courier Fee Reconciliation Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Active stores: {}", summary.active_stores),
        format!("- Batches: {}", summary.batches),
    ];
    for date in &summary.dates {
        lines.push(String::new());
        lines.push(format!("## {}", date.date));
        lines.push(String::new());
        lines.push(format!(
            "- SUCCESS: {} / SUCCESS_WITH_QUALITY_WARNING: {} / PENDING: {}",
            date.counts.success, date.counts.success_with_quality_warning, date.counts.pending
        ));
        lines.push(format!("- Rows: {}", date.rows));
        lines.push(format!(
            "- Courier fee total: {} ({} rows without fee, {} unparsable)",
            date.fee_totals.courier_fee_total.round_dp(2),
            date.fee_totals.blank_rows,
            date.fee_totals.unparsable_rows
        ));
        if let Some(path) = &date.final_file {
            lines.push(format!("- Final file: `{path}`"));
        }
        lines.push(String::new());
        lines.push("| Store | Outcome | Rows | Note |".to_string());
        lines.push("|---|---|---|---|".to_string());
        for report in &date.stores {
            let note = match (&report.reason, report.mismatched_couriers.is_empty()) {
                (Some(reason), _) => reason.clone(),
                (None, false) => format!("mismatch: {}", report.mismatched_couriers.join(", ")),
                (None, true) => String::new(),
            };
            lines.push(format!(
                "| {} | {} | {} | {} |",
                report.store, report.outcome, report.rows, note
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Rebuilds the final file of `date` from the partial files on disk.
pub async fn merge_date_from_disk(
    config: &RunConfig,
    date: ProcessingDate,
) -> Result<Option<MergedDate>> {
    let storage = config.dataset_store();
    let files = storage.list_batch_files(date).await?;
    if files.is_empty() {
        warn!(date = %date, "no batch files to merge");
        return Ok(None);
    }
    let mut partials = Vec::with_capacity(files.len());
    for path in &files {
        partials.push(storage.read_dataset_file(path).await?);
    }
    let merged = merge(partials);
    let stamp = file_stamp(Local::now().naive_local());
    let written = write_merged_date(&storage, date, &merged, &stamp).await?;
    info!(
        date = %date,
        files = files.len(),
        rows = merged.len(),
        path = %written.final_file.path.display(),
        "merged batch files from disk"
    );
    Ok(Some(written))
}

pub async fn clean(config: &RunConfig) -> Result<usize> {
    config.dataset_store().clear_stale_batch_files().await
}

pub async fn run_with_config(config: RunConfig) -> Result<RunSummary> {
    let fixtures_dir = config.resolve(&config.fixtures_dir);
    let factory = FixturePortalFactory::from_dir(&fixtures_dir)
        .with_context(|| format!("loading portal capture from {}", fixtures_dir.display()))?;
    RunPipeline::new(config, Arc::new(factory)).run_once().await
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    run_with_config(RunConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn store(name: &str) -> Store {
        Store {
            name: name.into(),
            works_by_shift: false,
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            active: true,
        }
    }

    fn date() -> ProcessingDate {
        ProcessingDate::parse("14/10/2025").unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RunConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.max_batch_size, 30);
        assert_eq!(config.stagger, Duration::from_secs(10));
        assert_eq!(config.retry_pause, Duration::from_secs(2));
        let policy = config.processor_policy();
        assert_eq!(policy.gate.max_attempts, 3);
        assert_eq!(policy.modal_max_attempts, 3);
        assert_eq!(policy.navigation_max_attempts, 2);
    }

    #[test]
    fn relative_paths_resolve_under_workspace_root() {
        let config = RunConfig {
            workspace_root: PathBuf::from("/srv/cfr"),
            ..RunConfig::default()
        };
        assert_eq!(config.resolve(Path::new("base")), PathBuf::from("/srv/cfr/base"));
        assert_eq!(config.resolve(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(config.dataset_store().root(), Path::new("/srv/cfr/base"));
    }

    #[test]
    fn stores_of_failed_workers_are_reported_pending_in_store_order() {
        let stores = vec![store("A"), store("B"), store("C")];
        let dispatch = DateDispatch {
            results: vec![BatchResult {
                worker: 2,
                reports: vec![StoreReport {
                    store: "C".into(),
                    date: date(),
                    outcome: StoreOutcome::Success,
                    rows: 4,
                    gate_attempts: 1,
                    mismatched_couriers: vec![],
                    reason: None,
                }],
                dataset: ConsolidatedDataset::new(),
                batch_file: None,
            }],
            failures: vec![WorkerFailure {
                worker: 1,
                stores: vec!["A".into(), "B".into()],
                error: "browser did not start".into(),
            }],
        };
        let reports = collect_reports(&stores, &dispatch, date());
        let outcomes = reports.iter().map(|r| (r.store.as_str(), r.outcome)).collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                ("A", StoreOutcome::Pending),
                ("B", StoreOutcome::Pending),
                ("C", StoreOutcome::Success),
            ]
        );
        assert!(reports[0].reason.as_deref().unwrap().contains("worker 1 failed"));
        let counts = OutcomeCounts::tally(&reports);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.success, 1);
    }
}

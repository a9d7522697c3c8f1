//! Batch partitioning, the staggered worker pool and partial-dataset merge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfr_adapters::{Credentials, PortalDriver, SessionFactory};
use cfr_core::{ConsolidatedDataset, ProcessingDate, Store};
use cfr_storage::{DatasetStore, WrittenDataset};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::processor::{ProcessorPolicy, StoreProcessor, StoreReport};

/// Splits stores into disjoint, order-preserving batches of at most
/// `max_batch_size`. One worker falls back to plain chunking.
pub fn partition(stores: &[Store], worker_count: usize, max_batch_size: usize) -> Vec<Vec<Store>> {
    if stores.is_empty() {
        return Vec::new();
    }
    let limit = max_batch_size.max(1);
    let size = if worker_count <= 1 {
        limit
    } else {
        stores.len().div_ceil(worker_count).min(limit)
    };
    stores.chunks(size).map(<[Store]>::to_vec).collect()
}

/// Concatenates partial datasets; row order across workers is not significant.
pub fn merge(partials: impl IntoIterator<Item = ConsolidatedDataset>) -> ConsolidatedDataset {
    let mut merged = ConsolidatedDataset::new();
    for partial in partials {
        merged.extend(partial);
    }
    merged
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub worker: usize,
    pub reports: Vec<StoreReport>,
    pub dataset: ConsolidatedDataset,
    pub batch_file: Option<WrittenDataset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    pub worker: usize,
    pub stores: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct DateDispatch {
    pub results: Vec<BatchResult>,
    pub failures: Vec<WorkerFailure>,
}

async fn close_session(session: &mut dyn PortalDriver, worker: usize) {
    if let Err(err) = session.close().await {
        warn!(worker, error = %err, "closing portal session failed");
    }
}

/// Fixed-size pool that runs one date's batches with a staggered start.
#[derive(Clone)]
pub struct WorkerPool {
    factory: Arc<dyn SessionFactory>,
    credentials: Credentials,
    policy: ProcessorPolicy,
    storage: DatasetStore,
    worker_count: usize,
    stagger: Duration,
}

impl WorkerPool {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        credentials: Credentials,
        policy: ProcessorPolicy,
        storage: DatasetStore,
    ) -> Self {
        Self {
            factory,
            credentials,
            policy,
            storage,
            worker_count: 1,
            stagger: Duration::ZERO,
        }
    }

    pub fn with_workers(mut self, worker_count: usize, stagger: Duration) -> Self {
        self.worker_count = worker_count.max(1);
        self.stagger = stagger;
        self
    }

    /// One worker: a fresh session, every assigned store in order, one partial file.
    pub async fn run_batch(
        &self,
        worker: usize,
        stores: &[Store],
        date: ProcessingDate,
        stamp: &str,
    ) -> Result<BatchResult> {
        let mut session = self
            .factory
            .open_session(worker)
            .await
            .with_context(|| format!("opening portal session for worker {worker}"))?;
        if let Err(err) = session.login(&self.credentials).await {
            close_session(session.as_mut(), worker).await;
            return Err(err).with_context(|| format!("logging in worker {worker}"));
        }
        info!(session = session.session_id(), stores = stores.len(), "worker started");

        let mut processor = StoreProcessor::new(self.policy);
        let mut dataset = ConsolidatedDataset::new();
        let mut reports = Vec::with_capacity(stores.len());
        for store in stores {
            let report = processor
                .process(session.as_mut(), store, date, &mut dataset)
                .await;
            reports.push(report);
        }
        close_session(session.as_mut(), worker).await;

        let batch_file = self
            .storage
            .write_batch_file(worker, date, &dataset, stamp)
            .await
            .with_context(|| format!("writing batch file for worker {worker}"))?;
        Ok(BatchResult {
            worker,
            reports,
            dataset,
            batch_file,
        })
    }

    /// Blocks until every batch for `date` has finished. A failing or
    /// panicking worker is recorded and never aborts its siblings.
    pub async fn dispatch_date(
        &self,
        batches: &[Vec<Store>],
        date: ProcessingDate,
        stamp: &str,
    ) -> Result<DateDispatch> {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(batches.len());

        for (idx, stores) in batches.iter().enumerate() {
            let worker = idx + 1;
            if idx > 0 && !self.stagger.is_zero() {
                tokio::time::sleep(self.stagger).await;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("worker pool semaphore closed")?;

            let pool = self.clone();
            let stamp = stamp.to_string();
            let owned = stores.clone();
            let span = info_span!("worker", worker, date = %date);
            info!(worker, stores = owned.len(), date = %date, "dispatching batch");
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    pool.run_batch(worker, &owned, date, &stamp).await
                }
                .instrument(span),
            );
            let names = stores.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
            handles.push((worker, names, handle));
        }

        let mut dispatch = DateDispatch::default();
        for (worker, stores, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => dispatch.results.push(result),
                Ok(Err(err)) => {
                    error!(worker, date = %date, error = ?err, "worker failed");
                    dispatch.failures.push(WorkerFailure {
                        worker,
                        stores,
                        error: format!("{err:#}"),
                    });
                }
                Err(join_err) => {
                    error!(worker, date = %date, error = %join_err, "worker aborted");
                    dispatch.failures.push(WorkerFailure {
                        worker,
                        stores,
                        error: join_err.to_string(),
                    });
                }
            }
        }
        dispatch.results.sort_by_key(|r| r.worker);
        info!(
            date = %date,
            finished = dispatch.results.len(),
            failed = dispatch.failures.len(),
            "all workers finished"
        );
        Ok(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use async_trait::async_trait;
    use cfr_adapters::{
        DriverError, FixtureArtifact, FixturePortalFactory, FixtureStore, PortalBundle,
    };
    use cfr_core::{DatasetRow, StoreOutcome};
    use chrono::{NaiveTime, Utc};

    use crate::quality::QualityGate;

    fn store(name: &str) -> Store {
        Store {
            name: name.into(),
            works_by_shift: false,
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            active: true,
        }
    }

    fn stores(n: usize) -> Vec<Store> {
        (0..n).map(|i| store(&format!("Loja {i:03}"))).collect()
    }

    fn names(batches: &[Vec<Store>]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.iter().map(|s| s.name.clone()).collect())
            .collect()
    }

    #[test]
    fn partition_is_disjoint_and_covers_every_store() {
        for n in [0usize, 1, 5, 29, 30, 31, 61, 100] {
            for workers in 1..=5 {
                let input = stores(n);
                let batches = partition(&input, workers, 30);
                let flat = batches.iter().flatten().map(|s| s.name.clone()).collect::<Vec<_>>();
                let expected = input.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
                assert_eq!(flat, expected, "n={n} workers={workers}");
                let unique = flat.iter().collect::<HashSet<_>>();
                assert_eq!(unique.len(), flat.len());
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 30));
            }
        }
    }

    #[test]
    fn partition_sizes_follow_worker_count_and_cap() {
        let sizes = |n, w| {
            partition(&stores(n), w, 30)
                .iter()
                .map(Vec::len)
                .collect::<Vec<_>>()
        };
        assert_eq!(sizes(5, 2), vec![3, 2]);
        assert_eq!(sizes(10, 3), vec![4, 4, 2]);
        assert_eq!(sizes(70, 1), vec![30, 30, 10]);
        assert_eq!(sizes(70, 0), vec![30, 30, 10]);
        assert_eq!(sizes(100, 2), vec![30, 30, 30, 10]);
        assert_eq!(names(&partition(&stores(3), 5, 30)).len(), 3);
    }

    #[test]
    fn merge_is_order_independent() {
        let row = |name: &str| DatasetRow {
            courier: name.into(),
            ..DatasetRow::default()
        };
        let a = ConsolidatedDataset::from_rows(vec![row("a"), row("b")]);
        let b = ConsolidatedDataset::from_rows(vec![row("c")]);
        let mut ab = merge(vec![a.clone(), b.clone()]).into_rows();
        let mut ba = merge(vec![b, a]).into_rows();
        ab.sort();
        ba.sort();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 3);
    }

    const SUMMARY: &str = r#"<div id="table-deliverymen-container"><table>
        <thead><tr><th>Entregador</th><th>Pedidos</th><th>Soma</th><th>Pix</th></tr></thead>
        <tbody><tr><td>Ana Souza</td><td>1</td><td>R$ 6,00</td><td>ana@pix</td></tr></tbody>
        </table></div>"#;
    const GRID: &str = r#"<div class="MuiDataGrid-row">
        <div role="cell" data-field="deliverymanFee">R$ 6,00</div>
        <div role="cell" data-field="date">14/out/2025 12h00</div>
        <div role="cell" data-field="deliveryman">Ana Souza</div></div>"#;

    fn bundle(names: &[String]) -> PortalBundle {
        PortalBundle {
            portal_id: "pool".into(),
            captured_at: Utc::now(),
            notes: None,
            stores: names
                .iter()
                .map(|name| FixtureStore {
                    name: name.clone(),
                    inactive: false,
                    failed_selects: 0,
                    failed_summary_opens: 0,
                    summary: Some(FixtureArtifact::inline(SUMMARY)),
                    detail_attempts: vec![vec![FixtureArtifact::inline(GRID)]],
                })
                .collect(),
        }
    }

    /// Fails or panics for one worker id, delegating the rest.
    struct SabotagedFactory {
        inner: FixturePortalFactory,
        failing_worker: usize,
        panic: bool,
    }

    #[async_trait]
    impl SessionFactory for SabotagedFactory {
        async fn open_session(
            &self,
            worker_id: usize,
        ) -> Result<Box<dyn PortalDriver>, DriverError> {
            if worker_id == self.failing_worker {
                if self.panic {
                    panic!("driver crashed for worker {worker_id}");
                }
                return Err(DriverError::Session("browser did not start".into()));
            }
            self.inner.open_session(worker_id).await
        }
    }

    fn policy() -> ProcessorPolicy {
        ProcessorPolicy {
            navigation_max_attempts: 2,
            modal_max_attempts: 3,
            retry_pause: Duration::ZERO,
            gate: QualityGate {
                max_attempts: 3,
                pause: Duration::ZERO,
            },
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            user: "u".into(),
            password: "p".into(),
        }
    }

    async fn dispatch_with(failing_worker: usize, panic: bool) -> (DateDispatch, tempfile::TempDir) {
        let all = stores(6);
        let names = all.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        let factory = SabotagedFactory {
            inner: FixturePortalFactory::new(bundle(&names)),
            failing_worker,
            panic,
        };
        let dir = tempfile::tempdir().unwrap();
        let storage = DatasetStore::new(dir.path(), "resumo_entregadores");
        let pool = WorkerPool::new(Arc::new(factory), credentials(), policy(), storage)
            .with_workers(2, Duration::ZERO);
        let batches = partition(&all, 3, 30);
        let date = ProcessingDate::parse("14/10/2025").unwrap();
        let dispatch = pool
            .dispatch_date(&batches, date, "20251015_083005")
            .await
            .unwrap();
        (dispatch, dir)
    }

    #[tokio::test]
    async fn healthy_pool_processes_every_batch() {
        let (dispatch, dir) = dispatch_with(0, false).await;
        assert!(dispatch.failures.is_empty());
        assert_eq!(dispatch.results.len(), 3);
        let reports = dispatch.results.iter().flat_map(|r| &r.reports).collect::<Vec<_>>();
        assert_eq!(reports.len(), 6);
        assert!(reports.iter().all(|r| r.outcome == StoreOutcome::Success));
        let merged = merge(dispatch.results.into_iter().map(|r| r.dataset));
        assert_eq!(merged.len(), 6);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn failing_worker_is_isolated() {
        let (dispatch, _dir) = dispatch_with(2, false).await;
        assert_eq!(dispatch.results.len(), 2);
        assert_eq!(dispatch.failures.len(), 1);
        let failure = &dispatch.failures[0];
        assert_eq!(failure.worker, 2);
        assert_eq!(failure.stores, vec!["Loja 002".to_string(), "Loja 003".to_string()]);
        assert!(failure.error.contains("browser did not start"));
    }

    #[tokio::test]
    async fn panicking_worker_is_isolated() {
        let (dispatch, _dir) = dispatch_with(1, true).await;
        assert_eq!(dispatch.results.len(), 2);
        assert_eq!(dispatch.failures.len(), 1);
        assert_eq!(dispatch.failures[0].worker, 1);
        let workers = dispatch.results.iter().map(|r| r.worker).collect::<Vec<_>>();
        assert_eq!(workers, vec![2, 3]);
    }
}

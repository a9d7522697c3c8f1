//! Per store, per date state machine driving one portal session.

use std::time::Duration;

use cfr_adapters::{PortalDriver, StoreSelection, SummaryModal};
use cfr_core::{ConsolidatedDataset, ProcessingDate, Store, StoreOutcome, SummaryRow};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::quality::{GateOutcome, QualityGate};
use crate::reconcile::RowContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStep {
    NavigateToStore,
    ApplyFilters,
    OpenSummaryModal,
    QualityGate,
    RecordOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorPolicy {
    pub navigation_max_attempts: usize,
    pub modal_max_attempts: usize,
    pub retry_pause: Duration,
    pub gate: QualityGate,
}

impl Default for ProcessorPolicy {
    fn default() -> Self {
        Self {
            navigation_max_attempts: 2,
            modal_max_attempts: 3,
            retry_pause: Duration::from_secs(2),
            gate: QualityGate::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    pub store: String,
    pub date: ProcessingDate,
    pub outcome: StoreOutcome,
    pub rows: usize,
    pub gate_attempts: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mismatched_couriers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StoreReport {
    pub fn pending(store: &str, date: ProcessingDate, reason: impl Into<String>) -> Self {
        Self {
            store: store.to_string(),
            date,
            outcome: StoreOutcome::Pending,
            rows: 0,
            gate_attempts: 0,
            mismatched_couriers: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Holds the session's currently selected store so consecutive work on
/// the same store skips navigation.
#[derive(Debug)]
pub struct StoreProcessor {
    policy: ProcessorPolicy,
    current_store: Option<String>,
}

impl StoreProcessor {
    pub fn new(policy: ProcessorPolicy) -> Self {
        Self {
            policy,
            current_store: None,
        }
    }

    pub fn current_store(&self) -> Option<&str> {
        self.current_store.as_deref()
    }

    /// Runs every step for one store and appends its rows to `dataset`.
    pub async fn process(
        &mut self,
        driver: &mut dyn PortalDriver,
        store: &Store,
        date: ProcessingDate,
        dataset: &mut ConsolidatedDataset,
    ) -> StoreReport {
        let span = info_span!("store", store = %store.name, date = %date);
        self.run_steps(driver, store, date, dataset)
            .instrument(span)
            .await
    }

    async fn run_steps(
        &mut self,
        driver: &mut dyn PortalDriver,
        store: &Store,
        date: ProcessingDate,
        dataset: &mut ConsolidatedDataset,
    ) -> StoreReport {
        let context = RowContext::for_store(store, date);
        let mut step = StoreStep::NavigateToStore;
        let mut summary: Vec<SummaryRow> = Vec::new();
        let mut gate: Option<GateOutcome> = None;
        let mut pending: Option<String> = None;

        loop {
            step = match step {
                StoreStep::NavigateToStore => match self.navigate(driver, store).await {
                    Ok(StoreSelection::Active) => StoreStep::ApplyFilters,
                    Ok(StoreSelection::Inactive) => {
                        pending = Some("store inactive".to_string());
                        StoreStep::RecordOutcome
                    }
                    Err(reason) => {
                        pending = Some(reason);
                        StoreStep::RecordOutcome
                    }
                },
                StoreStep::ApplyFilters => match self.apply_filters(driver, store, date).await {
                    Ok(()) => StoreStep::OpenSummaryModal,
                    Err(reason) => {
                        pending = Some(reason);
                        StoreStep::RecordOutcome
                    }
                },
                StoreStep::OpenSummaryModal => match self.open_summary(driver).await {
                    Ok(rows) => {
                        summary = rows;
                        StoreStep::QualityGate
                    }
                    Err(reason) => {
                        pending = Some(reason);
                        StoreStep::RecordOutcome
                    }
                },
                StoreStep::QualityGate => {
                    gate = Some(self.policy.gate.run(driver, &summary, &context).await);
                    StoreStep::RecordOutcome
                }
                StoreStep::RecordOutcome => break,
            };
        }

        let report = match gate {
            Some(gate) if pending.is_none() => {
                let before = dataset.len();
                dataset.push_reconciled(&gate.rows);
                let outcome = if gate.quality_warning {
                    StoreOutcome::SuccessWithQualityWarning
                } else {
                    StoreOutcome::Success
                };
                StoreReport {
                    store: store.name.clone(),
                    date,
                    outcome,
                    rows: dataset.len() - before,
                    gate_attempts: gate.attempts,
                    mismatched_couriers: gate.mismatched_couriers(),
                    reason: None,
                }
            }
            _ => StoreReport::pending(
                &store.name,
                date,
                pending.unwrap_or_else(|| "processing did not complete".to_string()),
            ),
        };

        match report.outcome {
            StoreOutcome::Pending => warn!(
                outcome = %report.outcome,
                reason = report.reason.as_deref().unwrap_or_default(),
                "store left pending"
            ),
            _ => info!(
                outcome = %report.outcome,
                rows = report.rows,
                attempts = report.gate_attempts,
                "store processed"
            ),
        }
        report
    }

    async fn pause(&self) {
        if !self.policy.retry_pause.is_zero() {
            tokio::time::sleep(self.policy.retry_pause).await;
        }
    }

    async fn navigate(
        &mut self,
        driver: &mut dyn PortalDriver,
        store: &Store,
    ) -> Result<StoreSelection, String> {
        if self.current_store.as_deref() == Some(store.name.as_str()) {
            return Ok(StoreSelection::Active);
        }
        let max_attempts = self.policy.navigation_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match driver.select_store(&store.name).await {
                Ok(StoreSelection::Inactive) => {
                    self.current_store = Some(store.name.clone());
                    return Ok(StoreSelection::Inactive);
                }
                Ok(StoreSelection::Active) => {
                    self.current_store = Some(store.name.clone());
                    match driver.is_store_inactive().await {
                        Ok(true) => return Ok(StoreSelection::Inactive),
                        Ok(false) => return Ok(StoreSelection::Active),
                        Err(err) => {
                            warn!(attempt, error = %err, "inactive-store check failed");
                            self.current_store = None;
                        }
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "store switch failed");
                    self.current_store = None;
                }
            }
            if attempt < max_attempts {
                self.pause().await;
            }
        }
        Err(format!("could not switch store after {max_attempts} attempts"))
    }

    async fn apply_filters(
        &mut self,
        driver: &mut dyn PortalDriver,
        store: &Store,
        date: ProcessingDate,
    ) -> Result<(), String> {
        let window = date.query_window(store.start_time, store.end_time);
        let max_attempts = self.policy.navigation_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match driver.apply_date_filter(&window).await {
                Ok(()) => {
                    info!(start = %window.start_text(), end = %window.end_text(), "date filter applied");
                    return Ok(());
                }
                Err(err) => warn!(attempt, error = %err, "date filter failed"),
            }
            if attempt < max_attempts {
                self.pause().await;
            }
        }
        self.current_store = None;
        Err(format!("could not apply date filter after {max_attempts} attempts"))
    }

    async fn open_summary(
        &mut self,
        driver: &mut dyn PortalDriver,
    ) -> Result<Vec<SummaryRow>, String> {
        let max_attempts = self.policy.modal_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match driver.open_summary_modal().await {
                Ok(SummaryModal::Opened(rows)) => return Ok(rows),
                Ok(SummaryModal::NotFound) => warn!(attempt, "summary modal not found"),
                Ok(SummaryModal::TimedOut) => warn!(attempt, "summary modal timed out"),
                Err(err) => warn!(attempt, error = %err, "summary modal failed"),
            }
            if attempt < max_attempts {
                self.pause().await;
            }
        }
        Err(format!("summary modal unavailable after {max_attempts} attempts"))
    }
}

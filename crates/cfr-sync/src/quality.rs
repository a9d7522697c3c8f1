//! Quality gate: re-fetch the detail grid until per-courier counts agree.

use std::time::Duration;

use cfr_adapters::DetailSource;
use cfr_core::{QualityVerdict, ReconciledRow, SummaryRow};
use tracing::{debug, info, warn};

use crate::reconcile::{reconcile, Reconciliation, RowContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Attempt(usize),
    Succeeded,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub rows: Vec<ReconciledRow>,
    pub verdicts: Vec<QualityVerdict>,
    pub attempts: usize,
    pub failed_fetches: usize,
    pub quality_warning: bool,
}

impl GateOutcome {
    pub fn mismatched_couriers(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .filter(|v| v.mismatch)
            .map(|v| v.courier.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    pub max_attempts: usize,
    pub pause: Duration,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause: Duration::from_secs(2),
        }
    }
}

impl QualityGate {
    /// Each attempt's reconciliation replaces the previous one; a failed
    /// fetch consumes an attempt and keeps the last good result.
    pub async fn run<S>(
        &self,
        source: &mut S,
        summary: &[SummaryRow],
        context: &RowContext,
    ) -> GateOutcome
    where
        S: DetailSource + ?Sized,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = GateState::Attempt(1);
        let mut latest: Option<Reconciliation> = None;
        let mut attempts = 0usize;
        let mut failed_fetches = 0usize;

        while let GateState::Attempt(attempt) = state {
            attempts = attempt;
            match source.fetch_detail_grid().await {
                Ok(details) => {
                    let result = reconcile(summary, &details, context);
                    if !result.has_mismatch() {
                        debug!(attempt, rows = result.rows.len(), "counts agree");
                        latest = Some(result);
                        state = GateState::Succeeded;
                        continue;
                    }
                    for verdict in result.mismatches() {
                        warn!(
                            attempt,
                            courier = %verdict.courier,
                            expected = ?verdict.expected,
                            actual = verdict.actual,
                            "order count mismatch"
                        );
                    }
                    latest = Some(result);
                }
                Err(err) => {
                    failed_fetches += 1;
                    warn!(attempt, error = %err, "detail grid fetch failed");
                }
            }

            if attempt >= max_attempts {
                state = GateState::Exhausted;
            } else {
                if !self.pause.is_zero() {
                    tokio::time::sleep(self.pause).await;
                }
                state = GateState::Attempt(attempt + 1);
            }
        }

        let quality_warning = state == GateState::Exhausted;
        if quality_warning {
            info!(attempts, failed_fetches, "quality gate exhausted, keeping last attempt");
        }
        let Reconciliation { rows, verdicts } = latest.unwrap_or_default();
        GateOutcome {
            rows,
            verdicts,
            attempts,
            failed_fetches,
            quality_warning,
        }
    }
}

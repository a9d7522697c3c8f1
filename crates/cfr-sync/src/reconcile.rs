//! Left join of the summary modal (control list) against the detail grid.

use std::collections::HashMap;

use cfr_core::{
    normalize_display, DetailRecord, ExpectedCount, JoinKey, ProcessingDate, QualityVerdict,
    ReconciledRow, Store, SummaryRow,
};

/// Store/date columns stamped on every reconciled row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowContext {
    pub filter_date: String,
    pub start_time: String,
    pub end_time: String,
    pub store: String,
}

impl RowContext {
    pub fn for_store(store: &Store, date: ProcessingDate) -> Self {
        Self {
            filter_date: date.to_string(),
            start_time: store.start_label(),
            end_time: store.end_label(),
            store: store.name.clone(),
        }
    }

    fn row(&self, courier: &str, pix_key: &str, detail: Option<DetailRecord>) -> ReconciledRow {
        ReconciledRow {
            courier: courier.to_string(),
            pix_key: pix_key.to_string(),
            filter_date: self.filter_date.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            store: self.store.clone(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub rows: Vec<ReconciledRow>,
    pub verdicts: Vec<QualityVerdict>,
}

impl Reconciliation {
    pub fn has_mismatch(&self) -> bool {
        self.verdicts.iter().any(|v| v.mismatch)
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &QualityVerdict> {
        self.verdicts.iter().filter(|v| v.mismatch)
    }
}

pub fn reconcile(
    summary: &[SummaryRow],
    details: &[DetailRecord],
    context: &RowContext,
) -> Reconciliation {
    let mut index: HashMap<JoinKey, Vec<&DetailRecord>> = HashMap::new();
    for detail in details {
        index.entry(detail.join_key()).or_default().push(detail);
    }

    let mut out = Reconciliation::default();
    for record in summary.iter().filter_map(SummaryRow::as_courier) {
        let key = record.join_key();
        let matches = index.get(&key).map(Vec::as_slice).unwrap_or_default();
        let courier = normalize_display(&record.courier);

        if matches.is_empty() {
            out.rows.push(context.row(&courier, &record.pix_key, None));
        } else {
            out.rows.extend(
                matches
                    .iter()
                    .map(|d| context.row(&courier, &record.pix_key, Some((*d).clone()))),
            );
        }

        let expected = record.expected();
        let actual = matches.len();
        let mismatch = match expected {
            ExpectedCount::Known(count) => count != actual,
            ExpectedCount::Unknown => false,
        };
        out.verdicts.push(QualityVerdict {
            courier,
            key,
            expected,
            actual,
            mismatch,
        });
    }
    out
}

//! Columnar export of a merged date dataset for the downstream dashboard.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use cfr_core::{ConsolidatedDataset, DATASET_HEADER};
use parquet::arrow::ArrowWriter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Column holding the numeric shift payment; the rest stay text.
const PAYMENT_COLUMN: usize = DATASET_HEADER.len() - 1;

fn snapshot_schema() -> Schema {
    let fields = DATASET_HEADER
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            if idx == PAYMENT_COLUMN {
                ArrowField::new(*name, DataType::Float64, true)
            } else {
                ArrowField::new(*name, DataType::Utf8, false)
            }
        })
        .collect::<Vec<_>>();
    Schema::new(fields)
}

pub fn dataset_record_batch(dataset: &ConsolidatedDataset) -> Result<RecordBatch> {
    let schema = Arc::new(snapshot_schema());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(DATASET_HEADER.len());
    for idx in 0..PAYMENT_COLUMN {
        let values = dataset
            .rows()
            .iter()
            .map(|row| Some(row.fields()[idx]))
            .collect::<Vec<_>>();
        columns.push(Arc::new(StringArray::from(values)));
    }
    let payments = dataset
        .rows()
        .iter()
        .map(|row| {
            row.shift_payment
                .trim()
                .parse::<Decimal>()
                .ok()
                .and_then(|d| d.to_f64())
        })
        .collect::<Vec<_>>();
    columns.push(Arc::new(Float64Array::from(payments)));

    RecordBatch::try_new(schema, columns).context("building dataset record batch")
}

pub fn write_dataset_parquet(path: &Path, dataset: &ConsolidatedDataset) -> Result<()> {
    let batch = dataset_record_batch(dataset)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use cfr_core::DatasetRow;

    fn dataset() -> ConsolidatedDataset {
        ConsolidatedDataset::from_rows(vec![
            DatasetRow {
                courier: "Ruan Pablo".into(),
                store: "Loja Centro".into(),
                shift_payment: "100.00".into(),
                ..DatasetRow::default()
            },
            DatasetRow {
                courier: "João Lima".into(),
                shift_payment: "".into(),
                ..DatasetRow::default()
            },
        ])
    }

    #[test]
    fn record_batch_keeps_header_names_and_numeric_payment() {
        let batch = dataset_record_batch(&dataset()).unwrap();
        assert_eq!(batch.num_columns(), DATASET_HEADER.len());
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        assert_eq!(schema.field(0).name(), "Entregador");
        assert_eq!(schema.field(PAYMENT_COLUMN).data_type(), &DataType::Float64);

        let payments = batch
            .column(PAYMENT_COLUMN)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(payments.value(0), 100.0);
        assert!(payments.is_null(1));
    }

    #[test]
    fn parquet_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.parquet");
        write_dataset_parquet(&path, &dataset()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PAR1"));
    }
}

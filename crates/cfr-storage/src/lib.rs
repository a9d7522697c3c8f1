//! Tab-delimited dataset persistence + daily summary log for CFR.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cfr_core::{ConsolidatedDataset, DatasetRow, ProcessingDate, DATASET_HEADER};
use chrono::NaiveDateTime;
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfr-storage";

pub const DATASET_EXTENSION: &str = "csv";
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const FINAL_MARKER: &str = "FINAL";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path}: unexpected header {found:?}")]
    HeaderMismatch { path: PathBuf, found: String },
    #[error("{path}: malformed dataset: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("encoding dataset: {0}")]
    Encode(#[from] csv::Error),
    #[error("{path}:{line}: expected {expected} fields, found {found}")]
    RowWidth {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn file_stamp(at: NaiveDateTime) -> String {
    at.format(FILE_STAMP_FORMAT).to_string()
}

fn dataset_writer() -> csv::Writer<Vec<u8>> {
    WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Necessary)
        .from_writer(Vec::new())
}

/// Fields holding a tab, a quote or a line break are quoted, so every value
/// survives a write and read back unchanged.
pub fn encode_tsv(dataset: &ConsolidatedDataset) -> Result<Vec<u8>, StorageError> {
    let mut writer = dataset_writer();
    writer.write_record(DATASET_HEADER)?;
    for row in dataset.rows() {
        writer.write_record(row.fields())?;
    }
    writer
        .into_inner()
        .map_err(|err| StorageError::Encode(csv::Error::from(err.into_error())))
}

pub fn decode_tsv(bytes: &[u8], path: &Path) -> Result<ConsolidatedDataset, StorageError> {
    let malformed = |source: csv::Error| StorageError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let header = reader.headers().map_err(malformed)?.clone();
    let header_fields = header
        .iter()
        .enumerate()
        .map(|(idx, field)| if idx == 0 { field.trim_start_matches('\u{feff}') } else { field });
    if header_fields.ne(DATASET_HEADER.iter().copied()) {
        return Err(StorageError::HeaderMismatch {
            path: path.to_path_buf(),
            found: header.iter().collect::<Vec<_>>().join("\t"),
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(malformed)?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let fields = record.iter().collect::<Vec<_>>();
        let row = DatasetRow::from_fields(&fields).ok_or_else(|| StorageError::RowWidth {
            path: path.to_path_buf(),
            line: record.position().map_or(0, |pos| pos.line() as usize),
            expected: DATASET_HEADER.len(),
            found: fields.len(),
        })?;
        rows.push(row);
    }
    Ok(ConsolidatedDataset::from_rows(rows))
}

/// Naming + IO for the partial (per worker) and final (per date) dataset files.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
    base_filename: String,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>, base_filename: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_filename: base_filename.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_filename(&self) -> &str {
        &self.base_filename
    }

    pub fn batch_file_name(&self, worker: usize, date: ProcessingDate, stamp: &str) -> String {
        format!(
            "{}_T{worker}_{}_{stamp}.{DATASET_EXTENSION}",
            self.base_filename,
            date.file_slug()
        )
    }

    pub fn final_file_name(&self, date: ProcessingDate, stamp: &str) -> String {
        format!(
            "{}_{FINAL_MARKER}_{}_{stamp}.{DATASET_EXTENSION}",
            self.base_filename,
            date.file_slug()
        )
    }

    /// Worker id and date slug of a partial file name, `None` for anything else.
    pub fn parse_batch_file_name<'a>(&self, file_name: &'a str) -> Option<(usize, &'a str)> {
        let rest = file_name
            .strip_prefix(self.base_filename.as_str())?
            .strip_prefix("_T")?
            .strip_suffix(&format!(".{DATASET_EXTENSION}"))?;
        let (worker, rest) = rest.split_once('_')?;
        let worker = worker.parse::<usize>().ok()?;
        let (slug, _stamp) = rest.split_once('_')?;
        Some((worker, slug))
    }

    fn is_stale_batch_name(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.base_filename.as_str())
            .and_then(|rest| rest.strip_prefix("_T"))
            .is_some_and(|_| file_name.ends_with(&format!(".{DATASET_EXTENSION}")))
    }

    async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<(PathBuf, String)> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))?;
        let target = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dataset file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp dataset file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp dataset file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp dataset {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            });
        }
        Ok((target, sha256_hex(bytes)))
    }

    async fn write_dataset(
        &self,
        file_name: &str,
        dataset: &ConsolidatedDataset,
    ) -> anyhow::Result<WrittenDataset> {
        let body = encode_tsv(dataset)?;
        let (path, content_hash) = self.write_atomic(file_name, &body).await?;
        Ok(WrittenDataset {
            path,
            rows: dataset.len(),
            byte_size: body.len(),
            content_hash,
        })
    }

    /// Writes one worker's partial file. Empty datasets produce no file.
    pub async fn write_batch_file(
        &self,
        worker: usize,
        date: ProcessingDate,
        dataset: &ConsolidatedDataset,
        stamp: &str,
    ) -> anyhow::Result<Option<WrittenDataset>> {
        if dataset.is_empty() {
            warn!(worker, date = %date, "no rows collected, skipping batch file");
            return Ok(None);
        }
        let name = self.batch_file_name(worker, date, stamp);
        let written = self.write_dataset(&name, dataset).await?;
        info!(worker, date = %date, rows = written.rows, path = %written.path.display(), "batch file written");
        Ok(Some(written))
    }

    pub async fn write_final_file(
        &self,
        date: ProcessingDate,
        dataset: &ConsolidatedDataset,
        stamp: &str,
    ) -> anyhow::Result<WrittenDataset> {
        let name = self.final_file_name(date, stamp);
        let written = self.write_dataset(&name, dataset).await?;
        info!(date = %date, rows = written.rows, path = %written.path.display(), "final file written");
        Ok(written)
    }

    async fn file_names(&self) -> anyhow::Result<Vec<String>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking output directory {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Partial files of one date, sorted by name.
    pub async fn list_batch_files(&self, date: ProcessingDate) -> anyhow::Result<Vec<PathBuf>> {
        let slug = date.file_slug();
        let files = self
            .file_names()
            .await?
            .into_iter()
            .filter(|name| {
                self.parse_batch_file_name(name)
                    .is_some_and(|(_, file_slug)| file_slug == slug)
            })
            .map(|name| self.root.join(name))
            .collect::<Vec<_>>();
        debug!(date = %date, files = files.len(), "listed batch files");
        Ok(files)
    }

    pub async fn read_dataset_file(&self, path: &Path) -> anyhow::Result<ConsolidatedDataset> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading dataset {}", path.display()))?;
        Ok(decode_tsv(&bytes, path)?)
    }

    /// Removes every partial file left by earlier runs. Final files stay.
    pub async fn clear_stale_batch_files(&self) -> anyhow::Result<usize> {
        let span = info_span!("clear_stale_batch_files", root = %self.root.display());
        async {
            let mut removed = 0usize;
            for name in self.file_names().await? {
                if !self.is_stale_batch_name(&name) {
                    continue;
                }
                let path = self.root.join(&name);
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %path.display(), "removed stale batch file");
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "could not remove stale batch file")
                    }
                }
            }
            info!(removed, "stale batch cleanup finished");
            Ok::<_, anyhow::Error>(removed)
        }
        .instrument(span)
        .await
    }
}

/// Append-only plain-text log holding one block per processed date.
#[derive(Debug, Clone)]
pub struct SummaryLog {
    path: PathBuf,
}

impl SummaryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, at: NaiveDateTime, level: &str, lines: &[String]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let stamp = at.format("%Y-%m-%d %H:%M:%S");
        let level = level.to_ascii_uppercase();
        let body = lines
            .iter()
            .map(|line| format!("[{stamp}] [{level}] {line}\n"))
            .collect::<String>();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening summary log {}", self.path.display()))?;
        file.write_all(body.as_bytes())
            .await
            .with_context(|| format!("appending summary log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing summary log {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(text: &str) -> ProcessingDate {
        ProcessingDate::parse(text).unwrap()
    }

    fn row(courier: &str, fee: &str) -> DatasetRow {
        DatasetRow {
            courier: courier.into(),
            pix_key: "x@x.com".into(),
            filter_date: "14/10/2025".into(),
            start_time: "18:00".into(),
            end_time: "02:00".into(),
            store: "Loja Centro".into(),
            courier_fee: fee.into(),
            shift_payment: "70.00".into(),
            ..DatasetRow::default()
        }
    }

    fn stamp() -> String {
        file_stamp(
            NaiveDate::from_ymd_opt(2025, 10, 15)
                .unwrap()
                .and_hms_opt(8, 30, 5)
                .unwrap(),
        )
    }

    #[test]
    fn file_names_embed_worker_date_and_stamp() {
        let store = DatasetStore::new("base", "resumo_entregadores");
        let d = date("14/10/2025");
        assert_eq!(
            store.batch_file_name(2, d, &stamp()),
            "resumo_entregadores_T2_14-10-2025_20251015_083005.csv"
        );
        assert_eq!(
            store.final_file_name(d, &stamp()),
            "resumo_entregadores_FINAL_14-10-2025_20251015_083005.csv"
        );
        assert_eq!(
            store.parse_batch_file_name("resumo_entregadores_T12_14-10-2025_20251015_083005.csv"),
            Some((12, "14-10-2025"))
        );
        assert_eq!(
            store.parse_batch_file_name("resumo_entregadores_FINAL_14-10-2025_20251015_083005.csv"),
            None
        );
    }

    #[test]
    fn awkward_field_values_survive_a_round_trip() {
        let mut awkward = row("Ruan \"Rua\" Pablo", "R$ 6,00");
        awkward.store = "Loja\tCentro\nAnexo".into();
        awkward.payment_method = "Pix\r\n".into();
        let dataset = ConsolidatedDataset::from_rows(vec![awkward, row("Ana", "")]);
        let bytes = encode_tsv(&dataset).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("Entregador\tChave Pix\t"));
        assert!(text.contains("\"Loja\tCentro\nAnexo\""));

        let decoded = decode_tsv(&bytes, Path::new("mem.csv")).unwrap();
        assert_eq!(decoded, dataset);
        assert_eq!(decoded.rows()[0].store, "Loja\tCentro\nAnexo");
        assert_eq!(decoded.rows()[0].courier, "Ruan \"Rua\" Pablo");
    }

    #[test]
    fn decoding_rejects_foreign_headers_and_short_rows() {
        let err = decode_tsv(b"a\tb\n", Path::new("bad.csv")).unwrap_err();
        assert!(matches!(err, StorageError::HeaderMismatch { .. }));

        let short = format!("{}\nonly\ttwo\n", DATASET_HEADER.join("\t"));
        let err = decode_tsv(short.as_bytes(), Path::new("short.csv")).unwrap_err();
        assert!(matches!(err, StorageError::RowWidth { line: 2, found: 2, .. }));

        let with_bom = format!("\u{feff}{}\n\n", DATASET_HEADER.join("\t"));
        assert!(decode_tsv(with_bom.as_bytes(), Path::new("bom.csv")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_files_are_listed_per_date_and_cleared_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("base"), "resumo_entregadores");
        let d1 = date("14/10/2025");
        let d2 = date("15/10/2025");
        let dataset = ConsolidatedDataset::from_rows(vec![row("Ruan Pablo", "R$ 6,00")]);

        assert!(store
            .write_batch_file(1, d1, &ConsolidatedDataset::new(), &stamp())
            .await
            .unwrap()
            .is_none());
        let first = store.write_batch_file(1, d1, &dataset, &stamp()).await.unwrap().unwrap();
        assert_eq!(first.rows, 1);
        assert_eq!(first.content_hash.len(), 64);
        store.write_batch_file(2, d1, &dataset, &stamp()).await.unwrap();
        store.write_batch_file(1, d2, &dataset, &stamp()).await.unwrap();
        store.write_final_file(d1, &dataset, &stamp()).await.unwrap();

        let listed = store.list_batch_files(d1).await.unwrap();
        assert_eq!(listed.len(), 2);
        let read_back = store.read_dataset_file(&listed[0]).await.unwrap();
        assert_eq!(read_back, dataset);

        assert_eq!(store.clear_stale_batch_files().await.unwrap(), 3);
        assert!(store.list_batch_files(d1).await.unwrap().is_empty());
        let remaining = std::fs::read_dir(store.root()).unwrap().count();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("absent"), "resumo_entregadores");
        assert!(store.list_batch_files(date("14/10/2025")).await.unwrap().is_empty());
        assert_eq!(store.clear_stale_batch_files().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn summary_log_appends_stamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = SummaryLog::new(dir.path().join("logs").join("daily_summary.log"));
        let at = NaiveDate::from_ymd_opt(2025, 10, 15)
            .unwrap()
            .and_hms_opt(8, 30, 5)
            .unwrap();
        log.append(at, "info", &["first".to_string()]).await.unwrap();
        log.append(at, "warn", &["second".to_string()]).await.unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            text,
            "[2025-10-15 08:30:05] [INFO] first\n[2025-10-15 08:30:05] [WARN] second\n"
        );
    }
}

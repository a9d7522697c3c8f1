//! Portal driver contract + fixture-first portal implementation.
//!
//! The live UI-automation driver lives outside this workspace; everything in
//! the pipeline talks to it through [`PortalDriver`]. [`FixturePortal`]
//! replays captured portal HTML so the pipeline runs offline and in tests.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cfr_core::{normalize_display, DetailRecord, QueryWindow, SummaryRow, MISSING_CELL};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cfr-adapters";

pub const SUMMARY_TABLE_SELECTOR: &str = "#table-deliverymen-container table";
pub const GRID_ROW_SELECTOR: &str = "div.MuiDataGrid-row";

/// Grid `data-field` names in [`DetailRecord`] order.
const GRID_FIELDS: [&str; 7] = [
    "status",
    "amount",
    "deliveryFee",
    "deliverymanFee",
    "date",
    "deliveryman",
    "paymentType",
];

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreSelection {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryModal {
    Opened(Vec<SummaryRow>),
    NotFound,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out waiting for {step}")]
    Timeout { step: String },
    #[error("element not found: {what}")]
    NotFound { what: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session failure: {0}")]
    Session(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait DetailSource: Send {
    /// Every page of the detail grid for the current filter, concatenated.
    async fn fetch_detail_grid(&mut self) -> Result<Vec<DetailRecord>, DriverError>;
}

/// One logged-in UI session. Calls block until the portal reaches the
/// expected state or the driver's own timeout elapses.
#[async_trait]
pub trait PortalDriver: DetailSource {
    fn session_id(&self) -> &str;

    async fn login(&mut self, credentials: &Credentials) -> Result<(), DriverError>;

    async fn select_store(&mut self, name: &str) -> Result<StoreSelection, DriverError>;

    async fn is_store_inactive(&mut self) -> Result<bool, DriverError>;

    async fn apply_date_filter(&mut self, window: &QueryWindow) -> Result<(), DriverError>;

    async fn open_summary_modal(&mut self) -> Result<SummaryModal, DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self, worker_id: usize) -> Result<Box<dyn PortalDriver>, DriverError>;
}

fn selector(css: &str) -> Result<Selector, DriverError> {
    Selector::parse(css).map_err(|e| DriverError::Message(format!("invalid selector {css}: {e}")))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn nested_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(element_text(&n)))
}

fn clean_summary_cell(text: &str, column: usize) -> String {
    match column {
        0 => text.replace('#', "").trim().to_string(),
        2 => text.replace("R$", "").trim().to_string(),
        _ => text.trim().to_string(),
    }
}

/// Reads the summary modal table. `None` when the table is not on the page.
pub fn parse_summary_table(html: &str) -> Result<Option<Vec<SummaryRow>>, DriverError> {
    let document = Html::parse_document(html);
    let table_sel = selector(SUMMARY_TABLE_SELECTOR)?;
    let header_sel = selector("thead tr th")?;
    let row_sel = selector("tbody tr")?;
    let button_sel = selector("button")?;
    let underline_sel = selector("u")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };
    let header_width = table.select(&header_sel).count();

    let mut rows = Vec::new();
    for tr in table.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = tr.children().filter_map(ElementRef::wrap).collect();
        if cells.is_empty() {
            continue;
        }
        let texts = cells
            .iter()
            .enumerate()
            .map(|(column, cell)| {
                let raw = match column {
                    0 | 1 => nested_text(cell, &button_sel).unwrap_or_else(|| element_text(cell)),
                    3 => nested_text(cell, &underline_sel)
                        .or_else(|| text_or_none(element_text(cell)))
                        .unwrap_or_else(|| MISSING_CELL.to_string()),
                    _ => element_text(cell),
                };
                clean_summary_cell(&raw, column)
            })
            .collect::<Vec<_>>();
        rows.push(SummaryRow::from_cells(texts, header_width));
    }
    debug!(rows = rows.len(), header_width, "parsed summary table");
    Ok(Some(rows))
}

/// Reads one rendered page of the detail grid.
pub fn parse_detail_grid(html: &str) -> Result<Vec<DetailRecord>, DriverError> {
    let document = Html::parse_document(html);
    let row_sel = selector(GRID_ROW_SELECTOR)?;
    let field_sels = GRID_FIELDS
        .iter()
        .map(|field| selector(&format!("div[role='cell'][data-field='{field}']")))
        .collect::<Result<Vec<_>, _>>()?;

    let records = document
        .select(&row_sel)
        .map(|row| {
            let mut values = field_sels.iter().map(|sel| {
                row.select(sel)
                    .next()
                    .map(|cell| element_text(&cell))
                    .unwrap_or_default()
            });
            let mut next = || values.next().unwrap_or_default();
            DetailRecord {
                status: next(),
                order_value: next(),
                delivery_fee: next(),
                courier_fee: next(),
                created_at: next(),
                courier: normalize_display(&next()),
                payment_method: next(),
            }
        })
        .collect::<Vec<_>>();
    Ok(records)
}

/// Captured portal state replayed by [`FixturePortal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalBundle {
    pub portal_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub stores: Vec<FixtureStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureStore {
    pub name: String,
    #[serde(default)]
    pub inactive: bool,
    /// Store switches that fail with a transport error before one succeeds.
    #[serde(default)]
    pub failed_selects: u32,
    /// Modal opens that time out before one succeeds.
    #[serde(default)]
    pub failed_summary_opens: u32,
    /// Absent means the summary button never renders.
    #[serde(default)]
    pub summary: Option<FixtureArtifact>,
    /// One entry per detail fetch, each a list of grid pages; the last repeats.
    #[serde(default)]
    pub detail_attempts: Vec<Vec<FixtureArtifact>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureArtifact {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

impl FixtureArtifact {
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            path: None,
            inline_text: Some(text.into()),
        }
    }

    fn text(&self) -> &str {
        self.inline_text.as_deref().unwrap_or_default()
    }
}

pub fn load_portal_bundle(path: impl AsRef<Path>) -> Result<PortalBundle> {
    let path = path.as_ref();
    let mut bundle: PortalBundle = read_json_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for store in &mut bundle.stores {
        if let Some(summary) = &mut store.summary {
            hydrate_artifact(base, summary)?;
        }
        for attempt in &mut store.detail_attempts {
            for page in attempt {
                hydrate_artifact(base, page)?;
            }
        }
    }
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_artifact(base: &Path, artifact: &mut FixtureArtifact) -> Result<()> {
    if artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &artifact.path else {
        return Ok(());
    };
    let raw_path = base.join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture artifact {}", raw_path.display()))?;
    artifact.inline_text = Some(raw);
    Ok(())
}

/// One replay session over a shared [`PortalBundle`].
#[derive(Debug)]
pub struct FixturePortal {
    session_id: String,
    bundle: Arc<PortalBundle>,
    expected: Option<Credentials>,
    logged_in: bool,
    current_store: Option<usize>,
    window: Option<QueryWindow>,
    select_failures: HashMap<usize, u32>,
    summary_opens: HashMap<usize, u32>,
    detail_fetches: HashMap<usize, usize>,
}

impl FixturePortal {
    pub fn new(session_id: impl Into<String>, bundle: Arc<PortalBundle>) -> Self {
        Self {
            session_id: session_id.into(),
            bundle,
            expected: None,
            logged_in: false,
            current_store: None,
            window: None,
            select_failures: HashMap::new(),
            summary_opens: HashMap::new(),
            detail_fetches: HashMap::new(),
        }
    }

    pub fn with_expected_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.expected = credentials;
        self
    }

    pub fn applied_window(&self) -> Option<&QueryWindow> {
        self.window.as_ref()
    }

    fn require_login(&self) -> Result<(), DriverError> {
        if self.logged_in {
            Ok(())
        } else {
            Err(DriverError::Session(format!(
                "session {} is not logged in",
                self.session_id
            )))
        }
    }

    fn filtered_store(&self) -> Result<&FixtureStore, DriverError> {
        self.require_login()?;
        if self.window.is_none() {
            return Err(DriverError::Timeout {
                step: "order report filters".to_string(),
            });
        }
        self.current_store
            .and_then(|idx| self.bundle.stores.get(idx))
            .ok_or_else(|| DriverError::NotFound {
                what: "active store".to_string(),
            })
    }
}

#[async_trait]
impl DetailSource for FixturePortal {
    async fn fetch_detail_grid(&mut self) -> Result<Vec<DetailRecord>, DriverError> {
        let store = self.filtered_store()?;
        let idx = self.current_store.unwrap_or_default();
        let fetch_no = self.detail_fetches.get(&idx).copied().unwrap_or_default();
        let Some(attempt) = store
            .detail_attempts
            .get(fetch_no)
            .or_else(|| store.detail_attempts.last())
        else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for page in attempt {
            records.extend(parse_detail_grid(page.text())?);
        }
        debug!(
            session = %self.session_id,
            store = %store.name,
            fetch_no,
            pages = attempt.len(),
            records = records.len(),
            "replayed detail grid"
        );
        *self.detail_fetches.entry(idx).or_default() += 1;
        Ok(records)
    }
}

#[async_trait]
impl PortalDriver for FixturePortal {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<(), DriverError> {
        if let Some(expected) = &self.expected {
            if expected != credentials {
                return Err(DriverError::Session(format!(
                    "login rejected for {}",
                    credentials.user
                )));
            }
        }
        self.logged_in = true;
        Ok(())
    }

    async fn select_store(&mut self, name: &str) -> Result<StoreSelection, DriverError> {
        self.require_login()?;
        let Some(idx) = self.bundle.stores.iter().position(|s| s.name == name) else {
            return Err(DriverError::NotFound {
                what: format!("store menu entry {name}"),
            });
        };
        let store = &self.bundle.stores[idx];
        let failures = self.select_failures.entry(idx).or_default();
        if *failures < store.failed_selects {
            *failures += 1;
            self.current_store = None;
            return Err(DriverError::Transport(format!(
                "portal went offline while switching to {name}"
            )));
        }
        self.current_store = Some(idx);
        self.window = None;
        if store.inactive {
            Ok(StoreSelection::Inactive)
        } else {
            Ok(StoreSelection::Active)
        }
    }

    async fn is_store_inactive(&mut self) -> Result<bool, DriverError> {
        self.require_login()?;
        Ok(self
            .current_store
            .and_then(|idx| self.bundle.stores.get(idx))
            .map(|s| s.inactive)
            .unwrap_or(false))
    }

    async fn apply_date_filter(&mut self, window: &QueryWindow) -> Result<(), DriverError> {
        self.require_login()?;
        if self.current_store.is_none() {
            return Err(DriverError::NotFound {
                what: "order report".to_string(),
            });
        }
        self.window = Some(*window);
        Ok(())
    }

    async fn open_summary_modal(&mut self) -> Result<SummaryModal, DriverError> {
        let store = self.filtered_store()?;
        let failed_opens = store.failed_summary_opens;
        let summary = store.summary.clone();
        let idx = self.current_store.unwrap_or_default();
        let opens = self.summary_opens.entry(idx).or_default();
        *opens += 1;
        if *opens <= failed_opens {
            return Ok(SummaryModal::TimedOut);
        }
        let Some(summary) = summary else {
            return Ok(SummaryModal::NotFound);
        };
        match parse_summary_table(summary.text())? {
            Some(rows) => Ok(SummaryModal::Opened(rows)),
            None => Ok(SummaryModal::NotFound),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.logged_in = false;
        self.current_store = None;
        self.window = None;
        Ok(())
    }
}

/// Opens independent [`FixturePortal`] sessions, one per worker.
#[derive(Debug, Clone)]
pub struct FixturePortalFactory {
    bundle: Arc<PortalBundle>,
    expected: Option<Credentials>,
}

impl FixturePortalFactory {
    pub fn new(bundle: PortalBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
            expected: None,
        }
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = dir.as_ref().join("bundle.json");
        Ok(Self::new(load_portal_bundle(path)?))
    }

    pub fn with_expected_credentials(mut self, credentials: Credentials) -> Self {
        self.expected = Some(credentials);
        self
    }

    pub fn bundle(&self) -> &PortalBundle {
        &self.bundle
    }
}

#[async_trait]
impl SessionFactory for FixturePortalFactory {
    async fn open_session(&self, worker_id: usize) -> Result<Box<dyn PortalDriver>, DriverError> {
        let session = FixturePortal::new(
            format!("{}-T{worker_id}", self.bundle.portal_id),
            Arc::clone(&self.bundle),
        )
        .with_expected_credentials(self.expected.clone());
        Ok(Box::new(session))
    }
}

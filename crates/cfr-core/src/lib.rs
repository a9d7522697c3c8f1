//! Core domain model, name/money/date normalization and shift pay rules for CFR.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

pub const CRATE_NAME: &str = "cfr-core";

/// Courier key of the summary row that closes the control table.
pub const TOTAL_KEY: &str = "total";
pub const DATE_FORMAT: &str = "%d/%m/%Y";
pub const TIME_FORMAT: &str = "%H:%M";
/// Placeholder the portal shows for an empty summary cell.
pub const MISSING_CELL: &str = "-";

/// Leading role tokens the portal prepends to courier names.
const ROLE_PREFIXES: &[&str] = &["mp", "gg"];
const STRIPPED_KEY_CHARS: &[char] = &['#', '-', '\'', '(', ')'];
const MONTHS_PT: [&str; 12] = [
    "jan", "fev", "mar", "abr", "mai", "jun", "jul", "ago", "set", "out", "nov", "dez",
];

/// Column order of every persisted dataset file.
pub const DATASET_HEADER: [&str; 15] = [
    "Entregador",
    "Chave Pix",
    "Data Filtro",
    "Hora Início Filtro",
    "Hora Fim Filtro",
    "Loja",
    "Status",
    "Valor do pedido",
    "Taxa de entrega",
    "Taxa do entregador",
    "Data de Criação",
    "Pagamento",
    "Classificação do Turno",
    "Classificação do Dia",
    "Pagamento por Turno",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub works_by_shift: bool,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active: bool,
}

impl Store {
    pub fn start_label(&self) -> String {
        self.start_time.format(TIME_FORMAT).to_string()
    }

    pub fn end_label(&self) -> String {
        self.end_time.format(TIME_FORMAT).to_string()
    }
}

/// Calendar day a run extracts, written `DD/MM/YYYY` everywhere it is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessingDate(NaiveDate);

impl ProcessingDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn parse(text: &str) -> Option<Self> {
        NaiveDate::parse_from_str(text.trim(), DATE_FORMAT)
            .ok()
            .map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn weekday(&self) -> Weekday {
        self.0.weekday()
    }

    pub fn next_day(&self) -> Self {
        self.0.succ_opt().map(Self).unwrap_or(*self)
    }

    /// `DD-MM-YYYY`, safe to embed in file names.
    pub fn file_slug(&self) -> String {
        self.0.format("%d-%m-%Y").to_string()
    }

    /// Query window `[date@start, date+1@end]`; shifts may cross midnight.
    pub fn query_window(&self, start: NaiveTime, end: NaiveTime) -> QueryWindow {
        QueryWindow {
            start: self.0.and_time(start),
            end: self.next_day().0.and_time(end),
        }
    }
}

impl fmt::Display for ProcessingDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl Serialize for ProcessingDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl QueryWindow {
    pub fn start_text(&self) -> String {
        self.start.format("%d/%m/%Y %H:%M").to_string()
    }

    pub fn end_text(&self) -> String {
        self.end.format("%d/%m/%Y %H:%M").to_string()
    }
}

/// Normalized courier identity used to join the summary and detail views.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct JoinKey(String);

impl JoinKey {
    pub fn from_raw(raw: &str) -> Self {
        normalize_key(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_total(&self) -> bool {
        self.0 == TOTAL_KEY
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One courier line of the summary modal, the ground truth for order counts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlRecord {
    pub courier: String,
    pub expected_count: String,
    pub fee_total: String,
    pub pix_key: String,
}

impl ControlRecord {
    pub fn join_key(&self) -> JoinKey {
        normalize_key(&self.courier)
    }

    pub fn expected(&self) -> ExpectedCount {
        match self.expected_count.trim().parse::<usize>() {
            Ok(count) => ExpectedCount::Known(count),
            Err(_) => ExpectedCount::Unknown,
        }
    }
}

/// Summary modal body row. The closing `total` row never takes part in
/// count verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryRow {
    Courier(ControlRecord),
    Total { cells: Vec<String> },
}

impl SummaryRow {
    /// Courier rows narrower than the header are padded with [`MISSING_CELL`].
    pub fn from_cells(mut cells: Vec<String>, header_width: usize) -> Self {
        let courier = cells.first().map(String::as_str).unwrap_or_default();
        if normalize_key(courier).is_total() {
            return SummaryRow::Total { cells };
        }
        if cells.len() < header_width {
            cells.resize(header_width, MISSING_CELL.to_string());
        }
        let mut cells = cells.into_iter();
        let mut next = || cells.next().unwrap_or_else(|| MISSING_CELL.to_string());
        SummaryRow::Courier(ControlRecord {
            courier: next(),
            expected_count: next(),
            fee_total: next(),
            pix_key: next(),
        })
    }

    pub fn as_courier(&self) -> Option<&ControlRecord> {
        match self {
            SummaryRow::Courier(record) => Some(record),
            SummaryRow::Total { .. } => None,
        }
    }
}

/// One order line of the paginated detail grid, kept as displayed text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetailRecord {
    pub status: String,
    pub order_value: String,
    pub delivery_fee: String,
    pub courier_fee: String,
    pub created_at: String,
    pub courier: String,
    pub payment_method: String,
}

impl DetailRecord {
    pub fn join_key(&self) -> JoinKey {
        normalize_key(&self.courier)
    }

    pub fn creation_timestamp(&self) -> Option<NaiveDateTime> {
        parse_local_datetime(&self.created_at)
    }

    pub fn courier_fee_amount(&self) -> Option<Decimal> {
        parse_currency(&self.courier_fee)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedCount {
    Known(usize),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub courier: String,
    pub key: JoinKey,
    pub expected: ExpectedCount,
    pub actual: usize,
    pub mismatch: bool,
}

/// Left-join output: a control record paired with at most one detail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledRow {
    pub courier: String,
    pub pix_key: String,
    pub filter_date: String,
    pub start_time: String,
    pub end_time: String,
    pub store: String,
    pub detail: Option<DetailRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreOutcome {
    Success,
    SuccessWithQualityWarning,
    Pending,
}

impl StoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOutcome::Success => "SUCCESS",
            StoreOutcome::SuccessWithQualityWarning => "SUCCESS_WITH_QUALITY_WARNING",
            StoreOutcome::Pending => "PENDING",
        }
    }
}

impl fmt::Display for StoreOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shift {
    Dawn,
    Morning,
    Night,
}

impl Shift {
    pub fn from_time(time: NaiveTime) -> Self {
        match time.hour() {
            0..=6 => Shift::Dawn,
            7..=17 => Shift::Morning,
            _ => Shift::Night,
        }
    }

    /// Label written to the dataset.
    pub fn label(&self) -> &'static str {
        match self {
            Shift::Dawn => "madrugada",
            Shift::Morning => "manhã",
            Shift::Night => "noite",
        }
    }
}

/// Lowercases, drops `# - ' ( )`, one leading role token (ended by a space
/// or a digit), one leading number, then every whitespace character.
pub fn normalize_key(raw: &str) -> JoinKey {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| !STRIPPED_KEY_CHARS.contains(c))
        .collect();
    let mut rest = lowered.trim_start();
    for prefix in ROLE_PREFIXES {
        if let Some(tail) = rest.strip_prefix(prefix) {
            if tail.starts_with(|c: char| c.is_whitespace() || c.is_ascii_digit()) {
                rest = tail.trim_start();
                break;
            }
        }
    }
    rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    JoinKey(rest.chars().filter(|c| !c.is_whitespace()).collect())
}

/// Human-readable courier name: no leading `#`, single spaces, trimmed.
pub fn normalize_display(raw: &str) -> String {
    let trimmed = raw.trim_start();
    let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed);
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses `R$ 1.234,56` style amounts. Blank or malformed text is `None`,
/// never zero.
pub fn parse_currency(text: &str) -> Option<Decimal> {
    let compact: String = text
        .replace("R$", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let (negative, digits) = match compact.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, compact.as_str()),
    };
    if digits.is_empty()
        || !digits.starts_with(|c: char| c.is_ascii_digit())
        || !digits.ends_with(|c: char| c.is_ascii_digit())
        || !digits.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
        || digits.matches(',').count() > 1
        || digits.split_once(',').is_some_and(|(_, cents)| cents.contains('.'))
    {
        return None;
    }
    let normalized = digits.replace('.', "").replace(',', ".");
    let value = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -value } else { value })
}

/// Parses the grid's creation stamp, e.g. `14/out/2025 17h09`.
pub fn parse_local_datetime(text: &str) -> Option<NaiveDateTime> {
    let lowered = text.trim().to_lowercase();
    let (date_part, time_part) = lowered.split_once(char::is_whitespace)?;
    let mut segments = date_part.split('/');
    let (day, month, year) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let month = match MONTHS_PT.iter().position(|m| month.starts_with(m)) {
        Some(idx) => format!("{:02}", idx + 1),
        None => month.to_string(),
    };
    let time = time_part.trim().replace('h', ":");
    NaiveDateTime::parse_from_str(&format!("{day}/{month}/{year} {time}"), "%d/%m/%Y %H:%M").ok()
}

pub fn classify_shift(created_at: &str) -> Option<Shift> {
    parse_local_datetime(created_at).map(|ts| Shift::from_time(ts.time()))
}

pub fn classify_day(filter_date: &str) -> Option<Weekday> {
    ProcessingDate::parse(filter_date).map(|d| d.weekday())
}

pub fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "segunda",
        Weekday::Tue => "terça",
        Weekday::Wed => "quarta",
        Weekday::Thu => "quinta",
        Weekday::Fri => "sexta",
        Weekday::Sat => "sábado",
        Weekday::Sun => "domingo",
    }
}

/// Flat per-order shift pay.
pub fn compute_payment(day: Weekday, shift: Option<Shift>) -> Decimal {
    let weekend = matches!(day, Weekday::Sat | Weekday::Sun);
    match (weekend, shift) {
        (true, Some(Shift::Morning | Shift::Night)) => Decimal::new(8000, 2),
        (true, Some(Shift::Dawn)) => Decimal::new(10000, 2),
        (false, Some(Shift::Morning | Shift::Night)) => Decimal::new(7000, 2),
        (false, Some(Shift::Dawn)) => Decimal::new(9000, 2),
        (_, None) => Decimal::new(0, 2),
    }
}

/// Persisted row: reconciled fields plus the derived shift/day/pay columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DatasetRow {
    pub courier: String,
    pub pix_key: String,
    pub filter_date: String,
    pub start_time: String,
    pub end_time: String,
    pub store: String,
    pub status: String,
    pub order_value: String,
    pub delivery_fee: String,
    pub courier_fee: String,
    pub created_at: String,
    pub payment_method: String,
    pub shift: String,
    pub day: String,
    pub shift_payment: String,
}

impl DatasetRow {
    pub fn classify(row: &ReconciledRow) -> Self {
        let detail = row.detail.clone().unwrap_or_default();
        let shift = classify_shift(&detail.created_at);
        let day = classify_day(&row.filter_date);
        let payment = match day {
            Some(day) => compute_payment(day, shift),
            None => Decimal::new(0, 2),
        };
        Self {
            courier: row.courier.clone(),
            pix_key: row.pix_key.clone(),
            filter_date: row.filter_date.clone(),
            start_time: row.start_time.clone(),
            end_time: row.end_time.clone(),
            store: row.store.clone(),
            status: detail.status,
            order_value: detail.order_value,
            delivery_fee: detail.delivery_fee,
            courier_fee: detail.courier_fee,
            created_at: detail.created_at,
            payment_method: detail.payment_method,
            shift: shift.map(|s| s.label().to_string()).unwrap_or_default(),
            day: day.map(|d| weekday_label(d).to_string()).unwrap_or_default(),
            shift_payment: payment.round_dp(2).to_string(),
        }
    }

    pub fn fields(&self) -> [&str; 15] {
        [
            &self.courier,
            &self.pix_key,
            &self.filter_date,
            &self.start_time,
            &self.end_time,
            &self.store,
            &self.status,
            &self.order_value,
            &self.delivery_fee,
            &self.courier_fee,
            &self.created_at,
            &self.payment_method,
            &self.shift,
            &self.day,
            &self.shift_payment,
        ]
    }

    pub fn from_fields(fields: &[&str]) -> Option<Self> {
        let [courier, pix_key, filter_date, start_time, end_time, store, status, order_value, delivery_fee, courier_fee, created_at, payment_method, shift, day, shift_payment] =
            fields
        else {
            return None;
        };
        Some(Self {
            courier: courier.to_string(),
            pix_key: pix_key.to_string(),
            filter_date: filter_date.to_string(),
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            store: store.to_string(),
            status: status.to_string(),
            order_value: order_value.to_string(),
            delivery_fee: delivery_fee.to_string(),
            courier_fee: courier_fee.to_string(),
            created_at: created_at.to_string(),
            payment_method: payment_method.to_string(),
            shift: shift.to_string(),
            day: day.to_string(),
            shift_payment: shift_payment.to_string(),
        })
    }

    pub fn is_total(&self) -> bool {
        self.courier.trim().eq_ignore_ascii_case(TOTAL_KEY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FeeTotals {
    pub courier_fee_total: Decimal,
    pub parsed_rows: usize,
    pub blank_rows: usize,
    pub unparsable_rows: usize,
}

/// Rows of one batch or one merged date. Total rows never enter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsolidatedDataset {
    rows: Vec<DatasetRow>,
}

impl ConsolidatedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = DatasetRow>) -> Self {
        Self {
            rows: rows.into_iter().filter(|r| !r.is_total()).collect(),
        }
    }

    pub fn push_reconciled(&mut self, rows: &[ReconciledRow]) {
        self.rows.extend(
            rows.iter()
                .filter(|r| !normalize_key(&r.courier).is_total())
                .map(DatasetRow::classify),
        );
    }

    pub fn extend(&mut self, other: ConsolidatedDataset) {
        self.rows.extend(other.rows);
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<DatasetRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fee_totals(&self) -> FeeTotals {
        let mut totals = FeeTotals::default();
        for row in &self.rows {
            if row.courier_fee.trim().is_empty() {
                totals.blank_rows += 1;
                continue;
            }
            match parse_currency(&row.courier_fee) {
                Some(fee) => {
                    totals.courier_fee_total += fee;
                    totals.parsed_rows += 1;
                }
                None => totals.unparsable_rows += 1,
            }
        }
        totals
    }
}

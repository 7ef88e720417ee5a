//! Core domain types for the PartGen pipeline.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output column holding the generated SEO title.
pub const WEB_TITLE_COLUMN: &str = "WEB TITLE";

/// Output column holding the generated technical description.
pub const WEB_DESCRIPTION_COLUMN: &str = "WEB DESCRIPTION";

/// Identity column assumed when no column mapping is available.
pub const DEFAULT_PART_NUMBER_COLUMN: &str = "Part Number";

/// Manufacturer column assumed when no column mapping is available.
pub const DEFAULT_MANUFACTURER_COLUMN: &str = "Manufacturer";

/// Manufacturer used when a row has none.
pub const UNKNOWN_MANUFACTURER: &str = "Unknown Manufacturer";

/// Header prefix of placeholder columns produced by malformed source files.
pub const UNNAMED_COLUMN_PREFIX: &str = "Unnamed:";

/// Title marker written for rows without an identity value.
pub const SKIPPED_MARKER: &str = "SKIPPED";

/// Title marker written for rows that failed processing.
pub const ERROR_MARKER: &str = "ERROR";

/// Maximum title length enforced on every generated title.
pub const MAX_TITLE_LEN: usize = 80;

/// Whether a cell value is empty or one of the null-ish placeholder tokens.
pub fn is_null_token(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || ["N/A", "NA", "N / A"]
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

/// Whether a column is one of the two generated output columns.
pub fn is_output_column(name: &str) -> bool {
    name == WEB_TITLE_COLUMN || name == WEB_DESCRIPTION_COLUMN
}

/// Whether a column is an auto-generated placeholder from a malformed file.
pub fn is_artifact_column(name: &str) -> bool {
    name.trim().is_empty() || name.starts_with(UNNAMED_COLUMN_PREFIX)
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 identifying one bulk run in logs (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// One input record: cell values in table column order.
///
/// Cells are coerced to strings at read time. Lookups see an empty or
/// whitespace-only cell as `None`; the cell text as read is kept alongside
/// for writing the row back out. The column list is shared by every row of
/// a table.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
    raw: Vec<String>,
}

impl Row {
    /// Build a row from cell text, padding or truncating to the column
    /// count. Blank cells read as `None` but keep their text in [`Row::raw`].
    pub fn from_cells<I, S>(columns: Arc<Vec<String>>, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw: Vec<String> = cells.into_iter().map(|cell| cell.as_ref().to_string()).collect();
        raw.resize(columns.len(), String::new());
        let values = raw
            .iter()
            .map(|cell| (!cell.trim().is_empty()).then(|| cell.clone()))
            .collect();
        Self { columns, values, raw }
    }

    /// Column names, in table order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Cell values, in table order; blank cells are `None`.
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Cell text exactly as read, in table order.
    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    /// Value of `column`, if the column exists and the cell is non-empty.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values[idx].as_deref()
    }

    /// Trimmed, non-empty value of `column`.
    pub fn get_trimmed(&self, column: &str) -> Option<&str> {
        self.get(column)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Whether the table has a column named `column`.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Iterate `(column, value)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.as_str(), v.as_deref()))
    }
}

// ---------------------------------------------------------------------------
// ColumnMapping
// ---------------------------------------------------------------------------

/// Which input columns hold identity and specification data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub part_number_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_column: Option<String>,
    #[serde(default)]
    pub spec_columns: Vec<String>,
}

// ---------------------------------------------------------------------------
// SpecMap
// ---------------------------------------------------------------------------

/// Ordered label → value mapping of product specifications.
///
/// Null-ish values are never stored. Re-inserting a label overwrites its
/// value in place, keeping the label's original position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecMap(IndexMap<String, String>);

impl SpecMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a field. Returns `false` if the value was null-ish
    /// and therefore dropped.
    pub fn insert(&mut self, label: impl Into<String>, value: impl AsRef<str>) -> bool {
        let value = value.as_ref().trim();
        if is_null_token(value) {
            return false;
        }
        self.0.insert(label.into(), value.to_string());
        true
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    pub fn contains_key(&self, label: &str) -> bool {
        self.0.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// A generated SEO title and technical description for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub title: String,
    pub description: String,
}

impl GenerationResult {
    /// Minimally valid output built only from the product identity.
    pub fn fallback(part_number: &str, manufacturer: &str) -> Self {
        Self {
            title: format!("{part_number} - {manufacturer} Product"),
            description: format!(
                "Technical specifications and product details for {part_number} manufactured by \
                 {manufacturer}. Product information and specifications available upon request."
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessingStats
// ---------------------------------------------------------------------------

/// Run counters shared by all workers.
#[derive(Debug)]
pub struct ProcessingStats {
    processed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    started_at: DateTime<Utc>,
    finished_at: OnceLock<DateTime<Utc>>,
}

impl ProcessingStats {
    /// Start a new set of counters, stamped with the current time.
    pub fn start() -> Self {
        Self {
            processed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            started_at: Utc::now(),
            finished_at: OnceLock::new(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamp the end time. Later calls keep the first stamp.
    pub fn finish(&self) {
        let _ = self.finished_at.set(Utc::now());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            started_at: self.started_at,
            finished_at: self.finished_at.get().copied(),
        }
    }
}

impl Default for ProcessingStats {
    fn default() -> Self {
        Self::start()
    }
}

/// Point-in-time copy of [`ProcessingStats`] for summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Rows accounted for in any counter.
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped
    }

    /// Wall-clock duration; runs up to now when the run has not finished.
    pub fn duration(&self) -> std::time::Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Successfully processed items per second, if any time has elapsed.
    pub fn items_per_second(&self) -> Option<f64> {
        let secs = self.duration().as_secs_f64();
        (secs > 0.0).then(|| self.processed as f64 / secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Arc<Vec<String>> {
        Arc::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn null_tokens() {
        assert!(is_null_token(""));
        assert!(is_null_token("  "));
        assert!(is_null_token("N/A"));
        assert!(is_null_token("n/a"));
        assert!(is_null_token("NA"));
        assert!(is_null_token(" N / A "));
        assert!(!is_null_token("NAV"));
        assert!(!is_null_token("0"));
    }

    #[test]
    fn row_lookup_and_blank_cells() {
        let row = Row::from_cells(columns(&["Part Number", "Manufacturer", "Notes"]), ["X100", "  ", "ok"]);
        assert_eq!(row.get("Part Number"), Some("X100"));
        assert_eq!(row.get("Manufacturer"), None);
        assert_eq!(row.get("Missing"), None);
        assert!(row.has_column("Notes"));
        assert_eq!(row.iter().count(), 3);
    }

    #[test]
    fn row_pads_short_records() {
        let row = Row::from_cells(columns(&["A", "B", "C"]), ["1"]);
        assert_eq!(row.values().len(), 3);
        assert_eq!(row.get("C"), None);
        assert_eq!(row.raw(), &["1", "", ""]);
    }

    #[test]
    fn blank_cells_keep_their_text() {
        let row = Row::from_cells(columns(&["Part Number", "Notes"]), ["X100", "   "]);
        assert_eq!(row.get("Notes"), None);
        assert_eq!(row.raw(), &["X100", "   "]);

        let truncated = Row::from_cells(columns(&["A"]), ["1", "extra"]);
        assert_eq!(truncated.raw(), &["1"]);
        assert_eq!(truncated.values().len(), 1);
    }

    #[test]
    fn spec_map_overwrite_keeps_position() {
        let mut specs = SpecMap::new();
        specs.insert("A", "1");
        specs.insert("B", "2");
        specs.insert("A", "3");
        let labels: Vec<_> = specs.iter().map(|(k, _)| k).collect();
        assert_eq!(labels, vec!["A", "B"]);
        assert_eq!(specs.get("A"), Some("3"));
    }

    #[test]
    fn spec_map_drops_null_values() {
        let mut specs = SpecMap::new();
        assert!(!specs.insert("Voltage", "N/A"));
        assert!(!specs.insert("Poles", ""));
        assert!(specs.insert("Amperage", " 100A "));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs.get("Amperage"), Some("100A"));
    }

    #[test]
    fn fallback_mentions_identity() {
        let result = GenerationResult::fallback("X100", "Acme");
        assert!(result.title.contains("X100"));
        assert!(result.title.contains("Acme"));
        assert!(!result.description.is_empty());
    }

    #[test]
    fn stats_counters() {
        let stats = ProcessingStats::start();
        stats.record_processed();
        stats.record_processed();
        stats.record_failed();
        stats.record_skipped();
        stats.finish();
        let snap = stats.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.total(), 4);
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn stats_concurrent_increments() {
        let stats = Arc::new(ProcessingStats::start());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_processed();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().processed, 8000);
    }

    #[test]
    fn run_id_display() {
        let id = RunId::new();
        assert_eq!(id.to_string(), id.0.to_string());
    }
}

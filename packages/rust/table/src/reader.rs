use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use partgen_shared::{PartGenError, Result, Row, is_artifact_column};

const BOM: char = '\u{feff}';

/// Which step of the decoding chain produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// Invalid UTF-8; every byte was mapped to the code point of equal value.
    Latin1,
}

impl std::fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "latin-1",
        })
    }
}

/// Decode raw file bytes: UTF-8, falling back to Latin-1.
///
/// Latin-1 maps every byte, so decoding never fails and never substitutes
/// U+FFFD. Windows-1252 punctuation (0x80 to 0x9F) survives as the C1 code
/// point of the same value.
pub fn decode(bytes: &[u8]) -> (Cow<'_, str>, TextEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), TextEncoding::Utf8),
        Err(_) => (
            Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
            TextEncoding::Latin1,
        ),
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// An in-memory table of string cells.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Arc<Vec<String>>,
    rows: Vec<Row>,
    encoding: TextEncoding,
    source: Option<PathBuf>,
}

impl Table {
    /// Build a table from literal records (ragged records are padded).
    pub fn from_records<C, R, S>(columns: C, records: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator,
        R::Item: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let columns: Arc<Vec<String>> = Arc::new(columns.into_iter().map(Into::into).collect());
        let rows = records
            .into_iter()
            .map(|cells| Row::from_cells(columns.clone(), cells))
            .collect();
        Self {
            columns,
            rows,
            encoding: TextEncoding::Utf8,
            source: None,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Shared handle to the column list.
    pub fn columns_arc(&self) -> Arc<Vec<String>> {
        self.columns.clone()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// The first `n` rows (fewer if the table is shorter).
    pub fn sample_rows(&self, n: usize) -> &[Row] {
        &self.rows[..n.min(self.rows.len())]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// File the table was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read and decode a delimited file.
pub fn read_table(path: &Path, delimiter: u8) -> Result<Table> {
    let bytes = std::fs::read(path).map_err(|e| PartGenError::io(path, e))?;
    let mut table = parse_table(&bytes, delimiter)?;
    table.source = Some(path.to_path_buf());

    if table.encoding != TextEncoding::Utf8 {
        warn!(path = %path.display(), encoding = %table.encoding, "input is not valid UTF-8");
    }
    debug!(
        path = %path.display(),
        columns = table.columns.len(),
        rows = table.rows.len(),
        "table loaded"
    );
    Ok(table)
}

/// Parse a delimited table from raw bytes.
///
/// Header names are trimmed. Columns with an empty header or an `Unnamed:`
/// placeholder header are dropped. Records longer or shorter than the header
/// are truncated or padded.
pub fn parse_table(bytes: &[u8], delimiter: u8) -> Result<Table> {
    let (decoded, encoding) = decode(bytes);
    let text = decoded.strip_prefix(BOM).unwrap_or(decoded.as_ref());

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PartGenError::Table(format!("failed to read header: {e}")))?
        .clone();

    let kept: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (i, name.trim().to_string()))
        .filter(|(_, name)| !is_artifact_column(name))
        .collect();

    let dropped = headers.len() - kept.len();
    if dropped > 0 {
        debug!(dropped, "dropped unnamed columns");
    }

    let columns: Arc<Vec<String>> = Arc::new(kept.iter().map(|(_, name)| name.clone()).collect());

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            PartGenError::Table(format!("malformed record {}: {e}", line + 1))
        })?;
        let cells = kept.iter().map(|(i, _)| record.get(*i).unwrap_or(""));
        rows.push(Row::from_cells(columns.clone(), cells));
    }

    Ok(Table {
        columns,
        rows,
        encoding,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_with_bom() {
        let bytes = "\u{feff}Part Number,Manufacturer\nX100,Acme\n".as_bytes();
        let table = parse_table(bytes, b',').unwrap();
        assert_eq!(table.columns(), &["Part Number", "Manufacturer"]);
        assert_eq!(table.encoding(), TextEncoding::Utf8);
        assert_eq!(table.rows()[0].get("Part Number"), Some("X100"));
    }

    #[test]
    fn latin1_fallback() {
        // "Caf\xe9" is invalid UTF-8 but clean Latin-1.
        let bytes = b"Part Number,Notes\nX100,Caf\xe9\n";
        let table = parse_table(bytes, b',').unwrap();
        assert_eq!(table.encoding(), TextEncoding::Latin1);
        assert_eq!(table.rows()[0].get("Notes"), Some("Café"));
    }

    #[test]
    fn windows_1252_bytes_decode_without_replacement() {
        // 0x96 is an en dash in Windows-1252 and a C1 control in Latin-1.
        let bytes = b"Part Number,Notes\nX100,a\x96b\n";
        let table = parse_table(bytes, b',').unwrap();
        assert_eq!(table.encoding(), TextEncoding::Latin1);
        let notes = table.rows()[0].get("Notes").unwrap();
        assert!(!notes.contains('\u{fffd}'));
        assert_eq!(notes, "a\u{96}b");
    }

    #[test]
    fn unnamed_and_blank_headers_dropped() {
        let bytes = b"Unnamed: 0, Part Number ,,Voltage\n0,X100,junk,480V\n";
        let table = parse_table(bytes, b',').unwrap();
        assert_eq!(table.columns(), &["Part Number", "Voltage"]);
        assert_eq!(table.rows()[0].get("Voltage"), Some("480V"));
    }

    #[test]
    fn ragged_rows_are_normalized() {
        let bytes = b"A,B,C\n1\n1,2,3,4\n";
        let table = parse_table(bytes, b',').unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].get("B"), None);
        assert_eq!(table.rows()[1].values().len(), 3);
        assert_eq!(table.rows()[1].get("C"), Some("3"));
    }

    #[test]
    fn custom_delimiter() {
        let table = parse_table(b"Part Number;Manufacturer\nX100;Acme\n", b';').unwrap();
        assert_eq!(table.rows()[0].get("Manufacturer"), Some("Acme"));
    }

    #[test]
    fn sample_rows_clamps() {
        let table = Table::from_records(["Part Number"], [["A"], ["B"]]);
        assert_eq!(table.sample_rows(3).len(), 2);
        assert_eq!(table.sample_rows(1).len(), 1);
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let err = read_table(Path::new("/definitely/not/here.csv"), b',').unwrap_err();
        assert!(matches!(err, PartGenError::Io { .. }));
    }

    #[test]
    fn read_from_disk_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "Part Number\nX100\n").unwrap();
        let table = read_table(&path, b',').unwrap();
        assert_eq!(table.source(), Some(path.as_path()));
        assert_eq!(table.len(), 1);
    }
}

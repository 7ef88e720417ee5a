//! Authoritative specification lookup by part number.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use partgen_shared::{Result, Row, SpecMap, is_null_token};
use partgen_table::{Table, read_table};

use crate::schema::{AnalysisMode, SchemaResolution, SchemaInference, resolve_columns};

/// Identity columns tried in order when none is inferred. Every one present
/// is indexed.
pub const DEFAULT_PART_COLUMNS: &[&str] = &[
    "Summary_Part Number",
    "Details_Part Number:",
    "Summary_Item:",
    "Part Number",
    "Internal ID",
];

/// Value columns used when none are inferred, in prompt order.
pub const PREFERRED_FIELDS: &[&str] = &[
    // Identity
    "Summary_Part Number",
    "Summary_Product Line:",
    "Summary_Item:",
    "Part Number",
    "Brand",
    "Family",
    "Manufacturer",
    "Item Category",
    "Item Subcategory",
    // Electrical core
    "Summary_Phase:",
    "Summary_Standard kVA:",
    "Summary_Primary Voltage:",
    "Summary_Secondary Voltage:",
    "Summary_Vector Configuration:",
    "Summary_Frequency:",
    "Summary_Temperature Rise:",
    "Summary_Material:",
    "Phase",
    "Voltage",
    "Amperage",
    "AIC rating",
    "Connection",
    "Poles",
    // Construction / enclosure
    "Summary_Enclosure Type:",
    "Summary_Enclosure Grade:",
    "Summary_Sound Level:",
    "Summary_Electrostatic Shield:",
    "Summary_Efficiency Regulation:",
    "Protection",
    "Functions",
    "Panel Type",
    "Breaker Type",
    "Frame Size",
    // Seismic / compliance
    "Summary_Seismic Compliance:",
    "Summary_Seismic Standard Value:",
    "Summary_Seismic OSHPD:",
    "Summary_Seismic IP:",
    "Summary_Seismic ZH:",
    "Summary_Seismic SDS Value:",
    // Connections
    "Summary_Primary Connection:",
    "Summary_Secondary Connection:",
    // Other
    "Summary_Connection:",
    "Summary_System Voltage:",
    "Summary_Rated Current:",
    "Summary_Cable Length:",
    "Temp Rating",
    "Wire",
    "Standards",
    "Terminal Connection",
    "Certification",
    "Configuration",
    "Switch Style",
    "Weight",
    "Dimensions",
];

/// Normalized lookup key: trimmed and upper-cased.
fn index_key(part_number: &str) -> String {
    part_number.trim().to_uppercase()
}

/// In-memory index over an optional specifications table.
///
/// Built once before processing starts and read-only afterwards.
#[derive(Debug, Default)]
pub struct SpecIndex {
    source: Option<PathBuf>,
    rows: Vec<Row>,
    /// Positions of the value columns within each row.
    value_columns: Vec<(usize, String)>,
    /// Normalized part number → row offset. First occurrence wins.
    index: HashMap<String, usize>,
    /// First key indexed, for `sample_key`.
    first_key: Option<String>,
}

impl SpecIndex {
    /// An index with no data; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load `path` and build the index.
    ///
    /// A missing file yields an empty index. When `inference` is supplied it
    /// is asked for the identity and value columns; names it proposes that
    /// the table lacks are dropped, and the fixed lists fill any gap.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path, delimiter: u8, inference: Option<&dyn SchemaInference>) -> Result<Self> {
        if !path.exists() {
            info!("no specifications file, continuing without one");
            return Ok(Self::empty());
        }

        let table = read_table(path, delimiter)?;
        if table.is_empty() || table.columns().is_empty() {
            warn!("specifications file has no data");
            return Ok(Self {
                source: Some(path.to_path_buf()),
                ..Self::default()
            });
        }

        let inferred = match resolve_columns(inference, &table, AnalysisMode::SpecsTable).await {
            SchemaResolution::Inferred(mapping) => Some(mapping),
            SchemaResolution::Unavailable { reason } => {
                debug!(%reason, "using default specification columns");
                None
            }
        };

        let identity: Vec<String> = match &inferred {
            Some(mapping) => vec![mapping.part_number_column.clone()],
            None => default_identity_columns(&table),
        };
        let values: Vec<String> = match &inferred {
            Some(mapping) if !mapping.spec_columns.is_empty() => mapping.spec_columns.clone(),
            _ => PREFERRED_FIELDS
                .iter()
                .filter(|f| table.has_column(f))
                .map(|f| f.to_string())
                .collect(),
        };

        let mut index = Self::build(table, &identity, &values);
        index.source = Some(path.to_path_buf());

        info!(
            entries = index.len(),
            identity = ?identity,
            value_columns = index.value_columns.len(),
            "specification index loaded"
        );
        Ok(index)
    }

    /// Index `table` by the given identity columns.
    pub fn build(table: Table, identity_columns: &[String], value_columns: &[String]) -> Self {
        let positions = |names: &[String]| -> Vec<(usize, String)> {
            names
                .iter()
                .filter_map(|name| {
                    table
                        .columns()
                        .iter()
                        .position(|c| c == name)
                        .map(|i| (i, name.clone()))
                })
                .collect()
        };
        let identity = positions(identity_columns);
        let value_columns = positions(value_columns);

        let mut index = HashMap::new();
        let mut first_key = None;
        for (offset, row) in table.rows().iter().enumerate() {
            for (col, _) in &identity {
                let Some(value) = row.values()[*col].as_deref() else {
                    continue;
                };
                if is_null_token(value) {
                    continue;
                }
                let key = index_key(value);
                if first_key.is_none() {
                    first_key = Some(key.clone());
                }
                index.entry(key).or_insert(offset);
            }
        }

        Self {
            source: table.source().map(Path::to_path_buf),
            rows: table.into_rows(),
            value_columns,
            index,
            first_key,
        }
    }

    /// Whether the index holds any rows.
    pub fn has_data(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Specifications of `part_number`, if indexed. Null-ish values are
    /// never returned.
    pub fn lookup(&self, part_number: &str) -> Option<SpecMap> {
        if part_number.trim().is_empty() {
            return None;
        }
        let offset = *self.index.get(&index_key(part_number))?;
        let row = &self.rows[offset];

        let mut specs = SpecMap::new();
        for (col, label) in &self.value_columns {
            if let Some(value) = row.values()[*col].as_deref() {
                specs.insert(label.as_str(), value);
            }
        }
        Some(specs)
    }

    /// Number of distinct indexed part numbers.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The first indexed key, handy for a lookup self-test.
    pub fn sample_key(&self) -> Option<&str> {
        self.first_key.as_deref()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn default_identity_columns(table: &Table) -> Vec<String> {
    let present: Vec<String> = DEFAULT_PART_COLUMNS
        .iter()
        .filter(|c| table.has_column(c))
        .map(|c| c.to_string())
        .collect();

    if present.is_empty() {
        table.columns().first().cloned().into_iter().collect()
    } else {
        present
    }
}

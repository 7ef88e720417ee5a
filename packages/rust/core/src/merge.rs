//! Combining indexed specifications with the row being processed.

use partgen_shared::{DEFAULT_PART_NUMBER_COLUMN, Row, SpecMap, is_artifact_column, is_output_column};

use crate::spec_index::{DEFAULT_PART_COLUMNS, SpecIndex};

/// Build the specification map for one row.
///
/// Indexed fields come first; every non-empty row field then overwrites or
/// extends them in table order. When no identity label made it into the
/// map, the part number is added under `Part Number`.
pub fn merge(row: &Row, part_number: &str, index: &SpecIndex) -> SpecMap {
    let mut specs = if index.has_data() {
        index.lookup(part_number).unwrap_or_default()
    } else {
        SpecMap::new()
    };

    for (column, value) in row.iter() {
        if is_output_column(column) || is_artifact_column(column) {
            continue;
        }
        if let Some(value) = value {
            specs.insert(column, value);
        }
    }

    let has_identity = DEFAULT_PART_COLUMNS
        .iter()
        .any(|label| specs.contains_key(label));
    if !has_identity {
        specs.insert(DEFAULT_PART_NUMBER_COLUMN, part_number);
    }

    specs
}

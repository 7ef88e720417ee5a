//! Column resolution for arbitrary input and specification tables.
//!
//! The generation model is asked which columns hold the part number, the
//! manufacturer and useful specifications. Its answer is checked against the
//! real column list; anything that does not exist is discarded.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use partgen_ollama::{ChatBackend, ChatMessage, GenerationOptions, ResponseFormat};
use partgen_shared::{ColumnMapping, DEFAULT_PART_NUMBER_COLUMN, PartGenError, Result, Row};
use partgen_table::Table;

/// Rows shown to the model.
pub const SAMPLE_ROWS: usize = 3;

/// Token budget for a column analysis reply.
const ANALYSIS_MAX_TOKENS: u32 = 1000;

/// Column-name keywords that suggest a manufacturer column.
const MANUFACTURER_KEYWORDS: &[&str] = &[
    "manufacturer",
    "brand",
    "family",
    "make",
    "company",
    "vendor",
    "supplier",
];

/// Distinct sample values listed per manufacturer candidate.
const MAX_CANDIDATE_SAMPLES: usize = 10;

// ---------------------------------------------------------------------------
// Inference capability
// ---------------------------------------------------------------------------

/// What kind of table is being analyzed; selects the spec-column key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    /// A specifications table exists; ask for `relevant_spec_columns`.
    SpecsTable,
    /// Only the input table is available; ask for `additional_spec_columns`.
    InputOnly,
}

impl AnalysisMode {
    fn spec_key(self) -> &'static str {
        match self {
            Self::SpecsTable => "relevant_spec_columns",
            Self::InputOnly => "additional_spec_columns",
        }
    }
}

/// Raw answer of a schema analysis. Names are unchecked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ColumnAnalysis {
    #[serde(default)]
    pub part_number_column: Option<String>,
    #[serde(default)]
    pub manufacturer_column: Option<String>,
    #[serde(default)]
    pub relevant_spec_columns: Option<Vec<String>>,
    #[serde(default)]
    pub additional_spec_columns: Option<Vec<String>>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl ColumnAnalysis {
    /// Spec columns under the key `mode` asked for, falling back to the
    /// other key when the model used that one instead.
    pub fn spec_columns(&self, mode: AnalysisMode) -> &[String] {
        let (asked, other) = match mode {
            AnalysisMode::SpecsTable => (&self.relevant_spec_columns, &self.additional_spec_columns),
            AnalysisMode::InputOnly => (&self.additional_spec_columns, &self.relevant_spec_columns),
        };
        asked.as_deref().or(other.as_deref()).unwrap_or_default()
    }
}

/// Proposes a column mapping from column names and sample rows.
#[async_trait]
pub trait SchemaInference: Send + Sync {
    async fn analyze(
        &self,
        columns: &[String],
        sample: &[Row],
        row_count: usize,
        mode: AnalysisMode,
    ) -> Result<ColumnAnalysis>;
}

/// [`SchemaInference`] backed by the chat model in JSON mode.
pub struct LlmSchemaInference {
    backend: Arc<dyn ChatBackend>,
    model: String,
    options: GenerationOptions,
}

impl LlmSchemaInference {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, base: &GenerationOptions) -> Self {
        let options = GenerationOptions {
            num_predict: ANALYSIS_MAX_TOKENS,
            format: ResponseFormat::Json,
            ..base.clone()
        };
        Self {
            backend,
            model: model.into(),
            options,
        }
    }
}

#[async_trait]
impl SchemaInference for LlmSchemaInference {
    async fn analyze(
        &self,
        columns: &[String],
        sample: &[Row],
        row_count: usize,
        mode: AnalysisMode,
    ) -> Result<ColumnAnalysis> {
        let prompt = analysis_prompt(columns, sample, row_count, mode);
        let reply = self
            .backend
            .chat(&self.model, &[ChatMessage::user(prompt)], &self.options)
            .await?;

        let json = extract_json_object(&reply)
            .ok_or_else(|| PartGenError::schema("column analysis reply contained no JSON object"))?;

        serde_json::from_str(json)
            .map_err(|e| PartGenError::schema(format!("invalid column analysis JSON: {e}")))
    }
}

fn analysis_prompt(columns: &[String], sample: &[Row], row_count: usize, mode: AnalysisMode) -> String {
    let subject = match mode {
        AnalysisMode::SpecsTable => "a product specifications table",
        AnalysisMode::InputOnly => "an input table of products to process",
    };

    let sample_json: Vec<serde_json::Map<String, serde_json::Value>> = sample
        .iter()
        .map(|row| {
            row.iter()
                .map(|(col, value)| {
                    let value = value.map_or(serde_json::Value::Null, |v| v.into());
                    (col.to_string(), value)
                })
                .collect()
        })
        .collect();

    let columns_json = serde_json::to_string(columns).unwrap_or_default();
    let sample_json = serde_json::to_string_pretty(&sample_json).unwrap_or_default();
    let spec_key = mode.spec_key();

    format!(
        "Analyze the structure of {subject} and determine its column mapping.\n\n\
         Columns: {columns_json}\n\
         Sample rows (first {SAMPLE_ROWS}): {sample_json}\n\
         Total rows: {row_count}\n\n\
         Identify:\n\
         1. The part number column (the unique identifier of each product)\n\
         2. The manufacturer column (the company that makes the product), or null\n\
         3. The columns holding useful product specifications\n\n\
         Use exact column names from the list. Answer with only this JSON object:\n\
         {{\"part_number_column\": \"...\", \"manufacturer_column\": \"...\", \
         \"{spec_key}\": [\"...\"], \"reasoning\": \"...\"}}"
    )
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of asking for a column mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaResolution {
    /// A mapping whose identity column exists in the table.
    Inferred(ColumnMapping),
    /// No usable mapping; the fixed defaults apply.
    Unavailable { reason: String },
}

/// Ask `inference` for the mapping of `table`, validating every name.
pub async fn resolve_columns(
    inference: Option<&dyn SchemaInference>,
    table: &Table,
    mode: AnalysisMode,
) -> SchemaResolution {
    let Some(inference) = inference else {
        return SchemaResolution::Unavailable {
            reason: "column inference disabled".into(),
        };
    };

    let analysis = match inference
        .analyze(table.columns(), table.sample_rows(SAMPLE_ROWS), table.len(), mode)
        .await
    {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!(error = %e, "column analysis failed");
            return SchemaResolution::Unavailable {
                reason: e.to_string(),
            };
        }
    };

    if let Some(reasoning) = analysis.reasoning.as_deref() {
        debug!(%reasoning, "column analysis reasoning");
    }

    match validate_analysis(analysis, table.columns(), mode) {
        Ok(mapping) => {
            info!(
                part_number = %mapping.part_number_column,
                manufacturer = mapping.manufacturer_column.as_deref().unwrap_or("-"),
                spec_columns = mapping.spec_columns.len(),
                "columns inferred"
            );
            SchemaResolution::Inferred(mapping)
        }
        Err(reason) => {
            warn!(%reason, "inferred columns rejected");
            SchemaResolution::Unavailable { reason }
        }
    }
}

/// Keep only names that exist in `columns`; the identity column is mandatory.
fn validate_analysis(
    analysis: ColumnAnalysis,
    columns: &[String],
    mode: AnalysisMode,
) -> std::result::Result<ColumnMapping, String> {
    let exists = |name: &str| columns.iter().any(|c| c == name);

    let part_number_column = analysis
        .part_number_column
        .as_deref()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "no part number column proposed".to_string())?;

    if !exists(&part_number_column) {
        return Err(format!(
            "proposed part number column '{part_number_column}' is not in the table"
        ));
    }

    let manufacturer_column = analysis
        .manufacturer_column
        .as_deref()
        .map(|c| c.trim().to_string())
        .filter(|c| exists(c));

    let mut seen = BTreeSet::new();
    let spec_columns = analysis
        .spec_columns(mode)
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| exists(c) && seen.insert(c.clone()))
        .collect();

    Ok(ColumnMapping {
        part_number_column,
        manufacturer_column,
        spec_columns,
    })
}

/// Turn a resolution into the mapping a run uses, or fail before any
/// generation happens.
///
/// Without an inferred mapping the table must have a literal `Part Number`
/// column.
pub fn require_identity(resolution: SchemaResolution, columns: &[String]) -> Result<ColumnMapping> {
    match resolution {
        SchemaResolution::Inferred(mapping) => Ok(mapping),
        SchemaResolution::Unavailable { reason } => {
            if columns.iter().any(|c| c == DEFAULT_PART_NUMBER_COLUMN) {
                debug!(%reason, "using default column mapping");
                Ok(ColumnMapping {
                    part_number_column: DEFAULT_PART_NUMBER_COLUMN.to_string(),
                    manufacturer_column: None,
                    spec_columns: Vec::new(),
                })
            } else {
                Err(PartGenError::schema(format!(
                    "no '{DEFAULT_PART_NUMBER_COLUMN}' column and no inferable identity column \
                     ({reason}); available columns: {}",
                    columns.join(", ")
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Table profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProfile {
    pub name: String,
    pub non_empty: usize,
    pub empty: usize,
}

/// A column whose name suggests it holds manufacturers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerCandidate {
    pub column: String,
    pub non_empty: usize,
    pub distinct: usize,
    /// Up to ten distinct values, in first-seen order.
    pub samples: Vec<String>,
}

/// Per-column fill statistics of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProfile {
    pub rows: usize,
    pub columns: Vec<ColumnProfile>,
    pub manufacturer_candidates: Vec<ManufacturerCandidate>,
}

pub fn describe_table(table: &Table) -> TableProfile {
    let columns = table
        .columns()
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let non_empty = table
                .rows()
                .iter()
                .filter(|row| row.values()[i].is_some())
                .count();
            ColumnProfile {
                name: name.clone(),
                non_empty,
                empty: table.len() - non_empty,
            }
        })
        .collect();

    let manufacturer_candidates = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            let lower = name.to_lowercase();
            MANUFACTURER_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .map(|(i, name)| {
            let mut distinct: Vec<&str> = Vec::new();
            let mut non_empty = 0;
            for value in table.rows().iter().filter_map(|row| row.values()[i].as_deref()) {
                non_empty += 1;
                if !distinct.contains(&value) {
                    distinct.push(value);
                }
            }
            ManufacturerCandidate {
                column: name.clone(),
                non_empty,
                distinct: distinct.len(),
                samples: distinct
                    .iter()
                    .take(MAX_CANDIDATE_SAMPLES)
                    .map(|s| s.to_string())
                    .collect(),
            }
        })
        .collect();

    TableProfile {
        rows: table.len(),
        columns,
        manufacturer_candidates,
    }
}

impl fmt::Display for TableProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Rows: {}", self.rows)?;

        if self.manufacturer_candidates.is_empty() {
            writeln!(f, "No obvious manufacturer columns found")?;
        } else {
            writeln!(f, "Potential manufacturer columns:")?;
            for c in &self.manufacturer_candidates {
                writeln!(
                    f,
                    "  - {}: {} non-empty, {} distinct",
                    c.column, c.non_empty, c.distinct
                )?;
                if !c.samples.is_empty() {
                    writeln!(f, "    samples: {}", c.samples.join(", "))?;
                }
            }
        }

        writeln!(f, "Columns:")?;
        for c in &self.columns {
            writeln!(f, "  {}: {} non-empty, {} empty", c.name, c.non_empty, c.empty)?;
        }
        Ok(())
    }
}

//! Typed dataset columns.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Measurement level of a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Unknown,
    Nominal,
    Ordinal,
    Scale,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Nominal => "nominal",
            Self::Ordinal => "ordinal",
            Self::Scale => "scale",
        };
        f.write_str(name)
    }
}

/// A single cell of a column.
///
/// Serialized as plain JSON: `null`, a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Missing,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Numeric view of the value; numeric text is parsed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) if !n.is_nan() => Some(*n),
            Self::Number(_) | Self::Missing => None,
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Whether the value is missing.
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Number(n) => n.is_nan(),
            Self::Text(s) => s.is_empty(),
        }
    }

    /// Label used when the column is treated as categorical.
    pub fn label(&self) -> Option<String> {
        match self {
            Self::Missing => None,
            Self::Number(n) if n.is_nan() => None,
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) if s.is_empty() => None,
            Self::Text(s) => Some(s.clone()),
        }
    }
}

/// Bookkeeping for a column whose values come from code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedInfo {
    /// Code that produced the values.
    pub code: String,
    /// Error of the last failed computation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// User-facing name.
    pub name: String,
    /// Encoded identifier, unique within the dataset.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoded: String,
    /// Measurement level.
    #[serde(rename = "type", default)]
    pub column_type: ColumnType,
    /// Row values.
    #[serde(default)]
    pub values: Vec<CellValue>,
    /// Set for computed columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedInfo>,
    /// Analysis that created this column, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<i64>,
}

impl Column {
    /// Create a column with the given values.
    pub fn new(name: impl Into<String>, column_type: ColumnType, values: Vec<CellValue>) -> Self {
        Self {
            name: name.into(),
            encoded: String::new(),
            column_type,
            values,
            computed: None,
            analysis_id: None,
        }
    }

    /// Create a scale column from numbers.
    pub fn scale(name: impl Into<String>, values: &[f64]) -> Self {
        Self::new(
            name,
            ColumnType::Scale,
            values.iter().map(|v| CellValue::Number(*v)).collect(),
        )
    }

    /// Create a nominal column from labels.
    pub fn nominal(name: impl Into<String>, values: &[&str]) -> Self {
        Self::new(
            name,
            ColumnType::Nominal,
            values.iter().map(|v| CellValue::Text((*v).to_string())).collect(),
        )
    }

    /// Numeric view of all rows.
    pub fn numbers(&self) -> Vec<Option<f64>> {
        self.values.iter().map(CellValue::as_number).collect()
    }
}

/// Infer the measurement level of freshly computed values.
pub fn infer_type(values: &[CellValue]) -> ColumnType {
    let mut any = false;
    for value in values {
        match value {
            CellValue::Missing => {}
            CellValue::Number(_) => any = true,
            CellValue::Text(_) => return ColumnType::Nominal,
        }
    }
    if any { ColumnType::Scale } else { ColumnType::Unknown }
}

/// Convert values to the representation required by `column_type`.
///
/// Scale columns keep only numbers; everything that is not numeric becomes
/// missing. Categorical columns keep their values as they are.
pub fn coerce_values(values: Vec<CellValue>, column_type: ColumnType) -> Vec<CellValue> {
    match column_type {
        ColumnType::Scale => values
            .into_iter()
            .map(|v| v.as_number().map_or(CellValue::Missing, CellValue::Number))
            .collect(),
        ColumnType::Nominal | ColumnType::Ordinal | ColumnType::Unknown => values,
    }
}

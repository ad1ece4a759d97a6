//! Export types and partition layout.
//!
//! Each AWS data-export family fixes how its partitions are named in object
//! keys and at which granularity they are cut. Everything downstream
//! (discovery, caching, the window filter) derives from the values here.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The columnar extension recognized for direct-file query targets.
pub const COLUMNAR_EXT: &str = ".parquet";

/// Supported AWS data-export schema families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExportType {
    #[serde(rename = "FOCUS1.0")]
    Focus1_0,
    #[serde(rename = "CUR2.0")]
    Cur2_0,
    #[serde(rename = "COH")]
    CostOptimizationHub,
    #[serde(rename = "CARBON_EMISSION")]
    CarbonEmission,
}

impl ExportType {
    /// The case-sensitive token used in object keys, e.g. `BILLING_PERIOD=2025-05`.
    pub fn partition_token(&self) -> &'static str {
        match self {
            Self::Focus1_0 => "billing_period",
            Self::Cur2_0 => "BILLING_PERIOD",
            Self::CostOptimizationHub => "date",
            Self::CarbonEmission => "BILLING_PERIOD",
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::CostOptimizationHub => Granularity::Daily,
            _ => Granularity::Monthly,
        }
    }

    /// Exports ship either parquet or gzipped CSV content files; anything
    /// else under a partition (manifests, metadata) is ignored.
    pub fn accepts(&self, file_name: &str) -> bool {
        ContentFormat::from_file_name(file_name).is_some()
    }

    pub fn default_table_name(&self) -> &'static str {
        "CUR"
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Focus1_0 => "FOCUS1.0",
            Self::Cur2_0 => "CUR2.0",
            Self::CostOptimizationHub => "COH",
            Self::CarbonEmission => "CARBON_EMISSION",
        }
    }
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportType {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOCUS1.0" => Ok(Self::Focus1_0),
            "CUR2.0" => Ok(Self::Cur2_0),
            "COH" => Ok(Self::CostOptimizationHub),
            "CARBON_EMISSION" => Ok(Self::CarbonEmission),
            other => Err(PartitionError::UnknownExportType(other.to_string())),
        }
    }
}

/// Content formats found inside partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFormat {
    Parquet,
    CsvGz,
}

impl ContentFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(COLUMNAR_EXT) {
            Some(Self::Parquet)
        } else if name.ends_with(".gz") {
            Some(Self::CsvGz)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Monthly,
    Daily,
}

impl Granularity {
    pub fn date_format(&self) -> &'static str {
        match self {
            Self::Monthly => "YYYY-MM",
            Self::Daily => "YYYY-MM-DD",
        }
    }

    /// Parses a partition value at this granularity. A monthly granularity
    /// rejects daily-formatted input and vice versa.
    pub fn parse_value(&self, s: &str) -> Result<PartitionValue, PartitionError> {
        let invalid = || PartitionError::InvalidValue {
            value: s.to_string(),
            expected: self.date_format(),
        };
        match self {
            Self::Monthly => {
                let (year, month) = s.split_once('-').ok_or_else(invalid)?;
                if year.len() != 4 || month.len() != 2 {
                    return Err(invalid());
                }
                let year: i32 = year.parse().map_err(|_| invalid())?;
                let month: u32 = month.parse().map_err(|_| invalid())?;
                if !(1..=12).contains(&month) {
                    return Err(invalid());
                }
                Ok(PartitionValue::Month { year, month })
            }
            Self::Daily => {
                if s.len() != 10 {
                    return Err(invalid());
                }
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid())?;
                Ok(PartitionValue::Day(date))
            }
        }
    }

    /// All partition values in the inclusive window `[start, end]`, ascending.
    /// An inverted window is empty, never an error.
    pub fn window(&self, start: &PartitionValue, end: &PartitionValue) -> Vec<PartitionValue> {
        let mut values = vec![];
        match (self, start, end) {
            (Self::Monthly, PartitionValue::Month { year, month }, end) => {
                let (mut y, mut m) = (*year, *month);
                loop {
                    let current = PartitionValue::Month { year: y, month: m };
                    if &current > end {
                        break;
                    }
                    values.push(current);
                    if m == 12 {
                        y += 1;
                        m = 1;
                    } else {
                        m += 1;
                    }
                }
            }
            (Self::Daily, PartitionValue::Day(start), PartitionValue::Day(end)) => {
                let mut day = *start;
                while day <= *end {
                    values.push(PartitionValue::Day(day));
                    match day.succ_opt() {
                        Some(next) => day = next,
                        None => break,
                    }
                }
            }
            // Mixed granularities cannot come out of `parse_value`.
            _ => {}
        }
        values
    }
}

/// A partition key value. Lexicographic ordering of the canonical string form
/// coincides with the derived chronological ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionValue {
    Month { year: i32, month: u32 },
    Day(NaiveDate),
}

impl PartitionValue {
    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Month { .. } => Granularity::Monthly,
            Self::Day(_) => Granularity::Daily,
        }
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Month { year, month } => write!(f, "{:04}-{:02}", year, month),
            Self::Day(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

/// A single partition of an export: the directory `<token>=<value>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub export_type: ExportType,
    pub value: PartitionValue,
}

impl Partition {
    pub fn new(export_type: ExportType, value: PartitionValue) -> Self {
        Self { export_type, value }
    }

    /// The on-store directory name, e.g. `BILLING_PERIOD=2025-05`.
    pub fn dir_name(&self) -> String {
        format!("{}={}", self.export_type.partition_token(), self.value)
    }

    /// Parses a directory name back into a partition. Returns an error for
    /// foreign tokens or values at the wrong granularity.
    pub fn parse_dir_name(export_type: ExportType, name: &str) -> Result<Self, PartitionError> {
        let token = export_type.partition_token();
        let value = name
            .strip_prefix(token)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(|| PartitionError::ForeignDirectory(name.to_string()))?;
        let value = export_type.granularity().parse_value(value)?;
        Ok(Self { export_type, value })
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("invalid partition value '{value}', expected {expected}")]
    InvalidValue { value: String, expected: &'static str },

    #[error("directory '{0}' is not a partition of this export")]
    ForeignDirectory(String),

    #[error("unknown export type '{0}'")]
    UnknownExportType(String),
}

//! Meter definitions and aggregate values
//!
//! A meter is a declarative, windowed aggregation over events of one type.
//! Definitions are author-controlled and must not change once a table has
//! been materialized for them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, MeterflowError, Result};
use crate::types::namespace::is_name_char;

/// Group by dimension that refers to the event subject rather than its data
pub const SUBJECT_DIMENSION: &str = "subject";

/// Aggregation function applied to a meter's value property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum MeterAggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    CountDistinct,
}

impl MeterAggregation {
    /// Engine function name
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterAggregation::Sum => "SUM",
            MeterAggregation::Count => "COUNT",
            MeterAggregation::Avg => "AVG",
            MeterAggregation::Min => "MIN",
            MeterAggregation::Max => "MAX",
            MeterAggregation::CountDistinct => "COUNT_DISTINCT",
        }
    }

    /// Whether values of adjacent windows can be merged into a coarser window
    pub fn is_mergeable(&self) -> bool {
        matches!(
            self,
            MeterAggregation::Sum
                | MeterAggregation::Count
                | MeterAggregation::Min
                | MeterAggregation::Max
        )
    }

    fn merge(&self, a: f64, b: f64) -> f64 {
        match self {
            MeterAggregation::Min => a.min(b),
            MeterAggregation::Max => a.max(b),
            _ => a + b,
        }
    }
}

impl fmt::Display for MeterAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeterAggregation {
    type Err = MeterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUM" => Ok(MeterAggregation::Sum),
            "COUNT" => Ok(MeterAggregation::Count),
            "AVG" => Ok(MeterAggregation::Avg),
            "MIN" => Ok(MeterAggregation::Min),
            "MAX" => Ok(MeterAggregation::Max),
            "COUNT_DISTINCT" => Ok(MeterAggregation::CountDistinct),
            _ => Err(MeterError::UnknownAggregation(s.to_string())),
        }
    }
}

impl TryFrom<String> for MeterAggregation {
    type Error = MeterError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Tumbling window size
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum WindowSize {
    #[default]
    Minute,
    Hour,
    Day,
}

impl WindowSize {
    pub fn duration(&self) -> Duration {
        match self {
            WindowSize::Minute => Duration::minutes(1),
            WindowSize::Hour => Duration::hours(1),
            WindowSize::Day => Duration::days(1),
        }
    }

    /// Engine window literal, e.g. `1 HOUR`
    pub fn as_interval(&self) -> &'static str {
        match self {
            WindowSize::Minute => "1 MINUTE",
            WindowSize::Hour => "1 HOUR",
            WindowSize::Day => "1 DAY",
        }
    }

    /// Start of the epoch-aligned window containing `time`
    pub fn truncate(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let size = self.duration().num_milliseconds();
        let start = time.timestamp_millis().div_euclid(size) * size;
        Utc.timestamp_millis_opt(start).single().unwrap_or(time)
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowSize::Minute => "MINUTE",
            WindowSize::Hour => "HOUR",
            WindowSize::Day => "DAY",
        };
        f.write_str(name)
    }
}

impl FromStr for WindowSize {
    type Err = MeterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "1m" => Ok(WindowSize::Minute),
            "hour" | "1h" => Ok(WindowSize::Hour),
            "day" | "1d" => Ok(WindowSize::Day),
            _ => Err(MeterError::UnknownWindowSize(s.to_string())),
        }
    }
}

impl TryFrom<String> for WindowSize {
    type Error = MeterError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Meter definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    /// Unique meter identifier, used in table names
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Event type the meter aggregates
    #[serde(alias = "eventType")]
    pub event_type: String,
    pub aggregation: MeterAggregation,
    /// JSON path into event data; not used by COUNT
    #[serde(default, alias = "valueProperty")]
    pub value_property: Option<String>,
    /// Ordered group by dimensions
    #[serde(default, alias = "groupBy")]
    pub group_by: Vec<String>,
    #[serde(default, alias = "windowSize")]
    pub window_size: WindowSize,
}

impl Meter {
    pub fn new(
        slug: impl Into<String>,
        event_type: impl Into<String>,
        aggregation: MeterAggregation,
    ) -> Self {
        Self {
            slug: slug.into(),
            description: None,
            event_type: event_type.into(),
            aggregation,
            value_property: None,
            group_by: Vec::new(),
            window_size: WindowSize::default(),
        }
    }

    pub fn with_value_property(mut self, value_property: impl Into<String>) -> Self {
        self.value_property = Some(value_property.into());
        self
    }

    pub fn with_group_by<I, S>(mut self, group_by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = group_by.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_window_size(mut self, window_size: WindowSize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<()> {
        let slug_ok = !self.slug.is_empty()
            && self.slug.len() <= 64
            && self
                .slug
                .chars()
                .all(is_name_char);
        if !slug_ok {
            return Err(MeterError::InvalidSlug(self.slug.clone()).into());
        }

        if self.event_type.trim().is_empty() {
            return Err(MeterError::MissingEventType {
                slug: self.slug.clone(),
            }
            .into());
        }

        match &self.value_property {
            Some(path) => {
                normalize_json_path(path)?;
            }
            None if self.aggregation != MeterAggregation::Count => {
                return Err(MeterError::MissingValueProperty {
                    slug: self.slug.clone(),
                    aggregation: self.aggregation.to_string(),
                }
                .into());
            }
            None => {}
        }

        let mut seen = Vec::with_capacity(self.group_by.len());
        for dimension in &self.group_by {
            let key = if dimension == SUBJECT_DIMENSION {
                dimension.clone()
            } else {
                normalize_json_path(dimension)?
            };
            if seen.contains(&key) {
                return Err(MeterError::DuplicateGroupBy {
                    slug: self.slug.clone(),
                    dimension: dimension.clone(),
                }
                .into());
            }
            seen.push(key);
        }

        Ok(())
    }

    /// JSON path of the value property, if the aggregation uses one
    pub fn value_path(&self) -> Result<Option<String>> {
        if self.aggregation == MeterAggregation::Count {
            return Ok(None);
        }
        self.value_property
            .as_deref()
            .map(normalize_json_path)
            .transpose()
    }

    /// Group by dimensions over event data, in declaration order.
    ///
    /// The subject is always the leading table key, so it is not listed here.
    pub fn data_dimensions(&self) -> Result<Vec<(String, String)>> {
        self.group_by
            .iter()
            .filter(|d| d.as_str() != SUBJECT_DIMENSION)
            .map(|d| Ok((d.clone(), normalize_json_path(d)?)))
            .collect()
    }
}

/// Normalize a JSON path, accepting bare property names
pub fn normalize_json_path(path: &str) -> Result<String> {
    let path = path.trim();
    if path.is_empty() || path == "$" || path.contains('\'') || path.chars().any(char::is_control) {
        return Err(MeterError::InvalidPath(path.to_string()).into());
    }

    if path.starts_with('$') {
        Ok(path.to_string())
    } else {
        Ok(format!("$.{}", path))
    }
}

/// Single aggregated row of a meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValue {
    pub subject: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_by: BTreeMap<String, Option<String>>,
}

/// Align meter values to the requested window size.
///
/// The engine buckets by the meter's own window size; coarser requests are
/// merged client side. Finer requests cannot be served.
pub fn aggregate_meter_values(
    meter: &Meter,
    mut values: Vec<MeterValue>,
    window_size: Option<WindowSize>,
) -> Result<Vec<MeterValue>> {
    let target = window_size.unwrap_or(meter.window_size);

    if target == meter.window_size {
        values.sort_by(|a, b| {
            (a.window_start, &a.subject, &a.group_by).cmp(&(b.window_start, &b.subject, &b.group_by))
        });
        return Ok(values);
    }

    if target.duration() < meter.window_size.duration() {
        return Err(MeterflowError::Query(format!(
            "window size {} is finer than meter {} window size {}",
            target, meter.slug, meter.window_size
        )));
    }

    if !meter.aggregation.is_mergeable() {
        return Err(MeterflowError::Query(format!(
            "meter {} uses {} aggregation, which cannot be re-aggregated to window size {}",
            meter.slug, meter.aggregation, target
        )));
    }

    let mut buckets: BTreeMap<(DateTime<Utc>, String, BTreeMap<String, Option<String>>), MeterValue> =
        BTreeMap::new();

    for value in values {
        let window_start = target.truncate(value.window_start);
        let key = (window_start, value.subject.clone(), value.group_by.clone());

        buckets
            .entry(key)
            .and_modify(|agg| agg.value = meter.aggregation.merge(agg.value, value.value))
            .or_insert_with(|| MeterValue {
                window_start,
                window_end: window_start + target.duration(),
                ..value
            });
    }

    Ok(buckets.into_values().collect())
}

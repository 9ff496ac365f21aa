//! Meter value queries
//!
//! Pull queries read the materialized windows of a meter table. Rows come
//! back in the table's own window size and are re-aggregated to the
//! requested one.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use meterflow_common::{
    aggregate_meter_values, validate_namespace, EngineErrorKind, Meter, MeterValue,
    MeterflowError, Result, WindowSize, SUBJECT_DIMENSION,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::engine::{PullResult, StreamingEngine};
use crate::query::templates::{
    SUBJECT_COLUMN, VALUE_COLUMN, WINDOW_END_COLUMN, WINDOW_START_COLUMN,
};
use crate::query::{group_by_column, pull_values_statement, quote_literal, ObjectNames};

/// Filters of a values query
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GetValuesParams {
    /// Inclusive lower bound of window starts
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound of window ends
    pub to: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    /// Dimension name to required value
    #[serde(default)]
    pub group_by: BTreeMap<String, String>,
    /// Window size of the result; defaults to the meter's
    pub window_size: Option<WindowSize>,
}

/// Reads aggregated values of meters
pub struct MeterValuesQuery {
    engine: Arc<dyn StreamingEngine>,
}

impl MeterValuesQuery {
    pub fn new(engine: Arc<dyn StreamingEngine>) -> Self {
        Self { engine }
    }

    /// Aggregated values of a meter in a namespace
    #[instrument(skip(self, meter, params), fields(meter = %meter.slug))]
    pub async fn get_values(
        &self,
        namespace: &str,
        meter: &Meter,
        params: &GetValuesParams,
    ) -> Result<Vec<MeterValue>> {
        let query = values_query(namespace, meter, params)?;
        let result = self.engine.pull(&query).await.map_err(|e| match e {
            MeterflowError::Engine(e) if e.kind != EngineErrorKind::Transport => {
                error!(query = %query, error = %e.message, "pull query rejected");
                MeterflowError::Query(e.message)
            }
            e => e,
        })?;
        debug!(columns = ?result.columns, rows = result.rows.len(), "meter values fetched");

        let values = map_rows(meter, &result)?;
        aggregate_meter_values(meter, values, params.window_size)
    }
}

/// Render the pull query for a values request
pub fn values_query(namespace: &str, meter: &Meter, params: &GetValuesParams) -> Result<String> {
    validate_namespace(namespace)?;

    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(MeterflowError::Query(format!(
                "from {} is after to {}",
                from, to
            )));
        }
    }

    let mut predicates = Vec::new();
    if let Some(from) = params.from {
        predicates.push(format!("{} >= {}", WINDOW_START_COLUMN, from.timestamp_millis()));
    }
    if let Some(to) = params.to {
        predicates.push(format!("{} <= {}", WINDOW_END_COLUMN, to.timestamp_millis()));
    }

    let mut subject = params.subject.clone();
    let dimensions = meter.data_dimensions()?;
    let mut dimension_filters = Vec::new();

    for (name, value) in &params.group_by {
        if name == SUBJECT_DIMENSION {
            match &subject {
                Some(existing) if existing != value => {
                    return Err(MeterflowError::Query(format!(
                        "conflicting subject filters {} and {}",
                        existing, value
                    )))
                }
                _ => subject = Some(value.clone()),
            }
            continue;
        }

        let index = dimension_index(&dimensions, name).ok_or_else(|| {
            MeterflowError::Query(format!(
                "meter {} has no group by dimension {}",
                meter.slug, name
            ))
        })?;
        dimension_filters.push(format!("{} = {}", group_by_column(index), quote_literal(value)));
    }

    if let Some(subject) = &subject {
        predicates.push(format!("{} = {}", SUBJECT_COLUMN, quote_literal(subject)));
    }
    predicates.extend(dimension_filters);

    let table = ObjectNames::new(namespace).meter_table(&meter.slug);
    Ok(pull_values_statement(&table, &predicates))
}

fn dimension_index(dimensions: &[(String, String)], name: &str) -> Option<usize> {
    let path = meterflow_common::normalize_json_path(name).ok();
    dimensions
        .iter()
        .position(|(dimension, dimension_path)| dimension == name || Some(dimension_path) == path.as_ref())
}

/// Map pull query rows to meter values by column name.
///
/// Rows without a value carry no aggregate and are skipped.
pub fn map_rows(meter: &Meter, result: &PullResult) -> Result<Vec<MeterValue>> {
    if result.rows.is_empty() {
        return Ok(Vec::new());
    }

    let column = |name: &str| {
        result
            .column(name)
            .ok_or_else(|| MeterflowError::Mapping(format!("missing column {}", name)))
    };

    let subject_at = column(SUBJECT_COLUMN)?;
    let start_at = column(WINDOW_START_COLUMN)?;
    let end_at = column(WINDOW_END_COLUMN)?;
    let value_at = column(VALUE_COLUMN)?;

    let mut dimensions = Vec::new();
    for (index, (name, _)) in meter.data_dimensions()?.into_iter().enumerate() {
        dimensions.push((name, column(&group_by_column(index))?));
    }

    let mut values = Vec::with_capacity(result.rows.len());
    for (n, row) in result.rows.iter().enumerate() {
        let cell = |at: usize| {
            row.get(at).ok_or_else(|| {
                MeterflowError::Mapping(format!("row {} has {} cells", n, row.len()))
            })
        };

        let value = match cell(value_at)? {
            Value::Null => {
                debug!(row = n, "skipping row without value");
                continue;
            }
            other => other
                .as_f64()
                .ok_or_else(|| mistyped(n, VALUE_COLUMN, other))?,
        };

        let subject = match cell(subject_at)? {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => return Err(mistyped(n, SUBJECT_COLUMN, other)),
        };

        let mut group_by = BTreeMap::new();
        for (name, at) in &dimensions {
            let dimension = match cell(*at)? {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            };
            group_by.insert(name.clone(), dimension);
        }

        values.push(MeterValue {
            subject,
            window_start: timestamp(n, WINDOW_START_COLUMN, cell(start_at)?)?,
            window_end: timestamp(n, WINDOW_END_COLUMN, cell(end_at)?)?,
            value,
            group_by,
        });
    }

    Ok(values)
}

fn timestamp(row: usize, column: &str, cell: &Value) -> Result<DateTime<Utc>> {
    cell.as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| mistyped(row, column, cell))
}

fn mistyped(row: usize, column: &str, cell: &Value) -> MeterflowError {
    MeterflowError::Mapping(format!("row {} column {} has unexpected value {}", row, column, cell))
}

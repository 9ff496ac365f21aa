//! Engine statement templates
//!
//! Every object of a namespace lives under the `OM_<NAMESPACE>` prefix:
//!
//! ```text
//! om_<ns>_events (topic)
//!   -> OM_<NS>_EVENTS                   raw event stream
//!   -> OM_<NS>_DETECTED_EVENTS          first sighting of each (ID, SOURCE)
//!   -> OM_<NS>_DETECTED_EVENTS_STREAM   changelog of the above
//!   -> OM_<NS>_METER_<SLUG>             one windowed table per meter
//! ```

use meterflow_common::{Meter, MeterAggregation, Result};

use super::fingerprint::TableFingerprint;
use super::sql::quote_literal;

/// Retention of meter table windows
pub const DEFAULT_WINDOW_RETENTION: &str = "36500 DAYS";

/// Window and retention of the duplicate detection table, in days
pub const DETECTED_EVENTS_RETENTION_DAYS: u32 = 32;

/// Value column of meter tables
pub const VALUE_COLUMN: &str = "VALUE";

/// Subject column of meter tables
pub const SUBJECT_COLUMN: &str = "SUBJECT";

/// Window bound columns of windowed tables
pub const WINDOW_START_COLUMN: &str = "WINDOWSTART";
pub const WINDOW_END_COLUMN: &str = "WINDOWEND";

/// Column holding the n-th data dimension of a meter table
pub fn group_by_column(index: usize) -> String {
    format!("GROUP_BY_{}", index)
}

/// Engine object and topic names of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    namespace: String,
    prefix: String,
}

impl ObjectNames {
    /// Names of a validated namespace
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix: format!("OM_{}", identifier(namespace)),
        }
    }

    pub fn events_stream(&self) -> String {
        format!("{}_EVENTS", self.prefix)
    }

    pub fn detected_events_table(&self) -> String {
        format!("{}_DETECTED_EVENTS", self.prefix)
    }

    pub fn detected_events_topic(&self) -> String {
        format!("om_{}_detected_events", self.namespace)
    }

    pub fn detected_events_stream(&self) -> String {
        format!("{}_DETECTED_EVENTS_STREAM", self.prefix)
    }

    pub fn meter_table(&self, slug: &str) -> String {
        format!("{}_METER_{}", self.prefix, identifier(slug))
    }

    pub fn meter_topic(&self, slug: &str) -> String {
        format!("om_{}_meter_{}", self.namespace, slug)
    }
}

// Namespaces and slugs are lowercase `[a-z0-9_]`, so uppercasing is one to one
fn identifier(name: &str) -> String {
    name.to_ascii_uppercase()
}

/// Topic and schema IDs the raw event stream reads with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsTopic {
    pub topic: String,
    pub key_schema_id: u32,
    pub value_schema_id: u32,
    pub partitions: u32,
}

/// Raw event stream over the events topic
pub fn events_stream_statement(names: &ObjectNames, events: &EventsTopic) -> String {
    format!(
        "CREATE STREAM IF NOT EXISTS {stream} WITH (\n    \
         KAFKA_TOPIC = {topic},\n    \
         KEY_FORMAT = 'JSON_SR',\n    \
         KEY_SCHEMA_ID = {key_id},\n    \
         VALUE_FORMAT = 'JSON_SR',\n    \
         VALUE_SCHEMA_ID = {value_id},\n    \
         PARTITIONS = {partitions}\n\
         );",
        stream = names.events_stream(),
        topic = quote_literal(&events.topic),
        key_id = events.key_schema_id,
        value_id = events.value_schema_id,
        partitions = events.partitions,
    )
}

/// Table keeping the first occurrence of every `(ID, SOURCE)` pair
pub fn detected_events_table_statement(
    names: &ObjectNames,
    retention_days: u32,
    partitions: u32,
) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} WITH (\n    \
         KAFKA_TOPIC = {topic},\n    \
         KEY_FORMAT = 'JSON',\n    \
         VALUE_FORMAT = 'JSON',\n    \
         PARTITIONS = {partitions}\n\
         ) AS\n\
         SELECT\n    \
         ID,\n    \
         SOURCE,\n    \
         EARLIEST_BY_OFFSET(TYPE) AS TYPE,\n    \
         EARLIEST_BY_OFFSET(SUBJECT) AS SUBJECT,\n    \
         EARLIEST_BY_OFFSET(TIME) AS TIME,\n    \
         EARLIEST_BY_OFFSET(DATA) AS DATA,\n    \
         COUNT(ID) AS ID_COUNT\n\
         FROM {source}\n\
         WINDOW TUMBLING (SIZE {days} DAYS, RETENTION {days} DAYS)\n\
         GROUP BY ID, SOURCE\n\
         EMIT CHANGES;",
        table = names.detected_events_table(),
        topic = quote_literal(&names.detected_events_topic()),
        source = names.events_stream(),
        days = retention_days,
        partitions = partitions,
    )
}

/// Stream over the changelog of the detected events table
pub fn detected_events_stream_statement(
    names: &ObjectNames,
    retention_days: u32,
    partitions: u32,
) -> String {
    format!(
        "CREATE STREAM IF NOT EXISTS {stream} (\n    \
         ID STRING KEY,\n    \
         SOURCE STRING KEY,\n    \
         TYPE STRING,\n    \
         SUBJECT STRING,\n    \
         TIME STRING,\n    \
         DATA STRING,\n    \
         ID_COUNT BIGINT\n\
         ) WITH (\n    \
         KAFKA_TOPIC = {topic},\n    \
         KEY_FORMAT = 'JSON',\n    \
         VALUE_FORMAT = 'JSON',\n    \
         WINDOW_TYPE = 'TUMBLING',\n    \
         WINDOW_SIZE = '{days} DAYS',\n    \
         PARTITIONS = {partitions}\n\
         );",
        stream = names.detected_events_stream(),
        topic = quote_literal(&names.detected_events_topic()),
        days = retention_days,
        partitions = partitions,
    )
}

/// Options rendered into meter table statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterTableOptions {
    pub partitions: u32,
    pub window_retention: String,
}

impl Default for MeterTableOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            window_retention: DEFAULT_WINDOW_RETENTION.to_string(),
        }
    }
}

/// Rendered meter table statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatement {
    /// Table name
    pub name: String,
    /// Full `CREATE TABLE` statement
    pub sql: String,
    /// What the statement computes
    pub fingerprint: TableFingerprint,
}

/// Meter value expression, e.g. `CAST(EXTRACTJSONFIELD(DATA, '$.tokens') AS DOUBLE)`
pub(crate) fn value_expression(meter: &Meter) -> Result<String> {
    let Some(path) = meter.value_path()? else {
        return Ok("*".to_string());
    };

    let extract = format!("EXTRACTJSONFIELD(DATA, {})", quote_literal(&path));
    Ok(match meter.aggregation {
        MeterAggregation::Count | MeterAggregation::CountDistinct => extract,
        _ => format!("CAST({} AS DOUBLE)", extract),
    })
}

/// Grouping expressions in key order; the subject always leads
pub(crate) fn group_by_expressions(meter: &Meter) -> Result<Vec<String>> {
    let mut expressions = vec![SUBJECT_COLUMN.to_string()];
    for (_, path) in meter.data_dimensions()? {
        expressions.push(format!("EXTRACTJSONFIELD(DATA, {})", quote_literal(&path)));
    }
    Ok(expressions)
}

/// Row filter: events of the meter's type, first occurrence only
pub(crate) fn meter_filter(meter: &Meter) -> String {
    format!("TYPE = {} AND ID_COUNT = 1", quote_literal(&meter.event_type))
}

/// Windowed aggregation table of a meter
pub fn meter_table_statement(
    names: &ObjectNames,
    meter: &Meter,
    options: &MeterTableOptions,
) -> Result<TableStatement> {
    meter.validate()?;

    let value = value_expression(meter)?;
    let group_by = group_by_expressions(meter)?;

    let mut select = vec![SUBJECT_COLUMN.to_string()];
    for (index, expression) in group_by.iter().skip(1).enumerate() {
        select.push(format!("{} AS {}", expression, group_by_column(index)));
    }
    select.push(format!(
        "{}({}) AS {}",
        meter.aggregation.as_str(),
        value,
        VALUE_COLUMN
    ));

    let name = names.meter_table(&meter.slug);
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} WITH (\n    \
         KAFKA_TOPIC = {topic},\n    \
         KEY_FORMAT = 'JSON',\n    \
         VALUE_FORMAT = 'JSON',\n    \
         PARTITIONS = {partitions}\n\
         ) AS\n\
         SELECT\n    \
         {select}\n\
         FROM {source}\n\
         WINDOW TUMBLING (SIZE {size}, RETENTION {retention})\n\
         WHERE {filter}\n\
         GROUP BY {group_by}\n\
         EMIT CHANGES;",
        table = name,
        topic = quote_literal(&names.meter_topic(&meter.slug)),
        partitions = options.partitions,
        select = select.join(",\n    "),
        source = names.detected_events_stream(),
        size = meter.window_size.as_interval(),
        retention = options.window_retention,
        filter = meter_filter(meter),
        group_by = group_by.join(", "),
    );

    Ok(TableStatement {
        name,
        sql,
        fingerprint: TableFingerprint::expected(names, meter)?,
    })
}

/// Describe statement of an engine object
pub fn describe_statement(name: &str) -> String {
    format!("DESCRIBE {};", name)
}

/// Pull query over a meter table; predicates are joined with `AND`
pub fn pull_values_statement(table: &str, predicates: &[String]) -> String {
    if predicates.is_empty() {
        format!("SELECT * FROM {};", table)
    } else {
        format!(
            "SELECT * FROM {} WHERE {};",
            table,
            predicates.join(" AND ")
        )
    }
}

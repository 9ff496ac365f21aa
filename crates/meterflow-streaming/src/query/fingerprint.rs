//! Semantic fingerprints of meter table statements
//!
//! A fingerprint captures what a meter table computes and ignores how the
//! statement is spelled. Two statements with equal fingerprints aggregate the
//! same events the same way, whatever their formatting or `WITH` options.

use std::fmt;

use lazy_static::lazy_static;
use meterflow_common::{Meter, Result};
use regex::Regex;
use serde::Serialize;

use super::sql::{find_keyword, normalize_sql, split_top_level};
use super::templates::{
    group_by_expressions, meter_filter, value_expression, ObjectNames, VALUE_COLUMN,
};

lazy_static! {
    static ref WINDOW_SIZE: Regex =
        Regex::new(r"SIZE (\d+) ([A-Z]+?)S?\b").expect("valid window size regex");
}

/// What a meter table computes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFingerprint {
    pub aggregation: String,
    pub value: String,
    pub source: String,
    pub group_by: Vec<String>,
    pub filter: String,
    pub window_size: String,
}

impl TableFingerprint {
    /// Fingerprint of the table a meter should have
    pub fn expected(names: &ObjectNames, meter: &Meter) -> Result<Self> {
        Ok(Self {
            aggregation: meter.aggregation.as_str().to_string(),
            value: normalize_sql(&value_expression(meter)?),
            source: normalize_sql(&names.detected_events_stream()),
            group_by: group_by_expressions(meter)?
                .iter()
                .map(|e| normalize_sql(e))
                .collect(),
            filter: normalize_sql(&meter_filter(meter)),
            window_size: canonical_window(&format!("SIZE {}", meter.window_size.as_interval()))
                .unwrap_or_default(),
        })
    }

    /// Fingerprint of an existing `CREATE TABLE .. AS SELECT` statement.
    ///
    /// Returns `None` when the statement is not a windowed aggregation.
    pub fn parse(statement: &str) -> Option<Self> {
        let sql = normalize_sql(statement);

        let select = find_keyword(&sql, "SELECT", 0)?;
        let from = find_keyword(&sql, "FROM", select)?;
        let window = find_keyword(&sql, "WINDOW", from);
        let filter_at = find_keyword(&sql, "WHERE", from);
        let group = find_keyword(&sql, "GROUP BY", from)?;
        let end = find_keyword(&sql, "EMIT", group).unwrap_or(sql.len());

        let source_end = [window, filter_at, Some(group)]
            .into_iter()
            .flatten()
            .min()?;
        let source = sql[from + "FROM".len()..source_end].trim().to_string();

        let window_size = match window {
            Some(start) => {
                let window_end = filter_at.filter(|w| *w > start).unwrap_or(group);
                canonical_window(&sql[start..window_end])?
            }
            None => String::new(),
        };

        let filter = filter_at
            .filter(|w| *w < group)
            .map(|w| sql[w + "WHERE".len()..group].trim().to_string())
            .unwrap_or_default();

        let group_by = split_top_level(&sql[group + "GROUP BY".len()..end]);

        let value_alias = format!(" AS {}", VALUE_COLUMN);
        let value_item = split_top_level(&sql[select + "SELECT".len()..from])
            .into_iter()
            .find_map(|item| item.strip_suffix(value_alias.as_str()).map(str::to_string))?;
        let open = value_item.find('(')?;
        let close = value_item.rfind(')')?;
        if close <= open {
            return None;
        }

        Some(Self {
            aggregation: value_item[..open].trim().to_string(),
            value: value_item[open + 1..close].trim().to_string(),
            source,
            group_by,
            filter,
            window_size,
        })
    }
}

fn canonical_window(clause: &str) -> Option<String> {
    let captures = WINDOW_SIZE.captures(clause)?;
    Some(format!("{} {}", &captures[1], &captures[2]))
}

impl fmt::Display for TableFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) FROM {} WINDOW {} WHERE {} GROUP BY {}",
            self.aggregation,
            self.value,
            self.source,
            self.window_size,
            self.filter,
            self.group_by.join(", ")
        )
    }
}

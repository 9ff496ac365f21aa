//! In-process streaming engine
//!
//! Keeps a catalog of created streams and tables and serves pull queries
//! from rows seeded by the caller. Statements are not evaluated; only
//! `CREATE` bookkeeping and the `WHERE` conjunctions of pull queries are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lazy_static::lazy_static;
use meterflow_common::{EngineError, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::{PullResult, QueryDescription, ServerInfo, SourceDescription, StreamingEngine};
use crate::query::sql::{find_keyword, normalize_sql};

lazy_static! {
    static ref CREATE: Regex = Regex::new(
        r"^CREATE (?:OR REPLACE )?(STREAM|TABLE) (IF NOT EXISTS )?([A-Z0-9_]+)"
    )
    .expect("valid create regex");
    static ref PULL: Regex =
        Regex::new(r"^SELECT \* FROM ([A-Z0-9_]+)(?: WHERE (.+))?$").expect("valid pull regex");
    static ref PREDICATE: Regex =
        Regex::new(r"^([A-Z0-9_]+)(>=|<=|=)('(?:[^']|'')*'|-?\d+(?:\.\d+)?)$")
            .expect("valid predicate regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ge,
    Le,
}

#[derive(Debug, Clone)]
struct Predicate {
    column: String,
    comparison: Comparison,
    operand: Value,
}

impl Predicate {
    fn parse(text: &str) -> Result<Self> {
        let captures = PREDICATE
            .captures(text)
            .ok_or_else(|| EngineError::statement(format!("unsupported predicate: {}", text)))?;

        let comparison = match &captures[2] {
            ">=" => Comparison::Ge,
            "<=" => Comparison::Le,
            _ => Comparison::Eq,
        };
        let literal = &captures[3];
        let operand = match literal.strip_prefix('\'').and_then(|l| l.strip_suffix('\'')) {
            Some(inner) => Value::String(inner.replace("''", "'")),
            None => literal
                .parse::<f64>()
                .map(|n| json!(n))
                .map_err(|_| EngineError::statement(format!("invalid number: {}", literal)))?,
        };

        Ok(Self {
            column: captures[1].to_string(),
            comparison,
            operand,
        })
    }

    fn matches(&self, cell: &Value) -> bool {
        match (cell, &self.operand) {
            (Value::Number(a), Value::Number(b)) => {
                let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                    return false;
                };
                match self.comparison {
                    Comparison::Eq => a == b,
                    Comparison::Ge => a >= b,
                    Comparison::Le => a <= b,
                }
            }
            (Value::String(a), Value::String(b)) => match self.comparison {
                Comparison::Eq => a == b,
                Comparison::Ge => a >= b,
                Comparison::Le => a <= b,
            },
            _ => false,
        }
    }
}

fn conjuncts(clause: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(at) = find_keyword(clause, "AND", start) {
        parts.push(clause[start..at].trim());
        start = at + "AND".len();
    }
    parts.push(clause[start..].trim());
    parts
}

/// In-memory streaming engine
pub struct InMemoryEngine {
    info: ServerInfo,
    sources: RwLock<HashMap<String, SourceDescription>>,
    rows: RwLock<HashMap<String, PullResult>>,
    statements: RwLock<Vec<String>>,
    query_seq: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            info: ServerInfo {
                version: "in-memory".to_string(),
                kafka_cluster_id: "local".to_string(),
                ksql_service_id: "meterflow_".to_string(),
                server_status: Some("RUNNING".to_string()),
            },
            sources: RwLock::new(HashMap::new()),
            rows: RwLock::new(HashMap::new()),
            statements: RwLock::new(Vec::new()),
            query_seq: AtomicU64::new(1),
        }
    }

    /// Register a source as if another client had created it
    pub fn insert_source(&self, name: &str, query_string: Option<&str>) {
        let name = name.to_uppercase();
        let write_queries = query_string
            .map(|q| {
                vec![QueryDescription {
                    id: format!("CTAS_{}_0", name),
                    query_string: q.to_string(),
                }]
            })
            .unwrap_or_default();
        self.sources.write().insert(
            name.clone(),
            SourceDescription {
                name,
                write_queries,
            },
        );
    }

    /// Append rows served by pull queries against a table
    pub fn seed(&self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let mut tables = self.rows.write();
        let result = tables.entry(table.to_uppercase()).or_default();
        if result.columns.is_empty() {
            result.columns = columns.iter().map(|c| c.to_uppercase()).collect();
        }
        result.rows.extend(rows);
    }

    /// Statements executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.statements.read().clone()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources.read().contains_key(&source.to_uppercase())
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamingEngine for InMemoryEngine {
    async fn server_info(&self) -> Result<ServerInfo> {
        Ok(self.info.clone())
    }

    async fn execute(&self, statement: &str) -> Result<Value> {
        let normalized = normalize_sql(statement);
        let captures = CREATE
            .captures(&normalized)
            .ok_or_else(|| EngineError::statement(format!("unsupported statement: {}", statement)))?;

        let kind = captures[1].to_lowercase();
        let if_not_exists = captures.get(2).is_some();
        let name = captures[3].to_string();

        let mut sources = self.sources.write();
        if sources.contains_key(&name) {
            if if_not_exists {
                debug!(name = %name, "source exists, statement skipped");
                return Ok(json!([{"@type": "currentStatus", "commandStatus": {"status": "SUCCESS", "message": format!("{} already exists", name)}}]));
            }
            return Err(EngineError::already_exists(format!(
                "Cannot add {} '{}': A {} with the same name already exists",
                kind, name, kind
            ))
            .into());
        }

        let write_queries = if find_keyword(&normalized, "SELECT", 0).is_some() {
            vec![QueryDescription {
                id: format!(
                    "CT{}S_{}_{}",
                    if kind == "table" { "A" } else { "S" },
                    name,
                    self.query_seq.fetch_add(1, Ordering::Relaxed)
                ),
                query_string: statement.to_string(),
            }]
        } else {
            Vec::new()
        };

        sources.insert(
            name.clone(),
            SourceDescription {
                name: name.clone(),
                write_queries,
            },
        );
        self.statements.write().push(statement.to_string());

        Ok(json!([{"@type": "currentStatus", "commandStatus": {"status": "SUCCESS", "message": format!("Created {} {}", kind, name)}}]))
    }

    async fn describe(&self, source: &str) -> Result<Option<SourceDescription>> {
        Ok(self.sources.read().get(&source.to_uppercase()).cloned())
    }

    async fn pull(&self, query: &str) -> Result<PullResult> {
        let normalized = normalize_sql(query);
        let captures = PULL
            .captures(&normalized)
            .ok_or_else(|| EngineError::statement(format!("unsupported pull query: {}", query)))?;

        let table = captures[1].to_string();
        if !self.sources.read().contains_key(&table) {
            return Err(EngineError::statement(format!(
                "{} does not exist",
                table
            ))
            .into());
        }

        let predicates = match captures.get(2) {
            Some(clause) => conjuncts(clause.as_str())
                .into_iter()
                .map(Predicate::parse)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let tables = self.rows.read();
        let Some(data) = tables.get(&table) else {
            return Ok(PullResult::default());
        };

        let mut bound = Vec::with_capacity(predicates.len());
        for predicate in &predicates {
            let index = data.column(&predicate.column).ok_or_else(|| {
                EngineError::statement(format!("column {} cannot be resolved", predicate.column))
            })?;
            bound.push((index, predicate));
        }

        let rows = data
            .rows
            .iter()
            .filter(|row| {
                bound
                    .iter()
                    .all(|(index, p)| row.get(*index).is_some_and(|cell| p.matches(cell)))
            })
            .cloned()
            .collect();

        Ok(PullResult {
            columns: data.columns.clone(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterflow_common::{EngineErrorKind, MeterflowError};

    const COLUMNS: [&str; 4] = ["SUBJECT", "WINDOWSTART", "WINDOWEND", "VALUE"];

    #[tokio::test]
    async fn test_create_registers_defining_query() {
        let engine = InMemoryEngine::new();
        let statement = "CREATE TABLE IF NOT EXISTS t WITH (KAFKA_TOPIC='t') AS SELECT SUBJECT, COUNT(*) AS VALUE FROM s GROUP BY SUBJECT EMIT CHANGES;";
        engine.execute(statement).await.unwrap();

        let description = engine.describe("T").await.unwrap().unwrap();
        assert_eq!(description.defining_query(), Some(statement));
    }

    #[tokio::test]
    async fn test_create_if_not_exists_is_noop() {
        let engine = InMemoryEngine::new();
        engine
            .execute("CREATE STREAM IF NOT EXISTS s WITH (KAFKA_TOPIC='t');")
            .await
            .unwrap();
        engine
            .execute("CREATE STREAM IF NOT EXISTS s WITH (KAFKA_TOPIC='other');")
            .await
            .unwrap();

        assert_eq!(engine.statements().len(), 1);
        assert!(engine.describe("S").await.unwrap().unwrap().write_queries.is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_without_guard() {
        let engine = InMemoryEngine::new();
        engine.insert_source("T", None);
        let err = engine
            .execute("CREATE TABLE T AS SELECT 1 AS VALUE FROM S;")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeterflowError::Engine(ref e) if e.kind == EngineErrorKind::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn test_describe_missing() {
        let engine = InMemoryEngine::new();
        assert!(engine.describe("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_filters_rows() {
        let engine = InMemoryEngine::new();
        engine.insert_source("T", None);
        engine.seed(
            "T",
            &COLUMNS,
            vec![
                vec![json!("a"), json!(0), json!(60_000), json!(1.0)],
                vec![json!("a"), json!(60_000), json!(120_000), json!(2.0)],
                vec![json!("it's"), json!(0), json!(60_000), json!(3.0)],
            ],
        );

        let result = engine
            .pull("SELECT * FROM T WHERE WINDOWSTART >= 60000 AND SUBJECT = 'a';")
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][3], json!(2.0));

        let quoted = engine
            .pull("SELECT * FROM T WHERE SUBJECT = 'it''s';")
            .await
            .unwrap();
        assert_eq!(quoted.rows.len(), 1);

        let all = engine.pull("SELECT * FROM T;").await.unwrap();
        assert_eq!(all.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_pull_unknown_table_or_column() {
        let engine = InMemoryEngine::new();
        assert!(engine.pull("SELECT * FROM NOPE;").await.is_err());

        engine.insert_source("T", None);
        engine.seed("T", &COLUMNS, vec![vec![json!("a"), json!(0), json!(1), json!(1)]]);
        assert!(engine
            .pull("SELECT * FROM T WHERE GROUP_BY_0 = 'x';")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsupported_statement() {
        let engine = InMemoryEngine::new();
        let err = engine.execute("DROP TABLE T;").await.unwrap_err();
        assert!(matches!(
            err,
            MeterflowError::Engine(ref e) if e.kind == EngineErrorKind::Statement
        ));
    }
}

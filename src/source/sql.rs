//! External bounded-query source
//!
//! The query text is built here and always available; fetching rows needs the
//! `postgres` feature. Identifiers are validated instead of quoted so the
//! generated SQL stays readable in logs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Partition;
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("Valid regex pattern")
});

/// Construction parameters for a SQL source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlSpec {
    /// Connection URL, e.g. `postgres://user@host/db`
    pub url: String,
    pub table: String,
    pub key_column: String,
    pub value_column: String,
    /// Column giving the rows a stable order across ranged queries
    #[serde(default)]
    pub order_by: Option<String>,
}

impl SqlSpec {
    pub fn validate(&self) -> MapReduceResult<()> {
        if self.url.trim().is_empty() {
            return Err(MapReduceError::configuration_with_code(
                ErrorCode::CONFIG_MALFORMED_SOURCE,
                "SQL source requires a connection url",
            ));
        }

        let identifiers = [
            ("table", Some(&self.table)),
            ("key_column", Some(&self.key_column)),
            ("value_column", Some(&self.value_column)),
            ("order_by", self.order_by.as_ref()),
        ];
        for (field, value) in identifiers {
            if let Some(value) = value {
                if !IDENTIFIER.is_match(value) {
                    return Err(MapReduceError::configuration_with_code(
                        ErrorCode::CONFIG_MALFORMED_SOURCE,
                        format!("Invalid SQL identifier for {}: '{}'", field, value),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Query returning the rows of one partition as text cells
    pub fn range_query(&self, partition: Partition) -> String {
        let order = self
            .order_by
            .as_ref()
            .map(|column| format!(" ORDER BY {}", column))
            .unwrap_or_default();
        format!(
            "SELECT CAST({} AS TEXT) AS key, CAST({} AS TEXT) AS value FROM {}{} LIMIT {} OFFSET {}",
            self.key_column, self.value_column, self.table, order, partition.limit, partition.offset
        )
    }

    pub fn count_query(&self) -> String {
        format!("SELECT count(*) FROM {}", self.table)
    }
}

/// Text cells holding JSON are parsed, anything else stays a string
pub fn parse_cell(cell: Option<String>) -> Value {
    match cell {
        None => Value::Null,
        Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::SqlSource;

#[cfg(feature = "postgres")]
mod postgres {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::Row;
    use tracing::debug;

    use super::{parse_cell, SqlSpec};
    use crate::error::{ErrorExt, MapReduceResult};
    use crate::source::{DataSource, Partition, Record, Records};

    /// Rows of one partition fetched from PostgreSQL
    #[derive(Debug, Clone)]
    pub struct SqlSource {
        rows: Vec<Record>,
        covered: Partition,
        full_length: u64,
    }

    impl SqlSource {
        /// Connect, determine the full length and fetch the rows of `partition`
        ///
        /// The count query only runs when no length was declared.
        pub async fn fetch(
            spec: &SqlSpec,
            partition: Option<Partition>,
            declared_length: Option<u64>,
        ) -> MapReduceResult<Self> {
            spec.validate()?;

            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&spec.url)
                .await
                .to_source_error(format!("Failed to connect to {}", spec.table))?;

            let full_length = match declared_length {
                Some(length) => length,
                None => {
                    let count: i64 = sqlx::query_scalar(&spec.count_query())
                        .fetch_one(&pool)
                        .await
                        .to_source_error(format!("Count query on {} failed", spec.table))?;
                    count.max(0) as u64
                }
            };

            let covered = partition
                .unwrap_or(Partition::new(0, full_length))
                .clamp_to(full_length);
            let query = spec.range_query(covered);
            debug!(%query, "Fetching partition rows");

            let rows = sqlx::query(&query)
                .fetch_all(&pool)
                .await
                .to_source_error(format!("Range query on {} failed", spec.table))?;
            pool.close().await;

            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let key: Option<String> = row
                    .try_get("key")
                    .to_source_error("Row is missing its key column")?;
                let value: Option<String> = row
                    .try_get("value")
                    .to_source_error("Row is missing its value column")?;
                records.push(Record {
                    key: parse_cell(key),
                    value: parse_cell(value),
                });
            }

            Ok(Self {
                covered: Partition::new(covered.offset, records.len() as u64),
                rows: records,
                full_length,
            })
        }
    }

    impl DataSource for SqlSource {
        fn iterate(&self, partition: Partition) -> Records<'_> {
            let range = partition.intersect(&self.covered);
            if range.is_empty() {
                return Box::new(std::iter::empty());
            }
            let start = (range.offset - self.covered.offset) as usize;
            let end = start + range.limit as usize;
            Box::new(self.rows[start..end].iter().cloned())
        }

        fn full_length(&self) -> u64 {
            self.full_length
        }
    }
}

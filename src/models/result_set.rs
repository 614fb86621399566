//! Shapes of cached query results.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// == Result Set ==
/// A tabular query result as produced by the SQL layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column names, in select order
    pub columns: Vec<String>,
    /// Row cells, one inner vector per row
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// == Value Kind ==
/// Which shape a cached query result has. Part of the cache key, so the
/// same query text may be cached once as a table and once as a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Table,
    Scalar,
}

// == Query Value ==
/// A cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryValue {
    Table(Arc<ResultSet>),
    Scalar(i64),
}

impl QueryValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            QueryValue::Table(_) => ValueKind::Table,
            QueryValue::Scalar(_) => ValueKind::Scalar,
        }
    }

    pub fn as_table(&self) -> Option<&Arc<ResultSet>> {
        match self {
            QueryValue::Table(rs) => Some(rs),
            QueryValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            QueryValue::Scalar(v) => Some(*v),
            QueryValue::Table(_) => None,
        }
    }
}

//! Tabular result sets returned by every command.
//!
//! A command responds with zero or more result sets, each a table of rows
//! with named, typed columns, plus an optional error string. A failed
//! command always yields zero data rows and a non-empty error string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Column types understood by the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// UTF-8 string.
    Str,
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Double-precision float.
    Float,
}

/// One table in a command response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column names.
    pub names: Vec<String>,
    /// Column types, parallel to `names`.
    pub types: Vec<ColumnType>,
    /// Data rows; each row is parallel to `names`.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create an empty result set with the given column layout.
    pub fn new<N: Into<String>>(names: Vec<N>, types: Vec<ColumnType>) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        debug_assert_eq!(names.len(), types.len());
        Self {
            names,
            types,
            rows: Vec::new(),
        }
    }

    /// Append a row, checking its width against the column layout.
    pub fn append_row(&mut self, row: Vec<Value>) -> Result<(), Error> {
        if row.len() != self.names.len() {
            return Err(Error::Procedure(format!(
                "result row has {} values for {} columns",
                row.len(),
                self.names.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of data rows.
    pub fn rowcount(&self) -> usize {
        self.rows.len()
    }
}

/// The full, structured outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Error string; empty on success.
    pub error: Option<String>,
    /// Result sets; empty when the command failed.
    pub results: Vec<ResultSet>,
}

impl CommandResult {
    /// A successful result carrying the given tables.
    pub fn ok(results: Vec<ResultSet>) -> Self {
        Self {
            error: None,
            results,
        }
    }

    /// A successful result with no tables.
    pub fn empty() -> Self {
        Self::ok(Vec::new())
    }

    /// A failed result; the error string is never empty.
    pub fn fail(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            results: Vec::new(),
        }
    }

    /// Whether the command succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Error> for CommandResult {
    fn from(err: Error) -> Self {
        CommandResult::fail(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_must_match_columns() {
        let mut set = ResultSet::new(vec!["uuid", "is_alive"], vec![ColumnType::Str, ColumnType::Bool]);
        set.append_row(vec![json!("abc"), json!(true)]).unwrap();
        assert!(set.append_row(vec![json!("too-short")]).is_err());
        assert_eq!(set.rowcount(), 1);
    }

    #[test]
    fn failures_carry_no_rows() {
        let result = CommandResult::fail(Error::Group("group (g1) does not exist".into()));
        assert!(!result.is_ok());
        assert!(result.results.is_empty());
        assert!(!result.error.as_deref().unwrap_or("").is_empty());
    }
}

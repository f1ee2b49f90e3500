//! Storage-facing interfaces and backends.
//!
//! Handlers never talk to a database directly. They describe what they need as a
//! [`StorageQuery`] and run it on a worker thread through the shared [`Storage`] handle.

pub mod memory;
pub mod roster;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use xmpd_common::error::{XmpdError, XmpdResult};

pub use memory::MemoryStorage;
pub use roster::{RosterItem, load_roster};
pub use sqlite::SqliteStorage;

/// Closed set of lookups the protocol handlers issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageQuery {
    /// Rows (column `username`) for a user whose password matches.
    UserByCredentials {
        /// Local part of the user's jid.
        username: String,
        /// Plain-text password.
        password: String,
    },
    /// At most one row (column `password`) holding the user's password.
    PasswordForUser {
        /// Local part of the user's jid.
        username: String,
    },
    /// Roster contacts of `jid`: columns `contact_id`, `jid`, `name`, `subscription`.
    RosterItems {
        /// Bare jid of the roster owner.
        jid: String,
    },
    /// Group memberships of `jid`'s contacts: columns `contact_id`, `name`.
    RosterGroups {
        /// Bare jid of the roster owner.
        jid: String,
    },
}

impl StorageQuery {
    /// Short label used in logs and job names.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UserByCredentials { .. } => "user-by-credentials",
            Self::PasswordForUser { .. } => "password-for-user",
            Self::RosterItems { .. } => "roster-items",
            Self::RosterGroups { .. } => "roster-groups",
        }
    }
}

/// One column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Integer column.
    Integer(i64),
    /// Text column.
    Text(String),
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map_or(Self::Null, Self::Text)
    }
}

/// Result row with named columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(&'static str, Value)>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.columns.push((name, value));
        self
    }

    /// Raw column value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, value)| value)
    }

    /// Text column; `None` when missing, `NULL` or not text.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Integer column; `None` when missing, `NULL` or not an integer.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Text column that must be present.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when the column is missing or not text.
    pub fn require_str(&self, name: &str) -> XmpdResult<&str> {
        self.get_str(name)
            .ok_or_else(|| XmpdError::Storage(format!("row has no text column '{name}'")))
    }

    /// Integer column that must be present.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when the column is missing or not an integer.
    pub fn require_i64(&self, name: &str) -> XmpdResult<i64> {
        self.get_i64(name)
            .ok_or_else(|| XmpdError::Storage(format!("row has no integer column '{name}'")))
    }
}

/// Blocking query interface shared with worker threads.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Runs one query.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when the backend fails.
    fn query(&self, query: &StorageQuery) -> XmpdResult<Vec<Row>>;

    /// Backend name for startup logs.
    fn backend(&self) -> &'static str;
}

/// Opens the configured backend.
///
/// With a database path the SQLite backend is opened, its schema created and the demo
/// accounts seeded. Without one, a seeded in-memory backend is used.
///
/// # Errors
///
/// Returns `XmpdError::Storage` when the database cannot be opened or initialized.
pub fn open_storage(database_path: Option<&Path>, hostname: &str) -> XmpdResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match database_path {
        Some(path) => {
            let storage = SqliteStorage::open(path)?;
            storage.ensure_schema()?;
            storage.seed_demo(hostname)?;
            Arc::new(storage)
        }
        None => Arc::new(MemoryStorage::with_demo_users(hostname)),
    };
    info!(backend = storage.backend(), "storage opened");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::{Row, StorageQuery, Value, open_storage};
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::XmpdError;

    #[rstest]
    fn row_accessors_respect_column_types() {
        let row = Row::new()
            .with("jid", Value::Text("dv@localhost".to_owned()))
            .with("contact_id", Value::Integer(2))
            .with("name", Value::Null);

        assert_that!(row.get_str("jid"), eq(Some("dv@localhost")));
        assert_that!(row.get_i64("contact_id"), eq(Some(2_i64)));
        assert_that!(row.get_str("name"), eq(None::<&str>));
        assert_that!(row.get_i64("jid"), eq(None::<i64>));
        assert_that!(
            &row.require_str("missing"),
            eq(&Err(XmpdError::Storage("row has no text column 'missing'".to_owned())))
        );
    }

    #[rstest]
    fn open_without_path_uses_seeded_memory_backend() {
        let storage = open_storage(None, "localhost").expect("memory storage opens");
        let rows = storage
            .query(&StorageQuery::PasswordForUser {
                username: "tro".to_owned(),
            })
            .expect("query succeeds");
        assert_that!(storage.backend(), eq("memory"));
        assert_that!(rows.len(), eq(1_usize));
        assert_that!(rows[0].get_str("password"), eq(Some("test")));
    }

    #[rstest]
    fn open_with_path_uses_sqlite_backend() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("xmpd.db");
        let storage = open_storage(Some(&path), "localhost").expect("sqlite storage opens");
        assert_that!(storage.backend(), eq("sqlite"));
        assert_that!(
            &storage
                .query(&StorageQuery::UserByCredentials {
                    username: "dv".to_owned(),
                    password: "test".to_owned(),
                })
                .map(|rows| rows.len()),
            eq(&Ok(1_usize))
        );
    }
}

//! SQLite storage backend.
//!
//! Tables:
//! - `users(username, password)`: SASL accounts;
//! - `jids(id, jid)`: every bare jid that appears on a roster;
//! - `substates(stateid, name)`: subscription state names;
//! - `roster(userid, contactid, name, subscription)`;
//! - `rostergroups(groupid, userid, name)` and `rostergroupitems(groupid, contactid)`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use xmpd_common::error::{XmpdError, XmpdResult};

use crate::{Row, Storage, StorageQuery, Value};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        username TEXT PRIMARY KEY NOT NULL,
        password TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS jids (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        jid TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS substates (
        stateid INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS roster (
        userid INTEGER NOT NULL REFERENCES jids,
        contactid INTEGER NOT NULL REFERENCES jids,
        name TEXT,
        subscription INTEGER NOT NULL DEFAULT 0 REFERENCES substates,
        PRIMARY KEY (userid, contactid)
    );
    CREATE TABLE IF NOT EXISTS rostergroups (
        groupid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        userid INTEGER NOT NULL REFERENCES jids,
        name TEXT NOT NULL,
        UNIQUE (userid, name)
    );
    CREATE TABLE IF NOT EXISTS rostergroupitems (
        groupid INTEGER NOT NULL REFERENCES rostergroups,
        contactid INTEGER NOT NULL REFERENCES jids,
        PRIMARY KEY (groupid, contactid)
    );
    INSERT OR IGNORE INTO substates (stateid, name) VALUES
        (0, 'none'), (1, 'to'), (2, 'from'), (3, 'both');
";

const ROSTER_ITEMS: &str = "
    SELECT roster.contactid, contactjids.jid, roster.name, substates.name
    FROM roster
        JOIN jids AS userjids ON roster.userid = userjids.id
        JOIN jids AS contactjids ON roster.contactid = contactjids.id
        JOIN substates ON substates.stateid = roster.subscription
    WHERE userjids.jid = ?1
    ORDER BY roster.contactid";

const ROSTER_GROUPS: &str = "
    SELECT rgi.contactid, rgs.name
    FROM rostergroups AS rgs
        JOIN rostergroupitems AS rgi ON rgi.groupid = rgs.groupid
        JOIN jids ON rgs.userid = jids.id
    WHERE jids.jid = ?1
    ORDER BY rgi.contactid, rgs.name";

fn storage_error(context: &str, error: &rusqlite::Error) -> XmpdError {
    XmpdError::Storage(format!("{context} failed: {error}"))
}

/// Storage backed by one SQLite connection shared by all worker threads.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens (or creates) the database file.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when SQLite cannot open the file.
    pub fn open(path: &Path) -> XmpdResult<Self> {
        let conn = Connection::open(path)
            .map_err(|error| storage_error(&format!("open {}", path.display()), &error))?;
        debug!(path = %path.display(), "sqlite database opened");
        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when SQLite cannot allocate the database.
    pub fn open_in_memory() -> XmpdResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|error| storage_error("open in-memory database", &error))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates missing tables. Safe to call on an initialized database.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when a statement fails.
    pub fn ensure_schema(&self) -> XmpdResult<()> {
        self.lock()
            .execute_batch(SCHEMA)
            .map_err(|error| storage_error("create schema", &error))
    }

    /// Adds or replaces a user.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when the insert fails.
    pub fn add_user(&self, username: &str, password: &str) -> XmpdResult<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO users (username, password) VALUES (?1, ?2)",
                params![username, password],
            )
            .map(|_| ())
            .map_err(|error| storage_error("insert user", &error))
    }

    /// Adds `contact` to `owner`'s roster, creating jids and groups as needed.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` for an unknown subscription name or a failed statement.
    pub fn add_contact(
        &self,
        owner: &str,
        contact: &str,
        name: Option<&str>,
        subscription: &str,
        groups: &[&str],
    ) -> XmpdResult<()> {
        let conn = self.lock();
        let user_id = jid_id(&conn, owner)?;
        let contact_id = jid_id(&conn, contact)?;
        let state: i64 = conn
            .query_row(
                "SELECT stateid FROM substates WHERE name = ?1",
                params![subscription],
                |row| row.get(0),
            )
            .optional()
            .map_err(|error| storage_error("look up subscription state", &error))?
            .ok_or_else(|| XmpdError::Storage(format!("unknown subscription '{subscription}'")))?;
        let _ = conn
            .execute(
                "INSERT OR REPLACE INTO roster (userid, contactid, name, subscription)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, contact_id, name, state],
            )
            .map_err(|error| storage_error("insert roster item", &error))?;
        for group in groups {
            let _ = conn
                .execute(
                    "INSERT OR IGNORE INTO rostergroups (userid, name) VALUES (?1, ?2)",
                    params![user_id, group],
                )
                .map_err(|error| storage_error("insert roster group", &error))?;
            let _ = conn
                .execute(
                    "INSERT OR IGNORE INTO rostergroupitems (groupid, contactid)
                     SELECT groupid, ?3 FROM rostergroups WHERE userid = ?1 AND name = ?2",
                    params![user_id, group, contact_id],
                )
                .map_err(|error| storage_error("insert roster group item", &error))?;
        }
        Ok(())
    }

    /// Seeds the demo accounts `tro` and `dv` unless `users` already has rows.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Storage` when a statement fails.
    pub fn seed_demo(&self, hostname: &str) -> XmpdResult<()> {
        let existing: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|error| storage_error("count users", &error))?;
        if existing > 0 {
            return Ok(());
        }
        let tro = format!("tro@{hostname}");
        let dv = format!("dv@{hostname}");
        self.add_user("tro", "test")?;
        self.add_user("dv", "test")?;
        self.add_contact(&tro, &dv, None, "both", &["friends"])?;
        self.add_contact(&dv, &tro, None, "both", &[])?;
        debug!("demo accounts seeded");
        Ok(())
    }
}

fn jid_id(conn: &Connection, jid: &str) -> XmpdResult<i64> {
    let _ = conn
        .execute("INSERT OR IGNORE INTO jids (jid) VALUES (?1)", params![jid])
        .map_err(|error| storage_error("insert jid", &error))?;
    conn.query_row("SELECT id FROM jids WHERE jid = ?1", params![jid], |row| {
        row.get(0)
    })
    .map_err(|error| storage_error("look up jid", &error))
}

impl Storage for SqliteStorage {
    fn query(&self, query: &StorageQuery) -> XmpdResult<Vec<Row>> {
        let conn = self.lock();
        let context = query.label();
        let rows = match query {
            StorageQuery::UserByCredentials { username, password } => {
                let mut stmt = conn
                    .prepare("SELECT username FROM users WHERE username = ?1 AND password = ?2")
                    .map_err(|error| storage_error(context, &error))?;
                stmt.query_map(params![username, password], |row| {
                    Ok(Row::new().with("username", Value::Text(row.get(0)?)))
                })
                .and_then(Iterator::collect::<Result<Vec<_>, _>>)
            }
            StorageQuery::PasswordForUser { username } => {
                let mut stmt = conn
                    .prepare("SELECT password FROM users WHERE username = ?1")
                    .map_err(|error| storage_error(context, &error))?;
                stmt.query_map(params![username], |row| {
                    Ok(Row::new().with("password", Value::Text(row.get(0)?)))
                })
                .and_then(Iterator::collect::<Result<Vec<_>, _>>)
            }
            StorageQuery::RosterItems { jid } => {
                let mut stmt = conn
                    .prepare(ROSTER_ITEMS)
                    .map_err(|error| storage_error(context, &error))?;
                stmt.query_map(params![jid], |row| {
                    Ok(Row::new()
                        .with("contact_id", Value::Integer(row.get(0)?))
                        .with("jid", Value::Text(row.get(1)?))
                        .with("name", Value::from(row.get::<_, Option<String>>(2)?))
                        .with("subscription", Value::Text(row.get(3)?)))
                })
                .and_then(Iterator::collect::<Result<Vec<_>, _>>)
            }
            StorageQuery::RosterGroups { jid } => {
                let mut stmt = conn
                    .prepare(ROSTER_GROUPS)
                    .map_err(|error| storage_error(context, &error))?;
                stmt.query_map(params![jid], |row| {
                    Ok(Row::new()
                        .with("contact_id", Value::Integer(row.get(0)?))
                        .with("name", Value::Text(row.get(1)?)))
                })
                .and_then(Iterator::collect::<Result<Vec<_>, _>>)
            }
        };
        rows.map_err(|error| storage_error(context, &error))
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

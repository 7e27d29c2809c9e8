use std::path::Path;

use anyhow::{Context, Result};
use postsync_core::{Record, RecordId};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS data (
  id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  body TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_data_title ON data(title);
";

pub struct SqliteStore {
    conn: Connection,
}

/// One write transaction over the `data` table.
///
/// Dropping a session without calling [`RecordSession::commit`] rolls back
/// every staged change.
pub struct RecordSession<'conn> {
    tx: Transaction<'conn>,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create the `data` table and its title index when absent.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be created, including when an
    /// existing table already holds duplicate titles.
    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).context("failed to create data schema")
    }

    /// Begin a write transaction. Takes the write lock up front so concurrent
    /// sessions serialize instead of failing on lock upgrade.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn session(&mut self) -> Result<RecordSession<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        Ok(RecordSession { tx })
    }

    /// Load every stored record ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_records(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare("SELECT id, title, body FROM data ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Record { id: RecordId(row.get(0)?), title: row.get(1)?, body: row.get(2)? })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to decode data row")?);
        }
        Ok(records)
    }

    /// Count stored records.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_records(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM data", [], |row| row.get::<_, i64>(0))
            .context("failed to count data rows")?;
        usize::try_from(count).context("negative row count")
    }
}

impl RecordSession<'_> {
    /// Point lookup by title. Sees rows staged earlier in this session.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_by_title(&self, title: &str) -> Result<Option<Record>> {
        self.tx
            .query_row(
                "SELECT id, title, body FROM data WHERE title = ?1 ORDER BY id ASC LIMIT 1",
                params![title],
                |row| {
                    Ok(Record {
                        id: RecordId(row.get(0)?),
                        title: row.get(1)?,
                        body: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up record by title: {title}"))
    }

    /// Stage a new record.
    ///
    /// # Errors
    /// Returns an error when the insert is rejected, for example by the unique
    /// title index.
    pub fn insert(&self, title: &str, body: &str) -> Result<Record> {
        self.tx
            .execute("INSERT INTO data(title, body) VALUES (?1, ?2)", params![title, body])
            .with_context(|| format!("failed to insert record: {title}"))?;
        let id = RecordId(self.tx.last_insert_rowid());
        Ok(Record { id, title: title.to_string(), body: body.to_string() })
    }

    /// Replace the body of an existing record.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_body(&self, id: RecordId, body: &str) -> Result<()> {
        self.tx
            .execute("UPDATE data SET body = ?1 WHERE id = ?2", params![body, id.0])
            .with_context(|| format!("failed to update record {id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the commit fails; the transaction is rolled back.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit data transaction")
    }

    /// # Errors
    /// Returns an error when the rollback statement fails.
    pub fn rollback(self) -> Result<()> {
        self.tx.rollback().context("failed to roll back data transaction")
    }
}

/// Whether any error in the chain is a `SQLite` constraint violation
/// (unique, not-null, check, trigger abort, ...).
#[must_use]
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<rusqlite::Error>().and_then(rusqlite::Error::sqlite_error_code)
            == Some(ErrorCode::ConstraintViolation)
    })
}

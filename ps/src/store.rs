//! SQLite-backed record store
//!
//! All collections share a `records` table holding JSON documents and a
//! `record_indexes` table holding the indexed fields of each document.
//! Writes that read before they write (`create`, `modify`, `next_sequence`)
//! run inside an IMMEDIATE transaction so that several processes sharing one
//! database file serialize on the SQLite write lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info};

use super::filter::Filter;
use super::record::{IndexValue, Record};

/// Database file name inside the store directory
pub const DB_FILE: &str = "promptstore.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value_text TEXT,
    value_int INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes (collection, field, value_text, value_int);
CREATE TABLE IF NOT EXISTS sequences (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Persistent record store
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a store in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "Store::open: called");
        fs::create_dir_all(dir).context(format!("Failed to create store directory {}", dir.display()))?;

        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path).context(format!("Failed to open database {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(%mode, "Store::open: journal mode set");

        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        info!(path = %db_path.display(), "Store opened");

        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new record; fails if the id already exists
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        debug!(collection = T::collection_name(), id = record.id(), "Store::create: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if read_data(&tx, T::collection_name(), record.id())?.is_some() {
            return Err(eyre!(
                "Record {} already exists in {}",
                record.id(),
                T::collection_name()
            ));
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(record.id().to_string())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        debug!(collection = T::collection_name(), %id, "Store::get: called");
        read_data(&self.conn, T::collection_name(), id)?
            .map(|data| decode(&data))
            .transpose()
    }

    /// Replace an existing record; fails if it does not exist
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        debug!(collection = T::collection_name(), id = record.id(), "Store::update: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if read_data(&tx, T::collection_name(), record.id())?.is_none() {
            return Err(eyre!("Record {} not found in {}", record.id(), T::collection_name()));
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert or replace a record
    pub fn upsert<T: Record>(&mut self, record: T) -> Result<()> {
        debug!(collection = T::collection_name(), id = record.id(), "Store::upsert: called");
        let tx = self.conn.transaction()?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-write a record atomically
    ///
    /// Returns `Ok(None)` when the record does not exist. If `f` fails the
    /// transaction is rolled back and the error is returned unchanged, so
    /// callers can downcast it back to their own error type.
    pub fn modify<T, F>(&mut self, id: &str, f: F) -> Result<Option<T>>
    where
        T: Record,
        F: FnOnce(&mut T) -> Result<()>,
    {
        debug!(collection = T::collection_name(), %id, "Store::modify: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(data) = read_data(&tx, T::collection_name(), id)? else {
            debug!(%id, "Store::modify: record not found");
            return Ok(None);
        };
        let mut record: T = decode(&data)?;
        f(&mut record)?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    /// Delete a record; deleting a missing record is not an error
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<()> {
        debug!(collection = T::collection_name(), %id, "Store::delete: called");
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
        )?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// List records matching all filters (ordered by id)
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        debug!(collection = T::collection_name(), filter_count = filters.len(), "Store::list: called");
        let mut sql = String::from("SELECT r.data FROM records r");
        let mut values: Vec<Value> = Vec::with_capacity(filters.len() * 2 + 1);

        for (i, filter) in filters.iter().enumerate() {
            let column = match filter.value {
                IndexValue::String(_) => "value_text",
                IndexValue::Int(_) | IndexValue::Bool(_) => "value_int",
            };
            sql.push_str(&format!(
                " JOIN record_indexes f{i} ON f{i}.collection = r.collection AND f{i}.id = r.id \
                 AND f{i}.field = ? AND f{i}.{column} {op} ?",
                op = filter.op.as_sql()
            ));
            values.push(Value::Text(filter.field.clone()));
            values.push(sql_value(&filter.value));
        }
        sql.push_str(" WHERE r.collection = ? ORDER BY r.id");
        values.push(Value::Text(T::collection_name().to_string()));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode(&row?)?);
        }
        debug!(count = records.len(), "Store::list: done");
        Ok(records)
    }

    /// Atomically increment and return a named counter (starts at 1)
    pub fn next_sequence(&mut self, name: &str) -> Result<u64> {
        debug!(%name, "Store::next_sequence: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO sequences (name, value) VALUES (?1, 1) \
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        let value: i64 = tx.query_row("SELECT value FROM sequences WHERE name = ?1", params![name], |row| {
            row.get(0)
        })?;
        tx.commit()?;
        Ok(value as u64)
    }

    /// Recompute the index rows of every record in a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::rebuild_indexes: called");
        let records: Vec<T> = self.list(&[])?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        for record in &records {
            write_indexes(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }
}

fn decode<T: Record>(data: &str) -> Result<T> {
    serde_json::from_str(data).context(format!("Failed to decode {} record", T::collection_name()))
}

fn read_data(conn: &Connection, collection: &str, id: &str) -> Result<Option<String>> {
    let data = conn
        .query_row(
            "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data)
}

fn write_record<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let data = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![T::collection_name(), record.id(), data, record.updated_at()],
    )?;
    write_indexes(conn, record)
}

fn write_indexes<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    conn.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), record.id()],
    )?;
    for (field, value) in record.indexed_fields() {
        let (text, int) = match value {
            IndexValue::String(s) => (Some(s), None),
            IndexValue::Int(i) => (None, Some(i)),
            IndexValue::Bool(b) => (None, Some(b as i64)),
        };
        conn.execute(
            "INSERT INTO record_indexes (collection, id, field, value_text, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![T::collection_name(), record.id(), field, text, int],
        )?;
    }
    Ok(())
}

fn sql_value(value: &IndexValue) -> Value {
    match value {
        IndexValue::String(s) => Value::Text(s.clone()),
        IndexValue::Int(i) => Value::Integer(*i),
        IndexValue::Bool(b) => Value::Integer(*b as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        status: String,
        weight: i64,
        updated_at: i64,
    }

    impl Note {
        fn new(id: &str, status: &str, weight: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                weight,
                updated_at: crate::now_ms(),
            }
        }
    }

    impl Record for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "notes"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields.insert("weight".to_string(), IndexValue::Int(self.weight));
            fields
        }
    }

    #[test]
    fn test_create_get_update() {
        let mut store = Store::open_in_memory().unwrap();
        let id = store.create(Note::new("a", "open", 1)).unwrap();
        assert_eq!(id, "a");

        let mut note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.status, "open");

        note.status = "closed".to_string();
        store.update(note).unwrap();
        let note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.status, "closed");
    }

    #[test]
    fn test_create_duplicate_fails() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "open", 1)).unwrap();
        assert!(store.create(Note::new("a", "open", 2)).is_err());
    }

    #[test]
    fn test_update_missing_fails() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.update(Note::new("missing", "open", 1)).is_err());
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = Store::open_in_memory().unwrap();
        let note: Option<Note> = store.get("nope").unwrap();
        assert!(note.is_none());
    }

    #[test]
    fn test_list_with_filters() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "open", 1)).unwrap();
        store.create(Note::new("b", "open", 5)).unwrap();
        store.create(Note::new("c", "closed", 9)).unwrap();

        let open: Vec<Note> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert_eq!(open.len(), 2);

        let heavy_open: Vec<Note> = store
            .list(&[
                Filter::eq("status", "open"),
                Filter::new("weight", FilterOp::Gt, 2i64),
            ])
            .unwrap();
        assert_eq!(heavy_open.len(), 1);
        assert_eq!(heavy_open[0].id, "b");

        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_indexes_follow_updates() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "open", 1)).unwrap();
        store.upsert(Note::new("a", "closed", 1)).unwrap();

        let open: Vec<Note> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert!(open.is_empty());
        let closed: Vec<Note> = store.list(&[Filter::eq("status", "closed")]).unwrap();
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_modify_commits_and_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "open", 1)).unwrap();

        let modified: Option<Note> = store
            .modify("a", |n: &mut Note| {
                n.weight = 42;
                Ok(())
            })
            .unwrap();
        assert_eq!(modified.unwrap().weight, 42);

        let result: Result<Option<Note>> = store.modify("a", |n: &mut Note| {
            n.weight = 7;
            Err(eyre!("nope"))
        });
        assert!(result.is_err());
        let note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.weight, 42);

        let missing: Option<Note> = store.modify("zzz", |_n: &mut Note| Ok(())).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_delete() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "open", 1)).unwrap();
        store.delete::<Note>("a").unwrap();
        let note: Option<Note> = store.get("a").unwrap();
        assert!(note.is_none());
        let open: Vec<Note> = store.list(&[Filter::eq("status", "open")]).unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn test_next_sequence_is_monotonic() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(store.next_sequence("notes").unwrap(), 1);
        assert_eq!(store.next_sequence("notes").unwrap(), 2);
        assert_eq!(store.next_sequence("other").unwrap(), 1);
        assert_eq!(store.next_sequence("notes").unwrap(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Note::new("a", "open", 3)).unwrap();
            store.next_sequence("notes").unwrap();
        }
        let mut store = Store::open(temp.path()).unwrap();
        let note: Note = store.get("a").unwrap().unwrap();
        assert_eq!(note.weight, 3);
        assert_eq!(store.next_sequence("notes").unwrap(), 2);
        assert_eq!(store.rebuild_indexes::<Note>().unwrap(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_int_filters_match_linear_scan(weights in proptest::collection::vec(-50i64..50, 0..20), pivot in -50i64..50) {
            let mut store = Store::open_in_memory().unwrap();
            for (i, w) in weights.iter().enumerate() {
                store.create(Note::new(&format!("n{:03}", i), "open", *w)).unwrap();
            }
            let found: Vec<Note> = store.list(&[Filter::new("weight", FilterOp::Gte, pivot)]).unwrap();
            let expected = weights.iter().filter(|w| **w >= pivot).count();
            proptest::prop_assert_eq!(found.len(), expected);
        }
    }
}

pub mod schema;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use thiserror::Error;

use crate::record::{ColumnKind, FieldValue, FlatRecord};
use schema::{OutputSchema, SEG_ID};

const TABLE: &str = "classifications";
const CLASSIFIED_AT: &str = "CLASSIFIED_AT";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Object {seg_id} has already been classified")]
    Conflict { seg_id: i64 },
    #[error("Record not ready: missing {}", .missing.join(", "))]
    Incomplete { missing: Vec<String> },
    #[error("No output column for field(s): {0}")]
    UnknownColumn(String),
    #[error("Field {column} must be {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Inserted,
    Replaced,
}

/// The classification table: one row per segmentation id.
pub struct OutputStore {
    conn: Connection,
    schema: OutputSchema,
    path: Option<PathBuf>,
}

impl OutputStore {
    /// Open the table at `path`, creating it if needed.
    ///
    /// Never fails on a bad file: an unreadable or corrupt store is moved
    /// aside and replaced by an empty table. Anything at `path` that is not
    /// a regular file is left alone and an in-memory table is used. Only when no table can be
    /// created at all, not even in memory, is an error returned.
    pub fn load(path: &Path, schema: OutputSchema) -> Result<Self> {
        match Self::open(path, schema.clone()) {
            Ok(store) => return Ok(store),
            Err(e) => {
                log::warn!("Could not open output table {}: {}", path.display(), e);
            }
        }

        if path.is_file() {
            match quarantine(path) {
                Ok(moved) => log::warn!("Moved unreadable output table to {}", moved.display()),
                Err(e) => log::warn!("Could not move {} aside: {}", path.display(), e),
            }
            match Self::open(path, schema.clone()) {
                Ok(store) => return Ok(store),
                Err(e) => log::warn!("Could not recreate {}: {}", path.display(), e),
            }
        }

        log::warn!("Classifications will not be persisted this session");
        Self::open_in_memory(schema)
    }

    pub fn open(path: &Path, schema: OutputSchema) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            schema,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory(schema: OutputSchema) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            schema,
            path: None,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        // Every commit is flushed before returning.
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.migrate()?;
        Ok(())
    }

    /// Create the table, then add any schema column an older table lacks.
    fn migrate(&self) -> Result<()> {
        let column_defs: Vec<String> = self
            .schema
            .columns()
            .iter()
            .map(|c| {
                let constraint = if c.name == SEG_ID { " NOT NULL UNIQUE" } else { "" };
                format!("{} {}{}", quote_ident(&c.name), c.kind.sql_type(), constraint)
            })
            .collect();
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} ({}, {} TEXT)",
            column_defs.join(", "),
            quote_ident(CLASSIFIED_AT),
        ))?;

        let existing = self.existing_columns()?;
        for column in self.schema.columns() {
            if existing.contains(&column.name) {
                continue;
            }
            log::info!("Adding output column {}", column.name);
            self.conn.execute(
                &format!(
                    "ALTER TABLE {TABLE} ADD COLUMN {} {}",
                    quote_ident(&column.name),
                    column.kind.sql_type()
                ),
                [],
            )?;
        }
        Ok(())
    }

    fn existing_columns(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({TABLE})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Location on disk, `None` when the table only lives in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, seg_id: i64) -> bool {
        match self.exists(&self.conn, seg_id) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Lookup of {} in output table failed: {}", seg_id, e);
                false
            }
        }
    }

    fn exists(&self, conn: &Connection, seg_id: i64) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {TABLE} WHERE {} = ?1", quote_ident(SEG_ID)),
                [seg_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Write one flattened record.
    ///
    /// A row already stored for the same segmentation id is only replaced when
    /// `allow_overwrite` is set; otherwise `StoreError::Conflict` is returned
    /// and the stored row is left as it was.
    pub fn commit(&mut self, record: &FlatRecord, allow_overwrite: bool) -> Result<CommitOutcome> {
        let missing = self.schema.missing(record);
        if !missing.is_empty() {
            return Err(StoreError::Incomplete {
                missing: missing.into_iter().map(String::from).collect(),
            });
        }
        let unknown = self.schema.unknown(record);
        if !unknown.is_empty() {
            return Err(StoreError::UnknownColumn(unknown.join(", ")));
        }

        let mut names = Vec::with_capacity(record.len() + 1);
        let mut values = Vec::with_capacity(record.len() + 1);
        let mut seg_id = None;
        for (name, value) in record {
            let kind = self
                .schema
                .column(name)
                .map(|c| c.kind)
                .ok_or_else(|| StoreError::UnknownColumn(name.clone()))?;
            let value = value.clone().coerce(kind).ok_or_else(|| StoreError::TypeMismatch {
                column: name.clone(),
                expected: kind.label(),
            })?;
            if name == SEG_ID {
                seg_id = value.as_i64();
            }
            names.push(quote_ident(name));
            values.push(to_sql_value(&value));
        }
        let seg_id = seg_id.ok_or_else(|| StoreError::Incomplete {
            missing: vec![SEG_ID.to_string()],
        })?;
        names.push(quote_ident(CLASSIFIED_AT));
        values.push(Value::Text(chrono::Utc::now().to_rfc3339()));

        let tx = self.conn.transaction()?;
        let existed = {
            let found = tx
                .query_row(
                    &format!("SELECT 1 FROM {TABLE} WHERE {} = ?1", quote_ident(SEG_ID)),
                    [seg_id],
                    |_| Ok(()),
                )
                .optional()?;
            found.is_some()
        };
        if existed && !allow_overwrite {
            return Err(StoreError::Conflict { seg_id });
        }
        if existed {
            // Drop the whole row so optional fields of the old record don't survive.
            tx.execute(
                &format!("DELETE FROM {TABLE} WHERE {} = ?1", quote_ident(SEG_ID)),
                [seg_id],
            )?;
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        tx.execute(
            &format!(
                "INSERT INTO {TABLE} ({}) VALUES ({})",
                names.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
        tx.commit()?;

        if existed {
            log::info!("Replaced classification for object {}", seg_id);
            Ok(CommitOutcome::Replaced)
        } else {
            log::info!("Stored classification for object {}", seg_id);
            Ok(CommitOutcome::Inserted)
        }
    }

    /// The stored row for `seg_id`, without null fields.
    pub fn get(&self, seg_id: i64) -> Result<Option<FlatRecord>> {
        let sql = format!(
            "SELECT {} FROM {TABLE} WHERE {} = ?1",
            self.select_list(),
            quote_ident(SEG_ID)
        );
        let row = self
            .conn
            .query_row(&sql, [seg_id], |row| self.read_row(row))
            .optional()?;
        Ok(row)
    }

    /// Every stored row, ordered by segmentation id.
    pub fn rows(&self) -> Result<Vec<FlatRecord>> {
        let sql = format!(
            "SELECT {} FROM {TABLE} ORDER BY {}",
            self.select_list(),
            quote_ident(SEG_ID)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| self.read_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn seg_ids(&self) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM {TABLE}", quote_ident(SEG_ID)))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Write every stored row to a CSV file in schema column order.
    /// Returns the number of rows written.
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let rows = self.rows()?;
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.schema.columns().iter().map(|c| c.name.as_str()))?;
        for row in &rows {
            writer.write_record(
                self.schema
                    .columns()
                    .iter()
                    .map(|c| row.get(&c.name).map(|v| v.to_string()).unwrap_or_default()),
            )?;
        }
        writer.flush()?;
        Ok(rows.len())
    }

    fn select_list(&self) -> String {
        self.schema
            .columns()
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn read_row(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<FlatRecord> {
        let mut record = FlatRecord::new();
        for (i, column) in self.schema.columns().iter().enumerate() {
            if let Some(value) = from_sql_value(column.kind, row.get_ref(i)?) {
                record.insert(column.name.clone(), value);
            }
        }
        Ok(record)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
        FieldValue::Int(i) => Value::Integer(*i),
        FieldValue::Float(x) => Value::Real(*x),
        FieldValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sql_value(kind: ColumnKind, value: ValueRef<'_>) -> Option<FieldValue> {
    match (kind, value) {
        (_, ValueRef::Null) => None,
        (ColumnKind::Bool, ValueRef::Integer(i)) => Some(FieldValue::Bool(i != 0)),
        (ColumnKind::Int, ValueRef::Integer(i)) => Some(FieldValue::Int(i)),
        (ColumnKind::Float, ValueRef::Integer(i)) => Some(FieldValue::Float(i as f64)),
        (ColumnKind::Float, ValueRef::Real(x)) => Some(FieldValue::Float(x)),
        (_, ValueRef::Text(bytes)) => Some(FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())),
        (_, ValueRef::Integer(i)) => Some(FieldValue::Int(i)),
        (_, ValueRef::Real(x)) => Some(FieldValue::Float(x)),
        (_, ValueRef::Blob(_)) => None,
    }
}

/// Rename an unreadable store out of the way, keeping it for inspection.
fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| crate::OUTPUT_FILE_NAME.to_string());
    let target = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
    std::fs::rename(path, &target)?;
    for sidecar in ["-wal", "-shm"] {
        let side = path.with_file_name(format!("{file_name}{sidecar}"));
        if side.exists() {
            std::fs::remove_file(&side).ok();
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BeamKey};
    use schema::*;

    fn schema() -> OutputSchema {
        OutputSchema::from_config(&AppConfig::default())
    }

    fn complete_record(seg_id: i64, quality: &str) -> FlatRecord {
        let schema = schema();
        let mut record = FlatRecord::new();
        record.insert(ID.into(), format!("{seg_id:05}").into());
        record.insert(SEG_ID.into(), seg_id.into());
        record.insert(RA.into(), 3.58.into());
        record.insert(DEC.into(), (-30.39).into());
        for beam in schema.beams() {
            record.insert(BeamField::Quality.column(beam), quality.into());
            record.insert(BeamField::Coverage.column(beam), 1.0.into());
        }
        record.insert(GRIZLI_REDSHIFT.into(), 1.2.into());
        record.insert(ESTIMATED_REDSHIFT.into(), 1.25.into());
        record
    }

    #[test]
    fn test_commit_and_get() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let record = complete_record(11, "Good");
        assert_eq!(store.commit(&record, false).unwrap(), CommitOutcome::Inserted);
        assert!(store.contains(11));
        assert!(!store.contains(12));
        assert_eq!(store.get(11).unwrap(), Some(record));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_conflict_leaves_row_unchanged() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let original = complete_record(11, "Good");
        store.commit(&original, false).unwrap();

        let second = complete_record(11, "Poor");
        assert!(matches!(
            store.commit(&second, false),
            Err(StoreError::Conflict { seg_id: 11 })
        ));
        assert_eq!(store.get(11).unwrap(), Some(original));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_overwrite_replaces_whole_row() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let mut first = complete_record(11, "Good");
        first.insert(COMMENTS.into(), "blended with neighbour".into());
        store.commit(&first, false).unwrap();

        let second = complete_record(11, "Poor");
        assert_eq!(store.commit(&second, true).unwrap(), CommitOutcome::Replaced);
        let stored = store.get(11).unwrap().unwrap();
        assert_eq!(stored, second);
        assert!(!stored.contains_key(COMMENTS));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_incomplete_record_rejected() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let mut record = complete_record(5, "Good");
        record.remove(ESTIMATED_REDSHIFT);
        match store.commit(&record, false) {
            Err(StoreError::Incomplete { missing }) => {
                assert_eq!(missing, vec![ESTIMATED_REDSHIFT.to_string()])
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_unknown_and_mistyped_fields_rejected() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let mut record = complete_record(5, "Good");
        record.insert("F444W,0.0_QUALITY".into(), "Good".into());
        assert!(matches!(store.commit(&record, false), Err(StoreError::UnknownColumn(_))));

        let mut record = complete_record(5, "Good");
        record.insert(RA.into(), "east".into());
        assert!(matches!(
            store.commit(&record, false),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_optional_fields_round_trip_typed() {
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        let mut record = complete_record(7, "Good");
        record.insert(UNRELIABLE_REDSHIFT.into(), true.into());
        record.insert(BAD_SEG_MAP.into(), false.into());
        record.insert(
            BeamField::Contamination.column(&BeamKey::new("F150W", "341.0")),
            "Mild".into(),
        );
        store.commit(&record, false).unwrap();
        assert_eq!(store.get(7).unwrap(), Some(record));
    }

    #[test]
    fn test_load_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(crate::OUTPUT_FILE_NAME);
        let record = complete_record(42, "Good");
        {
            let mut store = OutputStore::load(&path, schema()).unwrap();
            store.commit(&record, false).unwrap();
        }
        let reopened = OutputStore::load(&path, schema()).unwrap();
        assert!(reopened.contains(42));
        assert_eq!(reopened.get(42).unwrap(), Some(record));
        assert_eq!(reopened.seg_ids().unwrap(), HashSet::from([42]));
    }

    #[test]
    fn test_corrupt_file_yields_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::OUTPUT_FILE_NAME);
        // Larger than a page, so SQLite reads (and rejects) the header.
        std::fs::write(&path, b"SIMPLE  =                    T / half-written table".repeat(200)).unwrap();

        let mut store = OutputStore::load(&path, schema()).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.path(), Some(path.as_path()));
        store.commit(&complete_record(1, "Good"), false).unwrap();

        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);
        assert!(OutputStore::load(&path, schema()).unwrap().contains(1));
    }

    #[test]
    fn test_directory_at_output_path_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::OUTPUT_FILE_NAME);
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep.txt"), b"operator notes").unwrap();

        let store = OutputStore::load(&path, schema()).unwrap();
        assert_eq!(store.path(), None);
        assert!(store.is_empty().unwrap());
        assert!(path.is_dir());
        assert!(path.join("keep.txt").is_file());
        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(!moved);
    }

    #[test]
    fn test_new_beam_columns_added_to_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::OUTPUT_FILE_NAME);
        let narrow = OutputSchema::new(vec![BeamKey::new("F115W", "72.0")]);
        drop(OutputStore::open(&path, narrow).unwrap());

        let mut store = OutputStore::open(&path, schema()).unwrap();
        store.commit(&complete_record(3, "Good"), false).unwrap();
        assert!(store.contains(3));
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutputStore::open_in_memory(schema()).unwrap();
        store.commit(&complete_record(2, "Good"), false).unwrap();
        store.commit(&complete_record(1, "Poor"), false).unwrap();

        let out = dir.path().join("out.csv");
        assert_eq!(store.export_csv(&out).unwrap(), 2);
        let text = std::fs::read_to_string(&out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("ID,SEG_ID,RA,DEC,\"F115W,72.0_QUALITY\""));
        assert!(lines.next().unwrap().starts_with("00001,1,"));
        assert!(lines.next().unwrap().starts_with("00002,2,"));
    }
}

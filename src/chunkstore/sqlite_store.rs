//! SQLite implementation of the ChunkStore trait
//!
//! Each bucket owns two tables: `{bucket}_files` holds one record per file
//! and `{bucket}_chunks` holds the numbered chunks. An upload stages its
//! chunks first and becomes visible only when its file row is inserted; a
//! failed upload removes whatever it staged. The connection lock is held per
//! statement, never across a whole transfer.

use crate::chunkstore::{
    read_chunk, system_clock, truncate_to_millis, unique_value, BlobId, ChunkStore,
    ChunkStoreError, Clock, Filter, FindQuery, Metadata, SortDirection, StoredFile,
    UploadOptions, Value, CHUNK_SIZE_FIELD, FILENAME_FIELD, ID_FIELD, LENGTH_FIELD,
    METADATA_PREFIX, UPLOAD_DATE_FIELD,
};
use crate::config::StoreConfig;
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Raw columns of a file row, converted outside the rusqlite row callback.
type FileRow = (String, String, i64, i64, i64, String);

/// SQLite implementation of ChunkStore
pub struct SQLiteChunkStore {
    conn: Mutex<Connection>,
    files_table: String,
    chunks_table: String,
    unique_fields: Mutex<Vec<String>>,
    clock: Clock,
}

impl SQLiteChunkStore {
    /// Open (or create) the database described by the store configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self, ChunkStoreError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = Path::new(&config.data_dir).join(format!("{}.sqlite3", config.database_name));
        info!("Opening SQLite chunk store at {} (bucket: {})", db_path.display(), config.bucket_name);
        Self::open(&db_path, &config.bucket_name)
    }

    pub fn open(path: &Path, bucket: &str) -> Result<Self, ChunkStoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, bucket)
    }

    pub fn open_in_memory(bucket: &str) -> Result<Self, ChunkStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, bucket)
    }

    /// Replace the clock that stamps upload dates.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn init(conn: Connection, bucket: &str) -> Result<Self, ChunkStoreError> {
        if !is_identifier(bucket) {
            return Err(ChunkStoreError::InvalidConfig(format!(
                "bucket name must contain only letters, digits and '_': {:?}",
                bucket
            )));
        }
        let files_table = format!("{}_files", bucket);
        let chunks_table = format!("{}_chunks", bucket);

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {files} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                filename TEXT NOT NULL,
                length INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                upload_date INTEGER NOT NULL,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {files}_filename ON {files} (filename);
            CREATE INDEX IF NOT EXISTS {files}_upload_date ON {files} (upload_date);
            CREATE TABLE IF NOT EXISTS {chunks} (
                files_id TEXT NOT NULL,
                n INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (files_id, n)
            );",
            files = files_table,
            chunks = chunks_table,
        ))?;

        // staged chunks of uploads interrupted by a previous shutdown
        let orphans = conn.execute(
            &format!("DELETE FROM {chunks} WHERE files_id NOT IN (SELECT id FROM {files})",
                     chunks = chunks_table, files = files_table),
            [],
        )?;
        if orphans > 0 {
            warn!("Removed {} orphaned chunk(s) from {}", orphans, chunks_table);
        }

        Ok(Self {
            conn: Mutex::new(conn),
            files_table,
            chunks_table,
            unique_fields: Mutex::new(Vec::new()),
            clock: system_clock(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ChunkStoreError> {
        self.conn.lock().map_err(|_| ChunkStoreError::Poisoned)
    }

    fn index_name(&self, field: &str) -> String {
        format!("{}_uniq_{}", self.files_table, field.replace('.', "_"))
    }

    /// Translate a unique constraint failure into the field and value that collided.
    fn duplicate_key(&self, err: &rusqlite::Error, metadata: &Metadata) -> ChunkStoreError {
        let message = match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
            other => other.to_string(),
        };
        let fields = match self.unique_fields.lock() {
            Ok(fields) => fields.clone(),
            Err(_) => return ChunkStoreError::Poisoned,
        };
        let field = fields
            .iter()
            .find(|f| message.contains(&self.index_name(f)))
            .or_else(|| fields.first())
            .cloned()
            .unwrap_or_else(|| ID_FIELD.to_string());
        let value = unique_value(metadata, &field).unwrap_or_default();
        ChunkStoreError::DuplicateKey { field, value }
    }

    /// Write every chunk of `source` under `id_text`. The source is read
    /// without the connection lock; the lock is taken per chunk insert.
    fn stage_chunks(
        &self,
        id_text: &str,
        source: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<(u64, i64), ChunkStoreError> {
        let insert = format!("INSERT INTO {} (files_id, n, data) VALUES (?1, ?2, ?3)", self.chunks_table);
        let mut buffer = vec![0u8; chunk_size];
        let mut length: u64 = 0;
        let mut n: i64 = 0;
        loop {
            let read = read_chunk(source, &mut buffer)?;
            if read == 0 {
                break;
            }
            {
                let conn = self.conn()?;
                conn.prepare_cached(&insert)?.execute(params![id_text, n, &buffer[..read]])?;
            }
            length += read as u64;
            n += 1;
            if read < chunk_size {
                break;
            }
        }
        Ok((length, n))
    }

    /// Best-effort removal of the chunks of an upload that never committed.
    fn discard_chunks(&self, id_text: &str) {
        let removed = self.conn().and_then(|conn| {
            conn.execute(&format!("DELETE FROM {} WHERE files_id = ?1", self.chunks_table), params![id_text])
                .map_err(ChunkStoreError::from)
        });
        if let Err(e) = removed {
            warn!("Could not discard staged chunks of {}: {}", id_text, e);
        }
    }

    fn find_one(&self, id: &BlobId) -> Result<Option<StoredFile>, ChunkStoreError> {
        let query = FindQuery::new(Filter::eq(ID_FIELD, Value::Text(id.to_string()))).with_limit(1);
        Ok(self.find(&query)?.into_iter().next())
    }
}

impl ChunkStore for SQLiteChunkStore {
    fn upload_from_stream(
        &self,
        filename: &str,
        source: &mut dyn Read,
        options: &UploadOptions,
    ) -> Result<BlobId, ChunkStoreError> {
        let chunk_size = options.chunk_size_bytes;
        if chunk_size == 0 {
            return Err(ChunkStoreError::InvalidConfig("chunk size must be positive".into()));
        }
        let id = BlobId::generate();
        let id_text = id.to_string();
        let metadata_json = serde_json::to_string(&options.metadata)?;

        // chunks stay invisible until their file row exists
        let (length, n) = match self.stage_chunks(&id_text, source, chunk_size) {
            Ok(staged) => staged,
            Err(e) => {
                self.discard_chunks(&id_text);
                return Err(e);
            }
        };

        let upload_date = truncate_to_millis((self.clock)());
        let inserted = {
            let conn = self.conn()?;
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO {} (id, filename, length, chunk_size, upload_date, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    self.files_table
                ),
                params![
                    id_text,
                    filename,
                    length as i64,
                    chunk_size as i64,
                    upload_date.timestamp_millis(),
                    metadata_json
                ],
            );
            inserted
        };
        if let Err(e) = inserted {
            self.discard_chunks(&id_text);
            if is_unique_violation(&e) {
                let err = self.duplicate_key(&e, &options.metadata);
                warn!("Rejected upload of {}: {}", filename, err);
                return Err(err);
            }
            return Err(e.into());
        }

        debug!("Committed file {} ({}) with {} bytes in {} chunks", id, filename, length, n);
        Ok(id)
    }

    fn download_to_stream(&self, id: &BlobId, sink: &mut dyn Write) -> Result<u64, ChunkStoreError> {
        let file = self.find_one(id)?.ok_or(ChunkStoreError::FileNotFound(*id))?;
        if file.chunk_size == 0 {
            return Err(ChunkStoreError::Corrupt { id: *id, reason: "chunk size is zero".into() });
        }
        let chunk_count = (file.length + file.chunk_size - 1) / file.chunk_size;
        let select = format!("SELECT data FROM {} WHERE files_id = ?1 AND n = ?2", self.chunks_table);
        let id_text = id.to_string();

        let mut written: u64 = 0;
        for n in 0..chunk_count {
            // the lock is held per chunk only, a slow sink never blocks other requests
            let data: Option<Vec<u8>> = {
                let conn = self.conn()?;
                let chunk = conn
                    .query_row(&select, params![id_text, n as i64], |row| row.get(0))
                    .optional()?;
                chunk
            };
            let data = data.ok_or_else(|| ChunkStoreError::Corrupt {
                id: *id,
                reason: format!("missing chunk {}", n),
            })?;
            sink.write_all(&data)?;
            written += data.len() as u64;
        }
        sink.flush()?;

        if written != file.length {
            return Err(ChunkStoreError::Corrupt {
                id: *id,
                reason: format!("expected {} bytes, found {}", file.length, written),
            });
        }
        Ok(written)
    }

    fn find(&self, query: &FindQuery) -> Result<Vec<StoredFile>, ChunkStoreError> {
        let mut values = Vec::new();
        let where_clause = filter_sql(&query.filter, &mut values);

        let mut order_terms: Vec<String> = Vec::new();
        if let Some(sort) = &query.sort {
            let dir = match sort.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            for field in &sort.fields {
                if let Some(expr) = column_expr(field) {
                    order_terms.push(format!("{} {}", expr, dir));
                }
            }
        }
        order_terms.push("seq ASC".to_string());

        let sql = format!(
            "SELECT id, filename, length, chunk_size, upload_date, metadata FROM {}
             WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            self.files_table,
            where_clause,
            order_terms.join(", ")
        );
        let limit = if query.limit == 0 { -1 } else { i64::try_from(query.limit).unwrap_or(i64::MAX) };
        values.push(SqlValue::Integer(limit));
        values.push(SqlValue::Integer(i64::try_from(query.skip).unwrap_or(i64::MAX)));

        let rows: Vec<FileRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            })?;
            let rows = mapped.collect::<Result<Vec<FileRow>, _>>()?;
            rows
        };

        rows.into_iter().map(stored_file_from_row).collect()
    }

    fn delete(&self, id: &BlobId) -> Result<bool, ChunkStoreError> {
        let id_text = id.to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(&format!("DELETE FROM {} WHERE id = ?1", self.files_table), params![id_text])?;
        let chunks = tx.execute(&format!("DELETE FROM {} WHERE files_id = ?1", self.chunks_table), params![id_text])?;
        tx.commit()?;
        debug!("Deleted file {}: {} record(s), {} chunk(s)", id, removed, chunks);
        Ok(removed > 0)
    }

    fn count_documents(&self, filter: &Filter) -> Result<u64, ChunkStoreError> {
        let mut values = Vec::new();
        let where_clause = filter_sql(filter, &mut values);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.files_table, where_clause);
        let conn = self.conn()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn create_unique_index(&self, field: &str) -> Result<(), ChunkStoreError> {
        let expr = column_expr(field).ok_or_else(|| ChunkStoreError::UnsupportedField(field.to_string()))?;
        let name = self.index_name(field);
        {
            let conn = self.conn()?;
            conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                name, self.files_table, expr
            ))?;
        }
        let mut fields = self.unique_fields.lock().map_err(|_| ChunkStoreError::Poisoned)?;
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        info!("Unique index {} ensured on {}", name, field);
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// SQL expression for a store-level field name, `None` when the field cannot exist.
fn column_expr(field: &str) -> Option<String> {
    let column = match field {
        ID_FIELD => "id",
        FILENAME_FIELD => "filename",
        LENGTH_FIELD => "length",
        CHUNK_SIZE_FIELD => "chunk_size",
        UPLOAD_DATE_FIELD => "upload_date",
        _ => {
            let key = field.strip_prefix(METADATA_PREFIX)?;
            if !is_identifier(key) {
                return None;
            }
            return Some(format!("json_extract(metadata, '$.{}')", key));
        }
    };
    Some(column.to_string())
}

fn sql_value(value: &Value) -> (SqlValue, &'static str) {
    match value {
        Value::Integer(i) => (SqlValue::Integer(*i), "integer"),
        Value::Text(s) => (SqlValue::Text(s.clone()), "text"),
        Value::Timestamp(ts) => (SqlValue::Integer(ts.timestamp_millis()), "integer"),
    }
}

fn comparison(field: &str, op: &str, value: &Value, values: &mut Vec<SqlValue>) -> String {
    match column_expr(field) {
        // a missing field satisfies no condition
        None => "0".to_string(),
        Some(expr) => {
            let (bound, kind) = sql_value(value);
            values.push(bound);
            format!("(typeof({expr}) = '{kind}' AND {expr} {op} ?)", expr = expr, kind = kind, op = op)
        }
    }
}

fn filter_sql(filter: &Filter, values: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::Empty => "1".to_string(),
        Filter::Eq(field, value) => comparison(field, "=", value, values),
        Filter::Gte(field, value) => comparison(field, ">=", value, values),
        Filter::Lte(field, value) => comparison(field, "<=", value, values),
        Filter::And(terms) if terms.is_empty() => "1".to_string(),
        Filter::And(terms) => {
            let parts: Vec<String> = terms.iter().map(|t| filter_sql(t, values)).collect();
            format!("({})", parts.join(" AND "))
        }
    }
}

fn stored_file_from_row(row: FileRow) -> Result<StoredFile, ChunkStoreError> {
    let (id_text, filename, length, chunk_size, upload_millis, metadata_json) = row;
    let id: BlobId = id_text.parse().map_err(|e| {
        ChunkStoreError::InvalidConfig(format!("stored id {:?} is not valid: {}", id_text, e))
    })?;
    let upload_date = Utc.timestamp_millis_opt(upload_millis).single().ok_or_else(|| {
        ChunkStoreError::Corrupt { id, reason: format!("invalid upload date {}", upload_millis) }
    })?;
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    Ok(StoredFile {
        id,
        filename,
        length: length.max(0) as u64,
        chunk_size: chunk_size.max(0) as u64,
        upload_date,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkstore::SortSpec;
    use std::io::{self, Cursor};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    /// Hands out `step` bytes per read and parks on its second read until released.
    struct GatedReader {
        data: Cursor<Vec<u8>>,
        step: usize,
        reads: usize,
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if self.reads == 2 {
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            let n = buf.len().min(self.step);
            self.data.read(&mut buf[..n])
        }
    }

    /// Yields one chunk worth of bytes, then fails.
    struct BreaksAfterFirstChunk {
        served: bool,
    }

    impl Read for BreaksAfterFirstChunk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "source vanished"));
            }
            self.served = true;
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"abcd"[..n]);
            Ok(n)
        }
    }

    fn total_chunk_rows(store: &SQLiteChunkStore) -> i64 {
        let conn = store.conn().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", store.chunks_table), [], |r| r.get(0))
            .unwrap()
    }

    fn options(hash: &str, chunk_size: usize) -> UploadOptions {
        let mut metadata = Metadata::new();
        metadata.insert("sha256".into(), serde_json::Value::String(hash.into()));
        UploadOptions { chunk_size_bytes: chunk_size, metadata }
    }

    fn chunk_rows(store: &SQLiteChunkStore, id: &BlobId) -> i64 {
        let conn = store.conn().unwrap();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE files_id = ?1", store.chunks_table),
            params![id.to_string()],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_sqlite_chunk_store_basic_operations() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        let data = b"0123456789";

        let id = store
            .upload_from_stream("digits.txt", &mut Cursor::new(data.to_vec()), &options("h1", 4))
            .unwrap();
        assert_eq!(chunk_rows(&store, &id), 3);

        let file = store.find_one(&id).unwrap().unwrap();
        assert_eq!(file.filename, "digits.txt");
        assert_eq!(file.length, 10);
        assert_eq!(file.chunk_size, 4);
        assert_eq!(file.metadata_str("sha256"), Some("h1"));

        let mut out = Vec::new();
        assert_eq!(store.download_to_stream(&id, &mut out).unwrap(), 10);
        assert_eq!(out, data);

        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 1);
        assert!(store.delete(&id).unwrap());
        assert_eq!(chunk_rows(&store, &id), 0);
        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 0);
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn test_exact_multiple_of_chunk_size() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        let id = store
            .upload_from_stream("eight", &mut Cursor::new(b"abcdefgh".to_vec()), &options("h", 4))
            .unwrap();
        assert_eq!(chunk_rows(&store, &id), 2);
        let mut out = Vec::new();
        store.download_to_stream(&id, &mut out).unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[test]
    fn test_empty_file() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        let id = store
            .upload_from_stream("empty", &mut Cursor::new(Vec::new()), &options("e", 4))
            .unwrap();
        let mut out = Vec::new();
        assert_eq!(store.download_to_stream(&id, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_unique_index_rolls_back_chunks() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        store.create_unique_index("metadata.sha256").unwrap();
        store.create_unique_index("metadata.sha256").unwrap();

        store
            .upload_from_stream("one", &mut Cursor::new(b"same".to_vec()), &options("dup", 2))
            .unwrap();
        let err = store
            .upload_from_stream("two", &mut Cursor::new(b"same".to_vec()), &options("dup", 2))
            .unwrap_err();
        match err {
            ChunkStoreError::DuplicateKey { field, value } => {
                assert_eq!(field, "metadata.sha256");
                assert_eq!(value, "dup");
            }
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 1);
        let conn = store.conn().unwrap();
        let total_chunks: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", store.chunks_table), [], |r| r.get(0))
            .unwrap();
        assert_eq!(total_chunks, 2);
    }

    #[test]
    fn test_find_with_filter_sort_and_window() {
        let ticks = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let clock_ticks = Arc::clone(&ticks);
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap().with_clock(Arc::new(move || {
            let n = clock_ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
        }));

        for (name, hash) in [("b", "1"), ("c", "2"), ("a", "3")] {
            store
                .upload_from_stream(name, &mut Cursor::new(name.as_bytes().to_vec()), &options(hash, 8))
                .unwrap();
        }

        let all = store.find(&FindQuery::default()).unwrap();
        let names: Vec<_> = all.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        let sorted = FindQuery {
            sort: Some(SortSpec { fields: vec!["filename".into()], direction: SortDirection::Descending }),
            skip: 1,
            limit: 1,
            ..FindQuery::default()
        };
        let page = store.find(&sorted).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].filename, "b");

        let since_day_two = Filter::gte(
            "uploadDate",
            Value::Timestamp(Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap()),
        );
        assert_eq!(store.count_documents(&since_day_two).unwrap(), 2);

        let by_hash = Filter::and(vec![
            Filter::eq("metadata.sha256", Value::Text("3".into())),
            Filter::eq("filename", Value::Text("a".into())),
        ]);
        assert_eq!(store.find(&FindQuery::new(by_hash)).unwrap().len(), 1);

        // unknown fields match nothing and do not break sorting
        assert_eq!(store.count_documents(&Filter::eq("bogus", Value::Text("x".into()))).unwrap(), 0);
        let odd_sort = FindQuery {
            sort: Some(SortSpec { fields: vec!["bogus".into()], direction: SortDirection::Ascending }),
            ..FindQuery::default()
        };
        assert_eq!(store.find(&odd_sort).unwrap().len(), 3);

        // a numeric bound never matches a text column
        assert_eq!(store.count_documents(&Filter::eq("filename", Value::Integer(1))).unwrap(), 0);
    }

    #[test]
    fn test_download_missing_file() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        let mut out = Vec::new();
        let err = store.download_to_stream(&BlobId::generate(), &mut out).unwrap_err();
        assert!(matches!(err, ChunkStoreError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_bucket_name_rejected() {
        assert!(matches!(
            SQLiteChunkStore::open_in_memory("fs; DROP TABLE x"),
            Err(ChunkStoreError::InvalidConfig(_))
        ));
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        assert!(matches!(
            store.create_unique_index("metadata.a'b"),
            Err(ChunkStoreError::UnsupportedField(_))
        ));
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.sqlite3");
        let id = {
            let store = SQLiteChunkStore::open(&path, "snapshots").unwrap();
            store
                .upload_from_stream("kept", &mut Cursor::new(b"persisted".to_vec()), &options("p", 3))
                .unwrap()
        };
        let store = SQLiteChunkStore::open(&path, "snapshots").unwrap();
        let mut out = Vec::new();
        store.download_to_stream(&id, &mut out).unwrap();
        assert_eq!(out, b"persisted");
    }

    #[test]
    fn test_reads_proceed_while_upload_in_flight() {
        let store = Arc::new(SQLiteChunkStore::open_in_memory("fs").unwrap());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let uploader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut reader = GatedReader {
                    data: Cursor::new(b"slowly arriving".to_vec()),
                    step: 4,
                    reads: 0,
                    started: started_tx,
                    release: release_rx,
                };
                store.upload_from_stream("slow.bin", &mut reader, &options("slow", 4))
            })
        };
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let _ = done_tx.send(store.count_documents(&Filter::Empty).map_err(|e| e.to_string()));
            });
        }
        let during = done_rx.recv_timeout(Duration::from_secs(5));
        release_tx.send(()).unwrap();
        let id = uploader.join().unwrap().unwrap();

        // the half-written file is not visible yet
        assert_eq!(during.expect("count waited for the upload to finish").unwrap(), 0);
        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 1);
        let mut out = Vec::new();
        store.download_to_stream(&id, &mut out).unwrap();
        assert_eq!(out, b"slowly arriving");
    }

    #[test]
    fn test_failed_source_discards_staged_chunks() {
        let store = SQLiteChunkStore::open_in_memory("fs").unwrap();
        let err = store
            .upload_from_stream("broken", &mut BreaksAfterFirstChunk { served: false }, &options("b", 4))
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::Io(_)));
        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 0);
        assert_eq!(total_chunk_rows(&store), 0);
    }

    #[test]
    fn test_reopen_removes_orphaned_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.sqlite3");
        {
            let store = SQLiteChunkStore::open(&path, "fs").unwrap();
            store
                .upload_from_stream("kept", &mut Cursor::new(b"kept".to_vec()), &options("k", 2))
                .unwrap();
            let conn = store.conn().unwrap();
            conn.execute(
                &format!("INSERT INTO {} (files_id, n, data) VALUES ('interrupted', 0, x'00')", store.chunks_table),
                [],
            )
            .unwrap();
        }
        let store = SQLiteChunkStore::open(&path, "fs").unwrap();
        assert_eq!(total_chunk_rows(&store), 2);
        assert_eq!(store.count_documents(&Filter::Empty).unwrap(), 1);
    }
}

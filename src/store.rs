use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::parser::IndexLang;

// ---------------------------------------------------------------------------
// Vector store.
//
// Two typed tables per indexed language, `chunks_<lang>` and `refs_<lang>`,
// inside one embedded SQLite database under `.git-ai/lancedb/` (the
// directory name is historical). The store is dumb on purpose: writes are
// additive and deduplication of `content_hash` belongs to the indexer.
// SQLite's `LIKE` is ASCII case-insensitive, which is exactly the ILIKE
// behavior the coarse pre-filter wants; case-sensitive refinement happens
// in memory on the search side.
// ---------------------------------------------------------------------------

pub const STORE_FILE: &str = "index.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} is missing from the vector store; run `index --overwrite` to rebuild")]
    MissingTable(String),
    #[error("vector store directory not found: {0}")]
    MissingStore(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail with `MissingTable` if a requested table does not exist.
    OpenOnly,
    CreateIfMissing,
    /// Drop and recreate the requested tables.
    Overwrite,
}

/// One content-addressed embedding record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub content_hash: String,
    pub text: String,
    pub dim: i32,
    pub scale: f32,
    pub qvec_b64: String,
}

/// One denormalized symbol occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefRow {
    pub ref_id: String,
    pub content_hash: String,
    pub file: String,
    pub symbol: String,
    pub kind: String,
    pub signature: String,
    pub start_line: i32,
    pub end_line: i32,
}

pub struct VectorStore {
    conn: Connection,
    dim: usize,
    languages: Vec<IndexLang>,
}

pub fn chunks_table(lang: IndexLang) -> String {
    format!("chunks_{}", lang.as_str())
}

pub fn refs_table(lang: IndexLang) -> String {
    format!("refs_{}", lang.as_str())
}

impl VectorStore {
    /// Open (or create) the store under `db_dir` for the given languages.
    pub fn open(
        db_dir: &Path,
        dim: usize,
        mode: OpenMode,
        languages: &[IndexLang],
    ) -> Result<Self, StoreError> {
        if mode == OpenMode::OpenOnly && !db_dir.is_dir() {
            return Err(StoreError::MissingStore(db_dir.display().to_string()));
        }
        std::fs::create_dir_all(db_dir)?;
        let conn = Connection::open(db_dir.join(STORE_FILE))?;

        let store = Self {
            conn,
            dim,
            languages: languages.to_vec(),
        };

        for &lang in languages {
            match mode {
                OpenMode::OpenOnly => {
                    for table in [chunks_table(lang), refs_table(lang)] {
                        if !store.table_exists(&table)? {
                            return Err(StoreError::MissingTable(table));
                        }
                    }
                }
                OpenMode::CreateIfMissing => store.create_tables(lang)?,
                OpenMode::Overwrite => {
                    store.drop_tables(lang)?;
                    store.create_tables(lang)?;
                }
            }
        }

        Ok(store)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn languages(&self) -> &[IndexLang] {
        &self.languages
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_tables(&self, lang: IndexLang) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {chunks} (
                content_hash TEXT NOT NULL,
                text         TEXT NOT NULL,
                dim          INTEGER NOT NULL,
                scale        REAL NOT NULL,
                qvec_b64     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {refs} (
                ref_id       TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                file         TEXT NOT NULL,
                symbol       TEXT NOT NULL,
                kind         TEXT NOT NULL,
                signature    TEXT NOT NULL,
                start_line   INTEGER NOT NULL,
                end_line     INTEGER NOT NULL
            );",
            chunks = chunks_table(lang),
            refs = refs_table(lang),
        ))?;
        Ok(())
    }

    fn drop_tables(&self, lang: IndexLang) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
            chunks_table(lang),
            refs_table(lang),
        ))?;
        Ok(())
    }

    /// All `content_hash` values currently in a language's chunk table.
    /// The indexer preloads this on non-overwrite runs to enforce dedup.
    pub fn chunk_hashes(&self, lang: IndexLang) -> Result<HashSet<String>, StoreError> {
        let table = chunks_table(lang);
        if !self.table_exists(&table)? {
            return Ok(HashSet::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT content_hash FROM {table}"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn append_chunks(&mut self, lang: IndexLang, rows: &[ChunkRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = chunks_table(lang);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (content_hash, text, dim, scale, qvec_b64)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.content_hash,
                    row.text,
                    row.dim,
                    row.scale,
                    row.qvec_b64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_refs(&mut self, lang: IndexLang, rows: &[RefRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = refs_table(lang);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (ref_id, content_hash, file, symbol, kind, signature, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.ref_id,
                    row.content_hash,
                    row.file,
                    row.symbol,
                    row.kind,
                    row.signature,
                    row.start_line,
                    row.end_line
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Full scan of a language's chunk table (semantic search is brute-force
    /// by design).
    pub fn scan_chunks(&self, lang: IndexLang) -> Result<Vec<ChunkRow>, StoreError> {
        let table = chunks_table(lang);
        if !self.table_exists(&table)? {
            return Err(StoreError::MissingTable(table));
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT content_hash, text, dim, scale, qvec_b64 FROM {table}"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ChunkRow {
                content_hash: row.get(0)?,
                text: row.get(1)?,
                dim: row.get(2)?,
                scale: row.get(3)?,
                qvec_b64: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Read ref rows with an optional pushed-down predicate (a SQL fragment
    /// produced by the search layer's `build_where`), capped at `limit`.
    pub fn query_refs(
        &self,
        lang: IndexLang,
        where_sql: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RefRow>, StoreError> {
        let table = refs_table(lang);
        if !self.table_exists(&table)? {
            return Err(StoreError::MissingTable(table));
        }
        let clause = where_sql
            .map(|w| format!(" WHERE {w}"))
            .unwrap_or_default();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ref_id, content_hash, file, symbol, kind, signature, start_line, end_line
             FROM {table}{clause} LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([], Self::ref_row_from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Ref rows restricted to a set of content hashes (semantic-hit attach).
    pub fn refs_for_hashes(
        &self,
        lang: IndexLang,
        hashes: &HashSet<String>,
    ) -> Result<Vec<RefRow>, StoreError> {
        if hashes.is_empty() {
            return Ok(vec![]);
        }
        let table = refs_table(lang);
        if !self.table_exists(&table)? {
            return Err(StoreError::MissingTable(table));
        }
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ref_id, content_hash, file, symbol, kind, signature, start_line, end_line
             FROM {table} WHERE content_hash IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(hashes.iter()),
            Self::ref_row_from,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        if !self.table_exists(table)? {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        Ok(self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
    }

    fn ref_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefRow> {
        Ok(RefRow {
            ref_id: row.get(0)?,
            content_hash: row.get(1)?,
            file: row.get(2)?,
            symbol: row.get(3)?,
            kind: row.get(4)?,
            signature: row.get(5)?,
            start_line: row.get(6)?,
            end_line: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(hash: &str) -> ChunkRow {
        ChunkRow {
            content_hash: hash.to_string(),
            text: format!("text for {hash}"),
            dim: 16,
            scale: 0.5,
            qvec_b64: "AAAA".to_string(),
        }
    }

    fn reference(id: &str, hash: &str, symbol: &str) -> RefRow {
        RefRow {
            ref_id: id.to_string(),
            content_hash: hash.to_string(),
            file: "a.ts".to_string(),
            symbol: symbol.to_string(),
            kind: "function".to_string(),
            signature: format!("function {symbol}()"),
            start_line: 1,
            end_line: 3,
        }
    }

    #[test]
    fn create_write_scan_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(
            tmp.path(),
            16,
            OpenMode::CreateIfMissing,
            &[IndexLang::Ts],
        )
        .unwrap();

        store
            .append_chunks(IndexLang::Ts, &[chunk("h1"), chunk("h2")])
            .unwrap();
        store
            .append_refs(IndexLang::Ts, &[reference("r1", "h1", "handleAuth")])
            .unwrap();

        let hashes = store.chunk_hashes(IndexLang::Ts).unwrap();
        assert!(hashes.contains("h1") && hashes.contains("h2"));

        let chunks = store.scan_chunks(IndexLang::Ts).unwrap();
        assert_eq!(chunks.len(), 2);

        let refs = store
            .query_refs(IndexLang::Ts, Some("symbol LIKE '%auth%'"), 100)
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].symbol, "handleAuth");
    }

    #[test]
    fn open_only_reports_missing_tables() {
        let tmp = tempfile::tempdir().unwrap();
        // Seed a store with only the ts tables.
        VectorStore::open(tmp.path(), 16, OpenMode::CreateIfMissing, &[IndexLang::Ts]).unwrap();

        let err = VectorStore::open(tmp.path(), 16, OpenMode::OpenOnly, &[IndexLang::Java])
            .err()
            .unwrap();
        match err {
            StoreError::MissingTable(t) => assert_eq!(t, "chunks_java"),
            other => panic!("expected MissingTable, got {other:?}"),
        }
    }

    #[test]
    fn overwrite_drops_existing_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store =
            VectorStore::open(tmp.path(), 16, OpenMode::CreateIfMissing, &[IndexLang::Ts]).unwrap();
        store.append_chunks(IndexLang::Ts, &[chunk("h1")]).unwrap();
        drop(store);

        let store =
            VectorStore::open(tmp.path(), 16, OpenMode::Overwrite, &[IndexLang::Ts]).unwrap();
        assert!(store.chunk_hashes(IndexLang::Ts).unwrap().is_empty());
    }

    #[test]
    fn store_does_not_dedup_on_its_own() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store =
            VectorStore::open(tmp.path(), 16, OpenMode::CreateIfMissing, &[IndexLang::Ts]).unwrap();
        store
            .append_chunks(IndexLang::Ts, &[chunk("same"), chunk("same")])
            .unwrap();
        assert_eq!(store.count_rows("chunks_ts").unwrap(), 2);
    }

    #[test]
    fn refs_for_hashes_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store =
            VectorStore::open(tmp.path(), 16, OpenMode::CreateIfMissing, &[IndexLang::Ts]).unwrap();
        store
            .append_refs(
                IndexLang::Ts,
                &[reference("r1", "h1", "a"), reference("r2", "h2", "b")],
            )
            .unwrap();
        let mut want = HashSet::new();
        want.insert("h2".to_string());
        let got = store.refs_for_hashes(IndexLang::Ts, &want).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].symbol, "b");
    }
}

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ids::file_id;

// ---------------------------------------------------------------------------
// AST graph store: seven relations, SQLite-backed when available, with an
// in-memory image + JSON export as the fallback durability story.
//
// Relation writes happen in `replace` mode (full rebuild, one transaction)
// or as per-file `remove` + `put` for incremental updates.
// ---------------------------------------------------------------------------

pub const GRAPH_DB_FILE: &str = "ast-graph.sqlite";
pub const GRAPH_EXPORT_FILE: &str = "ast-graph.export.json";
pub const GRAPH_ERROR_FILE: &str = "cozo.error.json";

pub const RELATIONS: [&str; 7] = [
    "ast_file",
    "ast_symbol",
    "ast_contains",
    "ast_extends_name",
    "ast_implements_name",
    "ast_ref_name",
    "ast_call_name",
];

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph not available: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("graph export is not valid JSON: {0}")]
    BadExport(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileTuple {
    pub file_id: String,
    pub file: String,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolTuple {
    pub ref_id: String,
    pub file: String,
    pub lang: String,
    pub name: String,
    pub kind: String,
    pub signature: String,
    pub start_line: i32,
    pub end_line: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainsTuple {
    pub parent_id: String,
    pub child_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtendsTuple {
    pub sub_id: String,
    pub super_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImplementsTuple {
    pub sub_id: String,
    pub iface_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefTuple {
    pub from_id: String,
    pub from_lang: String,
    pub name: String,
    pub ref_kind: String,
    pub file: String,
    pub line: i32,
    pub col: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallTuple {
    pub caller_id: String,
    pub caller_lang: String,
    pub callee_name: String,
    pub file: String,
    pub line: i32,
    pub col: i32,
}

/// A full (or per-file) image of the seven relations. Doubles as the JSON
/// export/import format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphData {
    pub ast_file: Vec<FileTuple>,
    pub ast_symbol: Vec<SymbolTuple>,
    pub ast_contains: Vec<ContainsTuple>,
    pub ast_extends_name: Vec<ExtendsTuple>,
    pub ast_implements_name: Vec<ImplementsTuple>,
    pub ast_ref_name: Vec<RefTuple>,
    pub ast_call_name: Vec<CallTuple>,
}

impl GraphData {
    pub fn merge(&mut self, other: GraphData) {
        self.ast_file.extend(other.ast_file);
        self.ast_symbol.extend(other.ast_symbol);
        self.ast_contains.extend(other.ast_contains);
        self.ast_extends_name.extend(other.ast_extends_name);
        self.ast_implements_name.extend(other.ast_implements_name);
        self.ast_ref_name.extend(other.ast_ref_name);
        self.ast_call_name.extend(other.ast_call_name);
    }

    fn remove_file(&mut self, file: &str) {
        let fid = file_id(file);
        let removed_ids: std::collections::HashSet<String> = self
            .ast_symbol
            .iter()
            .filter(|s| s.file == file)
            .map(|s| s.ref_id.clone())
            .collect();
        self.ast_file.retain(|f| f.file != file);
        self.ast_symbol.retain(|s| s.file != file);
        self.ast_contains.retain(|c| {
            c.parent_id != fid
                && !removed_ids.contains(&c.parent_id)
                && !removed_ids.contains(&c.child_id)
        });
        self.ast_extends_name
            .retain(|e| !removed_ids.contains(&e.sub_id));
        self.ast_implements_name
            .retain(|i| !removed_ids.contains(&i.sub_id));
        self.ast_ref_name.retain(|r| r.file != file);
        self.ast_call_name.retain(|c| c.file != file);
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        out.insert("ast_file".into(), self.ast_file.len());
        out.insert("ast_symbol".into(), self.ast_symbol.len());
        out.insert("ast_contains".into(), self.ast_contains.len());
        out.insert("ast_extends_name".into(), self.ast_extends_name.len());
        out.insert("ast_implements_name".into(), self.ast_implements_name.len());
        out.insert("ast_ref_name".into(), self.ast_ref_name.len());
        out.insert("ast_call_name".into(), self.ast_call_name.len());
        out
    }
}

enum Backend {
    Sqlite(Connection),
    Memory(GraphData),
}

pub struct GraphStore {
    backend: Backend,
    dir: PathBuf,
}

impl GraphStore {
    /// Open the graph store under the `.git-ai` directory, preferring the
    /// SQLite backend and degrading to the in-memory engine (loaded from the
    /// JSON export when present). A SQLite failure leaves a diagnostic at
    /// `cozo.error.json`.
    pub fn open(store_dir: &Path) -> Result<Self, GraphError> {
        std::fs::create_dir_all(store_dir)
            .map_err(|e| GraphError::Unavailable(format!("cannot create store dir: {e}")))?;

        match Self::open_sqlite(store_dir) {
            Ok(conn) => Ok(Self {
                backend: Backend::Sqlite(conn),
                dir: store_dir.to_path_buf(),
            }),
            Err(e) => {
                let _ = std::fs::write(
                    store_dir.join(GRAPH_ERROR_FILE),
                    serde_json::to_vec_pretty(&json!({ "error": e.to_string() }))
                        .unwrap_or_default(),
                );
                crate::debug_log!("[codescope] sqlite graph backend failed: {e}; using memory");
                let data = Self::load_export(store_dir).unwrap_or_default();
                Ok(Self {
                    backend: Backend::Memory(data),
                    dir: store_dir.to_path_buf(),
                })
            }
        }
    }

    /// Open for queries only; fails cleanly when no graph was ever built.
    pub fn open_existing(store_dir: &Path) -> Result<Self, GraphError> {
        if store_dir.join(GRAPH_DB_FILE).exists() {
            let conn = Self::open_sqlite(store_dir)
                .map_err(|e| GraphError::Unavailable(e.to_string()))?;
            return Ok(Self {
                backend: Backend::Sqlite(conn),
                dir: store_dir.to_path_buf(),
            });
        }
        if store_dir.join(GRAPH_EXPORT_FILE).exists() {
            let data = Self::load_export(store_dir)?;
            return Ok(Self {
                backend: Backend::Memory(data),
                dir: store_dir.to_path_buf(),
            });
        }
        Err(GraphError::Unavailable(
            "no AST graph on disk; run `index` first".to_string(),
        ))
    }

    fn open_sqlite(store_dir: &Path) -> Result<Connection, GraphError> {
        let conn = Connection::open(store_dir.join(GRAPH_DB_FILE))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ast_file (
                file_id TEXT NOT NULL, file TEXT NOT NULL, lang TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_symbol (
                ref_id TEXT NOT NULL, file TEXT NOT NULL, lang TEXT NOT NULL,
                name TEXT NOT NULL, kind TEXT NOT NULL, signature TEXT NOT NULL,
                start_line INTEGER NOT NULL, end_line INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_contains (
                parent_id TEXT NOT NULL, child_id TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_extends_name (
                sub_id TEXT NOT NULL, super_name TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_implements_name (
                sub_id TEXT NOT NULL, iface_name TEXT NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_ref_name (
                from_id TEXT NOT NULL, from_lang TEXT NOT NULL, name TEXT NOT NULL,
                ref_kind TEXT NOT NULL, file TEXT NOT NULL,
                line INTEGER NOT NULL, col INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS ast_call_name (
                caller_id TEXT NOT NULL, caller_lang TEXT NOT NULL, callee_name TEXT NOT NULL,
                file TEXT NOT NULL, line INTEGER NOT NULL, col INTEGER NOT NULL);",
        )?;
        Ok(conn)
    }

    fn load_export(store_dir: &Path) -> Result<GraphData, GraphError> {
        let path = store_dir.join(GRAPH_EXPORT_FILE);
        if !path.exists() {
            return Ok(GraphData::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save_export(&self, data: &GraphData) -> Result<(), GraphError> {
        std::fs::write(
            self.dir.join(GRAPH_EXPORT_FILE),
            serde_json::to_vec(data)?,
        )?;
        Ok(())
    }

    pub fn engine(&self) -> &'static str {
        match self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Memory(_) => "mem",
        }
    }

    pub fn db_path(&self) -> PathBuf {
        match self.backend {
            Backend::Sqlite(_) => self.dir.join(GRAPH_DB_FILE),
            Backend::Memory(_) => self.dir.join(GRAPH_EXPORT_FILE),
        }
    }

    /// Wipe every relation, then insert the full image. One transaction on
    /// the SQLite side, so readers never observe a half-built graph.
    pub fn replace(&mut self, data: &GraphData) -> Result<(), GraphError> {
        match &mut self.backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for rel in RELATIONS {
                    tx.execute(&format!("DELETE FROM {rel}"), [])?;
                }
                Self::insert_all(&tx, data)?;
                tx.commit()?;
            }
            Backend::Memory(mem) => {
                *mem = data.clone();
                let snapshot = mem.clone();
                self.save_export(&snapshot)?;
            }
        }
        // Keep the export file as a recovery dump for the sqlite backend too.
        if matches!(self.backend, Backend::Sqlite(_)) {
            let _ = self.save_export(data);
        }
        Ok(())
    }

    /// Incremental path: drop everything the file contributed, then insert
    /// the file's fresh tuples.
    pub fn put_file(&mut self, file: &str, data: &GraphData) -> Result<(), GraphError> {
        self.remove_file(file)?;
        match &mut self.backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                Self::insert_all(&tx, data)?;
                tx.commit()?;
            }
            Backend::Memory(mem) => {
                mem.merge(data.clone());
                let snapshot = mem.clone();
                self.save_export(&snapshot)?;
            }
        }
        Ok(())
    }

    /// Delete every tuple referencing `file`: its file node, its symbols,
    /// containment touching those symbols, heritage rows, and all refs/calls
    /// recorded in the file.
    pub fn remove_file(&mut self, file: &str) -> Result<(), GraphError> {
        match &mut self.backend {
            Backend::Sqlite(conn) => {
                let fid = file_id(file);
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM ast_file WHERE file = ?1", params![file])?;
                tx.execute(
                    "DELETE FROM ast_contains WHERE parent_id = ?1
                     OR parent_id IN (SELECT ref_id FROM ast_symbol WHERE file = ?2)
                     OR child_id IN (SELECT ref_id FROM ast_symbol WHERE file = ?2)",
                    params![fid, file],
                )?;
                tx.execute(
                    "DELETE FROM ast_extends_name
                     WHERE sub_id IN (SELECT ref_id FROM ast_symbol WHERE file = ?1)",
                    params![file],
                )?;
                tx.execute(
                    "DELETE FROM ast_implements_name
                     WHERE sub_id IN (SELECT ref_id FROM ast_symbol WHERE file = ?1)",
                    params![file],
                )?;
                tx.execute("DELETE FROM ast_symbol WHERE file = ?1", params![file])?;
                tx.execute("DELETE FROM ast_ref_name WHERE file = ?1", params![file])?;
                tx.execute("DELETE FROM ast_call_name WHERE file = ?1", params![file])?;
                tx.commit()?;
            }
            Backend::Memory(mem) => {
                mem.remove_file(file);
                let snapshot = mem.clone();
                self.save_export(&snapshot)?;
            }
        }
        Ok(())
    }

    fn insert_all(tx: &rusqlite::Transaction<'_>, data: &GraphData) -> Result<(), GraphError> {
        {
            let mut stmt =
                tx.prepare("INSERT INTO ast_file (file_id, file, lang) VALUES (?1, ?2, ?3)")?;
            for t in &data.ast_file {
                stmt.execute(params![t.file_id, t.file, t.lang])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ast_symbol (ref_id, file, lang, name, kind, signature, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for t in &data.ast_symbol {
                stmt.execute(params![
                    t.ref_id,
                    t.file,
                    t.lang,
                    t.name,
                    t.kind,
                    t.signature,
                    t.start_line,
                    t.end_line
                ])?;
            }
        }
        {
            let mut stmt =
                tx.prepare("INSERT INTO ast_contains (parent_id, child_id) VALUES (?1, ?2)")?;
            for t in &data.ast_contains {
                stmt.execute(params![t.parent_id, t.child_id])?;
            }
        }
        {
            let mut stmt =
                tx.prepare("INSERT INTO ast_extends_name (sub_id, super_name) VALUES (?1, ?2)")?;
            for t in &data.ast_extends_name {
                stmt.execute(params![t.sub_id, t.super_name])?;
            }
        }
        {
            let mut stmt = tx
                .prepare("INSERT INTO ast_implements_name (sub_id, iface_name) VALUES (?1, ?2)")?;
            for t in &data.ast_implements_name {
                stmt.execute(params![t.sub_id, t.iface_name])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ast_ref_name (from_id, from_lang, name, ref_kind, file, line, col)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for t in &data.ast_ref_name {
                stmt.execute(params![
                    t.from_id, t.from_lang, t.name, t.ref_kind, t.file, t.line, t.col
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ast_call_name (caller_id, caller_lang, callee_name, file, line, col)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for t in &data.ast_call_name {
                stmt.execute(params![
                    t.caller_id,
                    t.caller_lang,
                    t.callee_name,
                    t.file,
                    t.line,
                    t.col
                ])?;
            }
        }
        Ok(())
    }

    /// Full image of the seven relations (also the export format).
    pub fn export(&self) -> Result<GraphData, GraphError> {
        match &self.backend {
            Backend::Memory(mem) => Ok(mem.clone()),
            Backend::Sqlite(conn) => {
                let mut data = GraphData::default();
                let mut stmt = conn.prepare("SELECT file_id, file, lang FROM ast_file")?;
                let rows = stmt.query_map([], |r| {
                    Ok(FileTuple {
                        file_id: r.get(0)?,
                        file: r.get(1)?,
                        lang: r.get(2)?,
                    })
                })?;
                for row in rows {
                    data.ast_file.push(row?);
                }

                let mut stmt = conn.prepare(
                    "SELECT ref_id, file, lang, name, kind, signature, start_line, end_line
                     FROM ast_symbol",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok(SymbolTuple {
                        ref_id: r.get(0)?,
                        file: r.get(1)?,
                        lang: r.get(2)?,
                        name: r.get(3)?,
                        kind: r.get(4)?,
                        signature: r.get(5)?,
                        start_line: r.get(6)?,
                        end_line: r.get(7)?,
                    })
                })?;
                for row in rows {
                    data.ast_symbol.push(row?);
                }

                let mut stmt = conn.prepare("SELECT parent_id, child_id FROM ast_contains")?;
                let rows = stmt.query_map([], |r| {
                    Ok(ContainsTuple {
                        parent_id: r.get(0)?,
                        child_id: r.get(1)?,
                    })
                })?;
                for row in rows {
                    data.ast_contains.push(row?);
                }

                let mut stmt = conn.prepare("SELECT sub_id, super_name FROM ast_extends_name")?;
                let rows = stmt.query_map([], |r| {
                    Ok(ExtendsTuple {
                        sub_id: r.get(0)?,
                        super_name: r.get(1)?,
                    })
                })?;
                for row in rows {
                    data.ast_extends_name.push(row?);
                }

                let mut stmt =
                    conn.prepare("SELECT sub_id, iface_name FROM ast_implements_name")?;
                let rows = stmt.query_map([], |r| {
                    Ok(ImplementsTuple {
                        sub_id: r.get(0)?,
                        iface_name: r.get(1)?,
                    })
                })?;
                for row in rows {
                    data.ast_implements_name.push(row?);
                }

                let mut stmt = conn.prepare(
                    "SELECT from_id, from_lang, name, ref_kind, file, line, col FROM ast_ref_name",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok(RefTuple {
                        from_id: r.get(0)?,
                        from_lang: r.get(1)?,
                        name: r.get(2)?,
                        ref_kind: r.get(3)?,
                        file: r.get(4)?,
                        line: r.get(5)?,
                        col: r.get(6)?,
                    })
                })?;
                for row in rows {
                    data.ast_ref_name.push(row?);
                }

                let mut stmt = conn.prepare(
                    "SELECT caller_id, caller_lang, callee_name, file, line, col FROM ast_call_name",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok(CallTuple {
                        caller_id: r.get(0)?,
                        caller_lang: r.get(1)?,
                        callee_name: r.get(2)?,
                        file: r.get(3)?,
                        line: r.get(4)?,
                        col: r.get(5)?,
                    })
                })?;
                for row in rows {
                    data.ast_call_name.push(row?);
                }

                Ok(data)
            }
        }
    }

    /// Replace the store contents with an imported image.
    pub fn import(&mut self, data: &GraphData) -> Result<(), GraphError> {
        self.replace(data)
    }

    pub fn counts(&self) -> Result<BTreeMap<String, usize>, GraphError> {
        match &self.backend {
            Backend::Memory(mem) => Ok(mem.counts()),
            Backend::Sqlite(conn) => {
                let mut out = BTreeMap::new();
                for rel in RELATIONS {
                    let n: i64 =
                        conn.query_row(&format!("SELECT COUNT(*) FROM {rel}"), [], |r| r.get(0))?;
                    out.insert(rel.to_string(), n as usize);
                }
                Ok(out)
            }
        }
    }

    /// Flush the in-memory image to its JSON export. No-op for SQLite.
    pub fn close(&mut self) -> Result<(), GraphError> {
        if let Backend::Memory(mem) = &self.backend {
            let snapshot = mem.clone();
            self.save_export(&snapshot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::file_id;

    fn sample(file: &str) -> GraphData {
        let fid = file_id(file);
        GraphData {
            ast_file: vec![FileTuple {
                file_id: fid.clone(),
                file: file.to_string(),
                lang: "ts".to_string(),
            }],
            ast_symbol: vec![SymbolTuple {
                ref_id: format!("sym-{file}"),
                file: file.to_string(),
                lang: "ts".to_string(),
                name: "a".to_string(),
                kind: "function".to_string(),
                signature: "function a()".to_string(),
                start_line: 1,
                end_line: 2,
            }],
            ast_contains: vec![ContainsTuple {
                parent_id: fid,
                child_id: format!("sym-{file}"),
            }],
            ast_extends_name: vec![],
            ast_implements_name: vec![],
            ast_ref_name: vec![RefTuple {
                from_id: format!("sym-{file}"),
                from_lang: "ts".to_string(),
                name: "b".to_string(),
                ref_kind: "call".to_string(),
                file: file.to_string(),
                line: 1,
                col: 4,
            }],
            ast_call_name: vec![CallTuple {
                caller_id: format!("sym-{file}"),
                caller_lang: "ts".to_string(),
                callee_name: "b".to_string(),
                file: file.to_string(),
                line: 1,
                col: 4,
            }],
        }
    }

    #[test]
    fn replace_and_export_round_trip_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = GraphStore::open(tmp.path()).unwrap();
        assert_eq!(store.engine(), "sqlite");

        let mut data = sample("a.ts");
        data.merge(sample("b.ts"));
        store.replace(&data).unwrap();

        let exported = store.export().unwrap();
        assert_eq!(exported.ast_file.len(), 2);
        assert_eq!(exported.ast_symbol.len(), 2);
        assert_eq!(store.counts().unwrap()["ast_call_name"], 2);

        // Replace wipes before inserting.
        store.replace(&sample("c.ts")).unwrap();
        assert_eq!(store.export().unwrap().ast_file.len(), 1);
    }

    #[test]
    fn remove_file_drops_every_tuple_for_that_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = GraphStore::open(tmp.path()).unwrap();
        let mut data = sample("a.ts");
        data.merge(sample("b.ts"));
        store.replace(&data).unwrap();

        store.remove_file("a.ts").unwrap();
        let left = store.export().unwrap();
        assert_eq!(left.ast_file.len(), 1);
        assert_eq!(left.ast_file[0].file, "b.ts");
        assert!(left.ast_symbol.iter().all(|s| s.file == "b.ts"));
        assert!(left.ast_ref_name.iter().all(|r| r.file == "b.ts"));
        assert!(left.ast_contains.iter().all(|c| c.child_id == "sym-b.ts"));
    }

    #[test]
    fn put_file_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = GraphStore::open(tmp.path()).unwrap();
        store.put_file("a.ts", &sample("a.ts")).unwrap();
        store.put_file("a.ts", &sample("a.ts")).unwrap();
        let data = store.export().unwrap();
        assert_eq!(data.ast_file.len(), 1);
        assert_eq!(data.ast_symbol.len(), 1);
    }

    #[test]
    fn memory_image_remove_file() {
        let mut data = sample("a.ts");
        data.merge(sample("b.ts"));
        data.remove_file("b.ts");
        assert_eq!(data.ast_file.len(), 1);
        assert!(data.ast_call_name.iter().all(|c| c.file == "a.ts"));
    }

    #[test]
    fn open_existing_fails_cleanly_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let err = GraphStore::open_existing(tmp.path()).err().unwrap();
        assert!(matches!(err, GraphError::Unavailable(_)));
    }

    #[test]
    fn export_json_round_trips_for_memory_backend() {
        let tmp = tempfile::tempdir().unwrap();
        // Force a memory image by writing an export and opening it.
        let data = sample("a.ts");
        std::fs::write(
            tmp.path().join(GRAPH_EXPORT_FILE),
            serde_json::to_vec(&data).unwrap(),
        )
        .unwrap();
        let store = GraphStore::open_existing(tmp.path()).unwrap();
        // sqlite file does not exist, so this must be the memory engine.
        assert_eq!(store.engine(), "mem");
        assert_eq!(store.export().unwrap().ast_symbol, data.ast_symbol);
    }
}

//! Filename to content key index using SQLite

use orca_core::ContentKey;
use rusqlite::{params, Connection, OptionalExtension, Result};

/// One named file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub content_key: ContentKey,
    pub size: u64,
    pub updated_at: u64,
}

/// Maps human file names to the content keys they were stored under
pub struct NameIndex {
    conn: Connection,
}

impl NameIndex {
    /// Open or create the name index database
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// An index that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS names (
                filename TEXT PRIMARY KEY,
                content_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS names_by_key ON names(content_key);
            "#,
        )?;

        Ok(Self { conn })
    }

    /// Record (or replace) the key a filename points to
    pub fn put(&self, filename: &str, content_key: &ContentKey, size: u64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO names (filename, content_key, size, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                filename,
                content_key.to_hex(),
                size as i64,
                orca_core::unix_now() as i64,
            ],
        )?;
        Ok(())
    }

    /// Look up a filename
    pub fn get(&self, filename: &str) -> Result<Option<NameEntry>> {
        self.conn
            .query_row(
                "SELECT filename, content_key, size, updated_at FROM names WHERE filename = ?",
                params![filename],
                row_to_entry,
            )
            .optional()
    }

    /// First filename recorded for a key, if any
    pub fn name_for(&self, content_key: &ContentKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT filename FROM names WHERE content_key = ? ORDER BY updated_at LIMIT 1",
                params![content_key.to_hex()],
                |row| row.get(0),
            )
            .optional()
    }

    /// Remove a filename
    pub fn remove(&self, filename: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM names WHERE filename = ?", params![filename])?;
        Ok(rows > 0)
    }

    /// List all entries, by filename
    pub fn list(&self) -> Result<Vec<NameEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename, content_key, size, updated_at FROM names ORDER BY filename")?;

        let results = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;

        Ok(results)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<NameEntry> {
    let key_hex: String = row.get(1)?;
    let content_key = key_hex.parse::<ContentKey>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(NameEntry {
        filename: row.get(0)?,
        content_key,
        size: row.get::<_, i64>(2)? as u64,
        updated_at: row.get::<_, i64>(3)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_put_and_get() {
        let temp = NamedTempFile::new().unwrap();
        let index = NameIndex::open(temp.path()).unwrap();

        let key = ContentKey::of(b"report contents");
        index.put("report.txt", &key, 15).unwrap();

        let entry = index.get("report.txt").unwrap().unwrap();
        assert_eq!(entry.content_key, key);
        assert_eq!(entry.size, 15);
        assert!(index.get("missing.txt").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_existing_name() {
        let index = NameIndex::in_memory().unwrap();
        let old = ContentKey::of(b"v1");
        let new = ContentKey::of(b"v2");

        index.put("notes.txt", &old, 2).unwrap();
        index.put("notes.txt", &new, 2).unwrap();

        assert_eq!(index.get("notes.txt").unwrap().unwrap().content_key, new);
        assert_eq!(index.list().unwrap().len(), 1);
        assert_eq!(index.name_for(&new).unwrap().as_deref(), Some("notes.txt"));
        assert!(index.name_for(&old).unwrap().is_none());
    }

    #[test]
    fn test_remove_and_list() {
        let index = NameIndex::in_memory().unwrap();
        index.put("b.json", &ContentKey::of(b"b"), 1).unwrap();
        index.put("a.txt", &ContentKey::of(b"a"), 1).unwrap();

        let names: Vec<_> = index.list().unwrap().into_iter().map(|e| e.filename).collect();
        assert_eq!(names, vec!["a.txt", "b.json"]);

        assert!(index.remove("a.txt").unwrap());
        assert!(!index.remove("a.txt").unwrap());
        assert_eq!(index.list().unwrap().len(), 1);
    }
}

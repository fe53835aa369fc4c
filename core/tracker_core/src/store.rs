use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::{collections::HashMap, path::Path, sync::Arc};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

/// The two storage areas: a small one for settings and a larger one for
/// per-day data and history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Sync,
    Local,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Sync => "sync",
            Scope::Local => "local",
        }
    }
}

/// Key-value store with last-write-wins semantics and no schema.
///
/// Every call locks the connection and is a suspension point for the caller;
/// anything read before an `await` on the store may be stale afterwards.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Returns the decoded values for the keys that exist. Rows holding
    /// undecodable JSON are skipped as if absent.
    pub async fn get(&self, scope: Scope, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT value_json FROM kv WHERE scope = ?1 AND key = ?2")?;
        let mut out = HashMap::new();
        for key in keys {
            let raw: Option<String> = stmt
                .query_row((scope.as_str(), *key), |row| row.get(0))
                .optional()?;
            if let Some(raw) = raw {
                match serde_json::from_str::<Value>(&raw) {
                    Ok(v) => {
                        out.insert((*key).to_string(), v);
                    }
                    Err(err) => warn!("skipping undecodable {}:{key}: {err}", scope.as_str()),
                }
            }
        }
        Ok(out)
    }

    pub async fn get_one(&self, scope: Scope, key: &str) -> Result<Option<Value>> {
        Ok(self.get(scope, &[key]).await?.remove(key))
    }

    /// Writes all entries in one transaction.
    pub async fn set(&self, scope: Scope, entries: Vec<(String, Value)>) -> Result<()> {
        let updated_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
INSERT INTO kv (scope, key, value_json, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(scope, key) DO UPDATE SET
  value_json=excluded.value_json,
  updated_at=excluded.updated_at
                "#,
            )?;
            for (key, value) in &entries {
                let json = serde_json::to_string(value)?;
                stmt.execute((scope.as_str(), key, json, &updated_at))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn clear(&self, scope: Scope) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM kv WHERE scope = ?1", [scope.as_str()])?;
        Ok(n)
    }

    pub async fn is_empty(&self, scope: Scope) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE scope = ?1",
            [scope.as_str()],
            |row| row.get(0),
        )?;
        Ok(n == 0)
    }

    pub async fn keys_with_prefix(&self, scope: Scope, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE scope = ?1 AND substr(key, 1, ?2) = ?3 ORDER BY key")?;
        let rows = stmt.query_map(
            (scope.as_str(), prefix.chars().count() as i64, prefix),
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Drops the backing table so tests can exercise the failure paths.
    #[cfg(test)]
    pub async fn break_for_test(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE kv;").unwrap();
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv (
  scope TEXT NOT NULL,
  key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (scope, key)
);
"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn open_creates_missing_parent_dirs() {
        let root = std::env::temp_dir().join(format!("tracker-store-{}", std::process::id()));
        let path = root.join("nested").join("tracker.db");
        let _ = std::fs::remove_dir_all(&root);

        let store = Store::open(&path).unwrap();
        store
            .set(Scope::Sync, vec![("k".into(), json!(true))])
            .await
            .unwrap();
        assert!(path.exists());
        drop(store);

        // Reopening an existing file keeps its rows.
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_one(Scope::Sync, "k").await.unwrap(), Some(json!(true)));
        drop(store);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn set_then_get_is_last_write_wins() {
        let store = Store::open_in_memory().unwrap();
        store
            .set(Scope::Local, vec![("a".into(), json!(1)), ("b".into(), json!({"x": 2}))])
            .await
            .unwrap();
        store
            .set(Scope::Local, vec![("a".into(), json!(3))])
            .await
            .unwrap();

        let got = store.get(Scope::Local, &["a", "b", "missing"]).await.unwrap();
        assert_eq!(got.get("a"), Some(&json!(3)));
        assert_eq!(got.get("b"), Some(&json!({"x": 2})));
        assert!(!got.contains_key("missing"));
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        store
            .set(Scope::Sync, vec![("k".into(), json!("sync"))])
            .await
            .unwrap();
        store
            .set(Scope::Local, vec![("k".into(), json!("local"))])
            .await
            .unwrap();

        assert_eq!(store.clear(Scope::Sync).await.unwrap(), 1);
        assert!(store.is_empty(Scope::Sync).await.unwrap());
        assert_eq!(
            store.get_one(Scope::Local, "k").await.unwrap(),
            Some(json!("local"))
        );
    }

    #[tokio::test]
    async fn keys_with_prefix_lists_matching_keys_sorted() {
        let store = Store::open_in_memory().unwrap();
        store
            .set(
                Scope::Local,
                vec![
                    ("history_2026-10-18".into(), json!({})),
                    ("2026-10-18".into(), json!({})),
                    ("history_2026-10-17".into(), json!({})),
                ],
            )
            .await
            .unwrap();
        let keys = store.keys_with_prefix(Scope::Local, "history_").await.unwrap();
        assert_eq!(keys, vec!["history_2026-10-17", "history_2026-10-18"]);
    }

    #[tokio::test]
    async fn broken_store_reports_errors() {
        let store = Store::open_in_memory().unwrap();
        store.break_for_test().await;
        assert!(store.get(Scope::Local, &["a"]).await.is_err());
        assert!(store
            .set(Scope::Local, vec![("a".into(), json!(1))])
            .await
            .is_err());
    }
}

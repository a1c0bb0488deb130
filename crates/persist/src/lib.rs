//! Keel persistence: SQLite revision backend for running without a cluster.
//! One file, synchronous statements behind a mutex; store latency is not on the push path.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use keel_core::{ProxyState, ResourceBundle, RevisionPatch, RevisionRecord, SerializationFormat};
use keel_revision::RevisionBackend;
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

const REVISION_COLUMNS: &str =
    "name, node_id, version, format, bundle, tainted, published, created_at, last_published_at";

pub struct SqliteBackend {
    db: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open the database named by `KEEL_DB_PATH`, or `~/.keel/keel.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS revisions (
                name              TEXT PRIMARY KEY,
                node_id           TEXT NOT NULL,
                version           TEXT NOT NULL,
                format            TEXT NOT NULL,
                bundle            TEXT NOT NULL,
                tainted           INTEGER NOT NULL DEFAULT 0,
                published         INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL,
                last_published_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_revisions_node ON revisions(node_id, version);
            CREATE TABLE IF NOT EXISTS proxy_states (
                node_id TEXT PRIMARY KEY,
                state   TEXT NOT NULL
            );",
        )
        .context("creating keel tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "persist: opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_revisions(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RevisionRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let mut stmt = db.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s).with_context(|| format!("bad timestamp {}", s))?.with_timezone(&Utc))
}

fn encode_bundle(format: SerializationFormat, bundle: &ResourceBundle) -> Result<String> {
    Ok(match format {
        SerializationFormat::Json => serde_json::to_string(bundle)?,
        SerializationFormat::Yaml => serde_yaml::to_string(bundle)?,
    })
}

fn decode_bundle(format: SerializationFormat, raw: &str) -> Result<ResourceBundle> {
    Ok(match format {
        SerializationFormat::Json => serde_json::from_str(raw)?,
        SerializationFormat::Yaml => serde_yaml::from_str(raw)?,
    })
}

fn format_name(format: SerializationFormat) -> &'static str {
    match format {
        SerializationFormat::Json => "json",
        SerializationFormat::Yaml => "yaml",
    }
}

fn record_from_row(row: &Row<'_>) -> Result<RevisionRecord> {
    let format = match row.get::<_, String>(3)?.as_str() {
        "yaml" => SerializationFormat::Yaml,
        "json" => SerializationFormat::Json,
        other => return Err(anyhow!("unknown serialization format {}", other)),
    };
    let bundle: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let last_published_at: Option<String> = row.get(8)?;
    Ok(RevisionRecord {
        name: row.get(0)?,
        node_id: row.get(1)?,
        version: row.get(2)?,
        serialization_format: format,
        bundle: decode_bundle(format, &bundle)?,
        tainted: row.get(5)?,
        published: row.get(6)?,
        created_at: parse_ts(&created_at)?,
        last_published_at: last_published_at.as_deref().map(parse_ts).transpose()?,
    })
}

#[async_trait::async_trait]
impl RevisionBackend for SqliteBackend {
    async fn list_revisions(&self, node_id: &str) -> Result<Vec<RevisionRecord>> {
        let sql = format!("SELECT {} FROM revisions WHERE node_id = ?1 ORDER BY created_at, name", REVISION_COLUMNS);
        self.query_revisions(&sql, &[&node_id])
    }

    async fn find_revisions(&self, node_id: &str, version: &str) -> Result<Vec<RevisionRecord>> {
        let sql = format!(
            "SELECT {} FROM revisions WHERE node_id = ?1 AND version = ?2 ORDER BY created_at, name",
            REVISION_COLUMNS
        );
        self.query_revisions(&sql, &[&node_id, &version])
    }

    async fn create_revision(&self, rec: &RevisionRecord) -> Result<()> {
        let bundle = encode_bundle(rec.serialization_format, &rec.bundle)?;
        let db = self.conn();
        db.execute(
            "INSERT INTO revisions(name, node_id, version, format, bundle, tainted, published, created_at, last_published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.name,
                rec.node_id,
                rec.version,
                format_name(rec.serialization_format),
                bundle,
                rec.tainted,
                rec.published,
                ts(&rec.created_at),
                rec.last_published_at.as_ref().map(ts),
            ],
        )
        .with_context(|| format!("inserting revision {}", rec.name))?;
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    async fn patch_revision(&self, name: &str, patch: &RevisionPatch) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let sql = format!("SELECT {} FROM revisions WHERE name = ?1", REVISION_COLUMNS);
        let current = {
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query([name])?;
            match rows.next()? {
                Some(row) => record_from_row(row)?,
                None => return Err(anyhow!("revision {} not found", name)),
            }
        };
        let mut next = current;
        patch.apply(&mut next);
        tx.execute(
            "UPDATE revisions SET tainted = ?2, published = ?3, last_published_at = ?4 WHERE name = ?1",
            params![name, next.tainted, next.published, next.last_published_at.as_ref().map(ts)],
        )?;
        tx.commit()?;
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    async fn delete_revision(&self, name: &str) -> Result<()> {
        self.conn().execute("DELETE FROM revisions WHERE name = ?1", [name])?;
        Ok(())
    }

    async fn get_state(&self, node_id: &str) -> Result<Option<ProxyState>> {
        let raw: Option<String> = self
            .conn()
            .query_row("SELECT state FROM proxy_states WHERE node_id = ?1", [node_id], |r| r.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("decoding proxy state")).transpose()
    }

    async fn put_state(&self, state: &ProxyState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT INTO proxy_states(node_id, state) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET state = excluded.state",
            params![state.node_id, raw],
        )?;
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    async fn delete_state(&self, node_id: &str) -> Result<()> {
        self.conn().execute("DELETE FROM proxy_states WHERE node_id = ?1", [node_id])?;
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<ProxyState>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT state FROM proxy_states ORDER BY node_id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(serde_json::from_str(&raw).context("decoding proxy state")?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{hash_bundle, ResourceType};
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn record(node: &str, eps: &[&str], format: SerializationFormat) -> RevisionRecord {
        let mut bundle = ResourceBundle::new();
        for e in eps {
            bundle.insert(ResourceType::Endpoint, *e, json!({ "cluster_name": e }));
        }
        let mut rec = RevisionRecord::new(node, &hash_bundle(&bundle), bundle);
        rec.serialization_format = format;
        rec
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revisions_round_trip_and_patch() {
        let b = SqliteBackend::open(&temp_db()).unwrap();
        let r1 = record("n1", &["e1"], SerializationFormat::Json);
        let mut r2 = record("n1", &["e1", "e2"], SerializationFormat::Yaml);
        r2.created_at = r1.created_at + chrono::Duration::milliseconds(1);
        b.create_revision(&r1).await.unwrap();
        b.create_revision(&r2).await.unwrap();
        b.create_revision(&record("n2", &["e9"], SerializationFormat::Json)).await.unwrap();
        assert!(b.create_revision(&r1).await.is_err(), "names are unique");

        let listed = b.list_revisions("n1").await.unwrap();
        assert_eq!(listed, vec![r1.clone(), r2.clone()]);
        assert_eq!(b.find_revisions("n1", &r2.version).await.unwrap(), vec![r2.clone()]);

        let now = Utc::now();
        let patch = RevisionPatch { published: Some(true), last_published_at: Some(now), ..Default::default() };
        b.patch_revision(&r2.name, &patch).await.unwrap();
        let got = b.find_revisions("n1", &r2.version).await.unwrap().remove(0);
        assert!(got.published && !got.tainted);
        assert_eq!(got.last_published_at, Some(now));
        assert!(b.patch_revision("missing", &patch).await.is_err());

        b.delete_revision(&r1.name).await.unwrap();
        assert_eq!(b.list_revisions("n1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn states_upsert_and_delete() {
        let b = SqliteBackend::open(&temp_db()).unwrap();
        let mut st = ProxyState::new("n1", record("n1", &["e1"], SerializationFormat::Json).bundle);
        b.put_state(&st).await.unwrap();
        st.desired_version = Some("abc".into());
        b.put_state(&st).await.unwrap();
        b.put_state(&ProxyState::new("n0", ResourceBundle::new())).await.unwrap();

        assert_eq!(b.get_state("n1").await.unwrap(), Some(st));
        let ids: Vec<String> = b.list_states().await.unwrap().into_iter().map(|s| s.node_id).collect();
        assert_eq!(ids, vec!["n0", "n1"]);

        b.delete_state("n1").await.unwrap();
        assert_eq!(b.get_state("n1").await.unwrap(), None);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use tokio::task;

use crate::config::SUPPORTED_ENGINE;
use crate::model::{CardRecord, DbSafetyReport, DuplicateUid, ScanEventRecord};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub const RECENT_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub card_id: i64,
    pub event_id: i64,
}

// Cheap to clone. Every call opens its own connection inside spawn_blocking,
// so concurrent requests never share connection state.
#[derive(Clone)]
pub struct SqliteRepo {
    db_path: Arc<PathBuf>,
}

impl SqliteRepo {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
        }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
            Ok(())
        })
        .await
        .context("join ensure_schema task")?
    }

    pub async fn record_scan(
        &self,
        uid: String,
        scanned_at: String,
        source: String,
        target_field: Option<String>,
    ) -> Result<ScanOutcome> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            record_scan_blocking(&db_path, &uid, &scanned_at, &source, target_field.as_deref())
        })
        .await
        .context("join record_scan task")?
    }

    pub async fn recent_scans(&self) -> Result<Vec<ScanEventRecord>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || recent_scans_blocking(&db_path))
            .await
            .context("join recent_scans task")?
    }

    pub async fn recent_cards(&self) -> Result<Vec<CardRecord>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || recent_cards_blocking(&db_path))
            .await
            .context("join recent_cards task")?
    }

    pub async fn integrity_report(&self) -> Result<DbSafetyReport> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || integrity_report_blocking(&db_path))
            .await
            .context("join integrity_report task")?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite database at {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set foreign_keys=ON")?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("set busy_timeout")?;
    Ok(conn)
}

fn record_scan_blocking(
    path: &Path,
    uid: &str,
    scanned_at: &str,
    source: &str,
    target_field: Option<&str>,
) -> Result<ScanOutcome> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin scan transaction")?;

    // Simultaneous first scans of one uid serialize on the conflict clause
    // instead of racing a lookup-then-insert.
    tx.execute(
        "INSERT INTO rfid_cards (uid, first_seen_at, last_seen_at, total_scans)
         VALUES (?1, ?2, ?2, 1)
         ON CONFLICT(uid) DO UPDATE SET
             last_seen_at = excluded.last_seen_at,
             total_scans = total_scans + 1",
        params![uid, scanned_at],
    )
    .context("upsert card")?;

    let card_id: i64 = tx
        .query_row(
            "SELECT id FROM rfid_cards WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )
        .context("look up card id")?;

    tx.execute(
        "INSERT INTO scan_events (card_id, scanned_at, source, target_field)
         VALUES (?1, ?2, ?3, ?4)",
        params![card_id, scanned_at, source, target_field],
    )
    .context("insert scan event")?;
    let event_id = tx.last_insert_rowid();

    tx.commit().context("commit scan transaction")?;
    Ok(ScanOutcome { card_id, event_id })
}

fn recent_scans_blocking(path: &Path) -> Result<Vec<ScanEventRecord>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            "SELECT se.id, c.uid, se.scanned_at, se.source, se.target_field
             FROM scan_events se
             JOIN rfid_cards c ON c.id = se.card_id
             ORDER BY se.id DESC
             LIMIT ?1",
        )
        .context("prepare recent scans query")?;
    let rows = stmt
        .query_map(params![RECENT_LIMIT], |row| {
            Ok(ScanEventRecord {
                id: row.get(0)?,
                uid: row.get(1)?,
                scanned_at: row.get(2)?,
                source: row.get(3)?,
                target_field: row.get(4)?,
            })
        })
        .context("query recent scans")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read scan rows")
}

fn recent_cards_blocking(path: &Path) -> Result<Vec<CardRecord>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            "SELECT uid, first_seen_at, last_seen_at, total_scans
             FROM rfid_cards
             ORDER BY last_seen_at DESC
             LIMIT ?1",
        )
        .context("prepare recent cards query")?;
    let rows = stmt
        .query_map(params![RECENT_LIMIT], |row| {
            Ok(CardRecord {
                uid: row.get(0)?,
                first_seen_at: row.get(1)?,
                last_seen_at: row.get(2)?,
                total_scans: row.get(3)?,
            })
        })
        .context("query recent cards")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read card rows")
}

fn integrity_report_blocking(path: &Path) -> Result<DbSafetyReport> {
    let conn = open_connection(path)?;

    let fk_enabled: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .context("read foreign_keys pragma")?;

    let orphan_events: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM scan_events se
             LEFT JOIN rfid_cards c ON c.id = se.card_id
             WHERE c.id IS NULL",
            [],
            |row| row.get(0),
        )
        .context("count orphan events")?;

    let mut stmt = conn
        .prepare(
            "SELECT uid, COUNT(*) AS dup_count
             FROM rfid_cards
             GROUP BY uid
             HAVING COUNT(*) > 1",
        )
        .context("prepare duplicate uid query")?;
    let duplicate_uids = stmt
        .query_map([], |row| {
            Ok(DuplicateUid {
                uid: row.get(0)?,
                dup_count: row.get(1)?,
            })
        })
        .context("query duplicate uids")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read duplicate uid rows")?;

    let foreign_keys_enabled = fk_enabled == 1;
    let is_safe = foreign_keys_enabled && orphan_events == 0 && duplicate_uids.is_empty();
    Ok(DbSafetyReport {
        engine: SUPPORTED_ENGINE.to_string(),
        foreign_keys_enabled,
        orphan_events,
        duplicate_uids,
        is_safe,
    })
}

//! Embedded SQLite implementation of the watch, rule and callback stores.
//!
//! Every call opens its own connection on the blocking pool and runs as one
//! transaction. Status transitions and history appends use `BEGIN IMMEDIATE`,
//! which takes the database write lock before reading, so two writers racing
//! on the same row are serialized and the loser observes the winner's commit.
use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::task;
use url::Url;
use uuid::Uuid;

use crate::{
    callback::{Callback, CallbackHistory, CallbackResult},
    confirmation::ConfirmationWatch,
    error::{Error, Result},
    rule::{NewRule, Rule, RuleStatus},
    store::{CallbackStore, RuleStore, WatchStorage},
    watch::{RemoveReason, Watch, WatchStatus, WatchToRemove},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables:
///   rules(id, transaction_id, confirmations, waiting_ms, success_result,
///         timeout_result, callback_id, registered_time, status)
///   callbacks(id, registered_ip, url, registered_time, completed)
///   callback_history(callback_id, seq, status, invoked_time, data)
///   watches(id, rule_id, start_block, start_height, start_time,
///           transaction_id, status, removed_reason)
///
/// Watches are never deleted; retiring one records `removed_reason`.
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS rules (
        id              TEXT PRIMARY KEY,
        transaction_id  TEXT NOT NULL,
        confirmations   INTEGER NOT NULL,
        waiting_ms      INTEGER NOT NULL,
        success_result  TEXT NOT NULL,
        timeout_result  TEXT NOT NULL,
        callback_id     TEXT NOT NULL,
        registered_time TEXT NOT NULL,
        status          TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS callbacks (
        id              TEXT PRIMARY KEY,
        registered_ip   TEXT NOT NULL,
        url             TEXT NOT NULL,
        registered_time TEXT NOT NULL,
        completed       INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS callback_history (
        callback_id  TEXT NOT NULL REFERENCES callbacks(id),
        seq          INTEGER NOT NULL,
        status       TEXT NOT NULL,
        invoked_time TEXT NOT NULL,
        data         TEXT NOT NULL,
        PRIMARY KEY (callback_id, seq)
    );

    CREATE TABLE IF NOT EXISTS watches (
        id             TEXT PRIMARY KEY,
        rule_id        TEXT NOT NULL REFERENCES rules(id),
        start_block    TEXT NOT NULL,
        start_height   INTEGER NOT NULL,
        start_time     TEXT NOT NULL,
        transaction_id TEXT NOT NULL,
        status         TEXT NOT NULL,
        removed_reason TEXT
    );

    CREATE INDEX IF NOT EXISTS watches_status ON watches(status);
    CREATE INDEX IF NOT EXISTS rules_status ON rules(status);
"#;

const RULE_COLUMNS: &str = "r.id, r.transaction_id, r.confirmations, r.waiting_ms, \
     r.success_result, r.timeout_result, r.callback_id, r.registered_time, r.status";

/// Durable store for watches, rules and callbacks in one SQLite file.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Self { path })
    }

    fn open(path: &PathBuf) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

/// Current time at the precision the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp {s}"))?
        .with_timezone(&Utc))
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("parse uuid {s}"))
}

/// Reads the nine rule columns starting at `at`.
fn rule_from_row(row: &Row<'_>, at: usize) -> Result<Rule> {
    let id: String = row.get(at)?;
    let txid: String = row.get(at + 1)?;
    let waiting_ms: i64 = row.get(at + 3)?;
    let success: String = row.get(at + 4)?;
    let timeout: String = row.get(at + 5)?;
    let callback: String = row.get(at + 6)?;
    let registered: String = row.get(at + 7)?;
    let status: String = row.get(at + 8)?;

    Ok(Rule {
        id: parse_uuid(&id)?,
        transaction_id: Txid::from_str(&txid).context("parse rule transaction_id")?,
        confirmations: row.get(at + 2)?,
        waiting_time: Duration::from_millis(
            u64::try_from(waiting_ms)
                .with_context(|| format!("parse waiting_ms {waiting_ms}"))?,
        ),
        success_result: serde_json::from_str(&success).context("parse success_result")?,
        timeout_result: serde_json::from_str(&timeout).context("parse timeout_result")?,
        callback: parse_uuid(&callback)?,
        registered_time: parse_ts(&registered)?,
        status: status.parse()?,
    })
}

fn watch_from_row(row: &Row<'_>) -> Result<ConfirmationWatch> {
    let id = parse_uuid(&row.get::<_, String>(0)?)?;
    let start_block: String = row.get(1)?;
    let start_time: String = row.get(3)?;
    let txid: String = row.get(4)?;
    let status: String = row.get(5)?;

    // LEFT JOIN: a dangling rule_id shows up as NULL rule columns.
    if row.get::<_, Option<String>>(6)?.is_none() {
        return Err(Error::ContextMissing(id));
    }

    Ok(Watch {
        id,
        context: rule_from_row(row, 6)?,
        start_block: BlockHash::from_str(&start_block).context("parse start_block")?,
        start_height: row.get(2)?,
        start_time: parse_ts(&start_time)?,
        transaction_id: Txid::from_str(&txid).context("parse watch transaction_id")?,
        status: status.parse()?,
    })
}

fn callback_from_row(row: &Row<'_>) -> Result<Callback> {
    let id: String = row.get(0)?;
    let ip: String = row.get(1)?;
    let url: String = row.get(2)?;
    let registered: String = row.get(3)?;
    Ok(Callback {
        id: parse_uuid(&id)?,
        registered_ip: ip.parse::<IpAddr>().with_context(|| format!("parse ip {ip}"))?,
        url: Url::parse(&url).with_context(|| format!("parse url {url}"))?,
        registered_time: parse_ts(&registered)?,
        completed: row.get(4)?,
    })
}

fn history_from_row(row: &Row<'_>) -> Result<CallbackHistory> {
    let callback: String = row.get(0)?;
    let seq: i64 = row.get(1)?;
    let invoked: String = row.get(3)?;
    Ok(CallbackHistory {
        callback_id: parse_uuid(&callback)?,
        sequence: u64::try_from(seq).context("negative history sequence")?,
        status: row.get(2)?,
        invoked_time: parse_ts(&invoked)?,
        data: row.get(4)?,
    })
}

fn exists(conn: &Connection, table: &str, id: Uuid) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.to_string()], |_| Ok(()))
        .optional()?
        .is_some())
}

#[async_trait]
impl WatchStorage<ConfirmationWatch> for SqliteStore {
    async fn start(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn add(&self, watches: &[ConfirmationWatch]) -> Result<()> {
        let rows: Vec<_> = watches
            .iter()
            .map(|w| {
                (
                    w.id,
                    w.context.id,
                    w.start_block.to_string(),
                    w.start_height,
                    ts(&w.start_time),
                    w.transaction_id.to_string(),
                )
            })
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for (id, rule_id, block, height, start, txid) in &rows {
                if exists(&tx, "watches", *id)? {
                    return Err(Error::DuplicateId(*id));
                }
                if !exists(&tx, "rules", *rule_id)? {
                    return Err(Error::ContextMissing(*id));
                }
                tx.execute(
                    "INSERT INTO watches
                       (id, rule_id, start_block, start_height, start_time, transaction_id, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id.to_string(),
                        rule_id.to_string(),
                        block,
                        height,
                        start,
                        txid,
                        WatchStatus::Pending.as_str()
                    ],
                )?;
            }
            // Dropping `tx` on the error paths above rolls the batch back.
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list(&self, status: WatchStatus) -> Result<Vec<ConfirmationWatch>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT w.id, w.start_block, w.start_height, w.start_time, w.transaction_id,
                        w.status, {RULE_COLUMNS}
                 FROM watches w LEFT JOIN rules r ON r.id = w.rule_id
                 WHERE w.status = ?1
                   AND (w.removed_reason IS NULL
                        OR (w.removed_reason = ?2 AND w.status <> ?3))
                 ORDER BY w.start_height, w.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![
                status.as_str(),
                RemoveReason::Completed.as_str(),
                WatchStatus::Pending.as_str()
            ])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(watch_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn remove(&self, watches: &[WatchToRemove<ConfirmationWatch>]) -> Result<()> {
        let rows: Vec<_> = watches
            .iter()
            .map(|r| (r.watch.id, r.reason.as_str()))
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for (id, reason) in &rows {
                let changed = tx.execute(
                    "UPDATE watches SET removed_reason = ?2
                     WHERE id = ?1 AND removed_reason IS NULL",
                    params![id.to_string(), reason],
                )?;
                if changed == 0 && !exists(&tx, "watches", *id)? {
                    return Err(Error::not_found("watch", *id));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_status(&self, id: Uuid, status: WatchStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT status, removed_reason FROM watches WHERE id = ?1",
                    params![id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let (current, removed) = current.ok_or_else(|| Error::not_found("watch", id))?;
            let current: WatchStatus = current.parse()?;
            // Retired watches keep whatever status they were retired with.
            if current != WatchStatus::Pending || removed.is_some() {
                return Err(Error::invalid_transition("watch", id));
            }
            if !status.is_terminal() {
                return Err(Error::InvalidTarget(status.to_string()));
            }

            tx.execute(
                "UPDATE watches SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn add_rule(&self, rule: NewRule) -> Result<Rule> {
        rule.validate()?;
        let rule = rule.into_rule(now());
        let success = serde_json::to_string(&rule.success_result).context("encode success_result")?;
        let timeout = serde_json::to_string(&rule.timeout_result).context("encode timeout_result")?;
        let waiting_ms = i64::try_from(rule.waiting_time.as_millis())
            .map_err(|_| Error::invalid_argument("waiting_time", "too large"))?;

        let stored = rule.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rules
                   (id, transaction_id, confirmations, waiting_ms, success_result,
                    timeout_result, callback_id, registered_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stored.id.to_string(),
                    stored.transaction_id.to_string(),
                    stored.confirmations,
                    waiting_ms,
                    success,
                    timeout,
                    stored.callback.to_string(),
                    ts(&stored.registered_time),
                    stored.status.as_str()
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(rule)
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {RULE_COLUMNS} FROM rules r WHERE r.id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![id.to_string()])?;
            if let Some(row) = rows.next()? {
                return Ok(Some(rule_from_row(row, 0)?));
            }
            Ok(None)
        })
        .await
    }

    async fn list_rules(&self, status: RuleStatus) -> Result<Vec<Rule>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {RULE_COLUMNS} FROM rules r WHERE r.status = ?1
                 ORDER BY r.registered_time, r.rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![status.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(rule_from_row(row, 0)?);
            }
            Ok(out)
        })
        .await
    }

    async fn update_rule_status(&self, id: Uuid, status: RuleStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM rules WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;

            let current: RuleStatus = current
                .ok_or_else(|| Error::not_found("rule", id))?
                .parse()?;
            if current != RuleStatus::Pending {
                return Err(Error::invalid_transition("rule", id));
            }
            if !status.is_terminal() {
                return Err(Error::InvalidTarget(status.to_string()));
            }

            tx.execute(
                "UPDATE rules SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CallbackStore for SqliteStore {
    async fn add_callback(&self, registered_ip: IpAddr, url: Url) -> Result<Callback> {
        let callback = Callback {
            id: Uuid::new_v4(),
            registered_ip,
            url,
            registered_time: now(),
            completed: false,
        };
        let stored = callback.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO callbacks (id, registered_ip, url, registered_time, completed)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    stored.id.to_string(),
                    stored.registered_ip.to_string(),
                    stored.url.as_str(),
                    ts(&stored.registered_time)
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(callback)
    }

    async fn get_callback(&self, id: Uuid) -> Result<Option<Callback>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, registered_ip, url, registered_time, completed
                 FROM callbacks WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id.to_string()])?;
            if let Some(row) = rows.next()? {
                return Ok(Some(callback_from_row(row)?));
            }
            Ok(None)
        })
        .await
    }

    async fn add_history(
        &self,
        id: Uuid,
        result: Option<&CallbackResult>,
    ) -> Result<CallbackHistory> {
        let result = result.ok_or_else(|| Error::invalid_argument("result", "is missing"))?;
        let status = result.status.clone();
        let data = serde_json::to_string(&result.data).context("encode callback data")?;
        let invoked_time = now();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !exists(&tx, "callbacks", id)? {
                return Err(Error::not_found("callback", id));
            }
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM callback_history WHERE callback_id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO callback_history (callback_id, seq, status, invoked_time, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), seq, status, ts(&invoked_time), data],
            )?;
            tx.commit()?;

            Ok(CallbackHistory {
                callback_id: id,
                sequence: u64::try_from(seq).context("negative history sequence")?,
                status,
                invoked_time,
                data,
            })
        })
        .await
    }

    async fn set_completed(&self, id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE callbacks SET completed = 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            if changed == 0 {
                return Err(Error::not_found("callback", id));
            }
            Ok(())
        })
        .await
    }

    async fn history(&self, id: Uuid) -> Result<Vec<CallbackHistory>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT callback_id, seq, status, invoked_time, data
                 FROM callback_history WHERE callback_id = ?1 ORDER BY seq",
            )?;
            let mut rows = stmt.query(params![id.to_string()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(history_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }
}

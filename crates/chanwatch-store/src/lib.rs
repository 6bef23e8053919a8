//! SQLite implementation of the chanwatch store port.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use chanwatch_core::{
    domain::{ChannelId, MessageId, UserId},
    errors::Error,
    filter::{FilterRule, ValidRule},
    store::{ChannelMetadataRecord, MessageRecord, MonitoredUser, StatusUpdate, Store},
    Result,
};

fn db_err(e: sqlx::Error) -> Error {
    Error::Persistence(e.to_string())
}

fn to_time(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Persistence(format!("timestamp out of range: {secs}")))
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    channel_id: i64,
    message_id: i64,
    title: String,
    username: Option<String>,
    timestamp: i64,
    body: String,
    url: String,
    verdict: String,
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = Error;

    fn try_from(r: MessageRow) -> Result<Self> {
        Ok(Self {
            channel_id: ChannelId(r.channel_id),
            message_id: MessageId(
                i32::try_from(r.message_id)
                    .map_err(|_| Error::Persistence(format!("message id {}", r.message_id)))?,
            ),
            title: r.title,
            username: r.username,
            timestamp: to_time(r.timestamp)?,
            body: r.body,
            url: r.url,
            verdict: r.verdict.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FilterRow {
    id: i64,
    name: String,
    pattern: String,
    kind: String,
    action: String,
    priority: i64,
    enabled: bool,
}

impl TryFrom<FilterRow> for FilterRule {
    type Error = Error;

    fn try_from(r: FilterRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            name: r.name,
            kind: r.kind.parse()?,
            pattern: r.pattern,
            action: r.action.parse()?,
            priority: i32::try_from(r.priority)
                .map_err(|_| Error::Persistence(format!("priority {}", r.priority)))?,
            enabled: r.enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChannelMetadataRow {
    channel_id: i64,
    title: String,
    username: Option<String>,
    member_count: i64,
    is_public: bool,
}

impl From<ChannelMetadataRow> for ChannelMetadataRecord {
    fn from(r: ChannelMetadataRow) -> Self {
        Self {
            channel_id: ChannelId(r.channel_id),
            title: r.title,
            username: r.username,
            member_count: u32::try_from(r.member_count).unwrap_or(0),
            is_public: r.is_public,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MonitoredUserRow {
    user_id: i64,
    handle: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

impl From<MonitoredUserRow> for MonitoredUser {
    fn from(r: MonitoredUserRow) -> Self {
        Self {
            user_id: UserId(r.user_id),
            handle: r.handle,
            first_name: r.first_name,
            last_name: r.last_name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    user_id: i64,
    status: String,
    status_time: i64,
}

impl TryFrom<StatusRow> for StatusUpdate {
    type Error = Error;

    fn try_from(r: StatusRow) -> Result<Self> {
        Ok(Self {
            user_id: UserId(r.user_id),
            status: r.status,
            at: to_time(r.status_time)?,
        })
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS messages (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id INTEGER NOT NULL,
        message_id INTEGER NOT NULL,
        title      TEXT    NOT NULL DEFAULT '',
        username   TEXT,
        timestamp  INTEGER NOT NULL,
        body       TEXT    NOT NULL DEFAULT '',
        url        TEXT    NOT NULL DEFAULT '',
        verdict    TEXT    NOT NULL DEFAULT 'forward',
        UNIQUE(channel_id, message_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS filters (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        name     TEXT    NOT NULL,
        pattern  TEXT    NOT NULL,
        kind     TEXT    NOT NULL,
        action   TEXT    NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        enabled  BOOLEAN NOT NULL DEFAULT 1
    )"#,
    r#"CREATE TABLE IF NOT EXISTS monitored_users (
        user_id    INTEGER PRIMARY KEY,
        handle     TEXT,
        first_name TEXT,
        last_name  TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_metadata (
        channel_id   INTEGER PRIMARY KEY,
        title        TEXT    NOT NULL DEFAULT '',
        username     TEXT,
        member_count INTEGER NOT NULL DEFAULT 0,
        is_public    BOOLEAN NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_status_updates (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     INTEGER NOT NULL,
        status      TEXT    NOT NULL,
        status_time INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_status_user_time ON user_status_updates(user_id, status_time)",
];

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        tracing::info!(path = %path.display(), "opening sqlite store");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database. One connection, so every query sees the
    /// same data.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_message(&self, record: &MessageRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"INSERT OR IGNORE INTO messages
                 (channel_id, message_id, title, username, timestamp, body, url, verdict)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.channel_id.0)
        .bind(record.message_id.0)
        .bind(&record.title)
        .bind(&record.username)
        .bind(record.timestamp.timestamp())
        .bind(&record.body)
        .bind(&record.url)
        .bind(record.verdict.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"SELECT channel_id, message_id, title, username, timestamp, body, url, verdict
               FROM messages WHERE channel_id = ? AND message_id = ?"#,
        )
        .bind(channel.0)
        .bind(message.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn count_messages(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn save_channel_metadata(&self, record: &ChannelMetadataRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO channel_metadata (channel_id, title, username, member_count, is_public)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(channel_id) DO UPDATE SET
                 title = excluded.title,
                 username = excluded.username,
                 member_count = excluded.member_count,
                 is_public = excluded.is_public"#,
        )
        .bind(record.channel_id.0)
        .bind(&record.title)
        .bind(&record.username)
        .bind(i64::from(record.member_count))
        .bind(record.is_public)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_channel_metadata(
        &self,
        channel: ChannelId,
    ) -> Result<Option<ChannelMetadataRecord>> {
        let row = sqlx::query_as::<_, ChannelMetadataRow>(
            r#"SELECT channel_id, title, username, member_count, is_public
               FROM channel_metadata WHERE channel_id = ?"#,
        )
        .bind(channel.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn add_filter(&self, rule: &ValidRule) -> Result<FilterRule> {
        let res = sqlx::query(
            r#"INSERT INTO filters (name, pattern, kind, action, priority, enabled)
               VALUES (?, ?, ?, ?, ?, 1)"#,
        )
        .bind(rule.name())
        .bind(rule.pattern())
        .bind(rule.kind().as_str())
        .bind(rule.action().as_str())
        .bind(rule.priority())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rule.clone().into_rule(res.last_insert_rowid()))
    }

    async fn list_filters(&self) -> Result<Vec<FilterRule>> {
        let rows = sqlx::query_as::<_, FilterRow>(
            r#"SELECT id, name, pattern, kind, action, priority, enabled
               FROM filters ORDER BY priority DESC, id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn active_filters(&self) -> Result<Vec<FilterRule>> {
        let rows = sqlx::query_as::<_, FilterRow>(
            r#"SELECT id, name, pattern, kind, action, priority, enabled
               FROM filters WHERE enabled = 1 ORDER BY priority DESC, id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        // A row that no longer parses is skipped, not fatal to the run.
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match FilterRule::try_from(row) {
                Ok(rule) => out.push(rule),
                Err(e) => tracing::warn!(filter_id = id, error = %e, "skipping unreadable filter"),
            }
        }
        Ok(out)
    }

    async fn set_filter_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let res = sqlx::query("UPDATE filters SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("filter {id}")));
        }
        Ok(())
    }

    async fn add_monitored_user(&self, user: &MonitoredUser) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO monitored_users (user_id, handle, first_name, last_name)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 handle = COALESCE(excluded.handle, monitored_users.handle),
                 first_name = COALESCE(excluded.first_name, monitored_users.first_name),
                 last_name = COALESCE(excluded.last_name, monitored_users.last_name)"#,
        )
        .bind(user.user_id.0)
        .bind(&user.handle)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_monitored_user(&self, user: UserId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM monitored_users WHERE user_id = ?")
            .bind(user.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn monitored_users(&self) -> Result<Vec<MonitoredUser>> {
        let rows = sqlx::query_as::<_, MonitoredUserRow>(
            "SELECT user_id, handle, first_name, last_name FROM monitored_users ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn append_status(&self, update: &StatusUpdate) -> Result<()> {
        sqlx::query("INSERT INTO user_status_updates (user_id, status, status_time) VALUES (?, ?, ?)")
            .bind(update.user_id.0)
            .bind(&update.status)
            .bind(update.at.timestamp())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn status_history(&self, user: UserId, limit: usize) -> Result<Vec<StatusUpdate>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"SELECT user_id, status, status_time FROM user_status_updates
               WHERE user_id = ? ORDER BY status_time DESC, id DESC LIMIT ?"#,
        )
        .bind(user.0)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use chanwatch_core::filter::{RuleDraft, RuleKind, Verdict};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn record(channel: i64, message: i32, body: &str) -> MessageRecord {
        MessageRecord {
            channel_id: ChannelId(channel),
            message_id: MessageId(message),
            title: "Source".to_string(),
            username: Some("source".to_string()),
            timestamp: at(1_700_000_000),
            body: body.to_string(),
            url: format!("https://t.me/source/{message}"),
            verdict: Verdict::Forward,
        }
    }

    fn draft(kind: &str, pattern: &str, action: &str, priority: i32) -> RuleDraft {
        RuleDraft {
            name: format!("{kind} {pattern}"),
            kind: kind.to_string(),
            pattern: pattern.to_string(),
            action: action.to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn duplicate_message_is_stored_once() {
        let store = SqliteStore::in_memory().await.unwrap();

        assert!(store.save_message(&record(100, 42, "first")).await.unwrap());
        assert!(!store.save_message(&record(100, 42, "second")).await.unwrap());
        assert!(store.save_message(&record(101, 42, "other")).await.unwrap());

        assert_eq!(store.count_messages().await.unwrap(), 2);
        let got = store
            .get_message(ChannelId(100), MessageId(42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, "first");
        assert_eq!(got.timestamp, at(1_700_000_000));
    }

    #[tokio::test]
    async fn verdict_round_trips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut r = record(1, 1, "x");
        r.verdict = Verdict::Ignored;
        store.save_message(&r).await.unwrap();

        let got = store
            .get_message(ChannelId(1), MessageId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.verdict, Verdict::Ignored);
    }

    #[tokio::test]
    async fn filters_crud() {
        let store = SqliteStore::in_memory().await.unwrap();

        let low = store
            .add_filter(&draft("keyword", "spam", "ignore", 1).validate().unwrap())
            .await
            .unwrap();
        let high = store
            .add_filter(&draft("userID", "7,8", "highlight", 9).validate().unwrap())
            .await
            .unwrap();
        assert!(high.id > low.id);

        let all = store.list_filters().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, high.id);
        assert_eq!(all[0].kind, RuleKind::UserId);

        store.set_filter_enabled(high.id, false).await.unwrap();
        let active = store.active_filters().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, low.id);

        let err = store.set_filter_enabled(999, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stored_kind_uses_canonical_name() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .add_filter(&draft("minLength", "10", "forward", 0).validate().unwrap())
            .await
            .unwrap();

        let (kind,): (String,) = sqlx::query_as("SELECT kind FROM filters")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(kind, "length");
    }

    #[tokio::test]
    async fn channel_metadata_upserts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut meta = ChannelMetadataRecord {
            channel_id: ChannelId(100),
            title: "Old".to_string(),
            username: None,
            member_count: 5,
            is_public: false,
        };
        store.save_channel_metadata(&meta).await.unwrap();
        meta.title = "New".to_string();
        meta.member_count = 6;
        store.save_channel_metadata(&meta).await.unwrap();

        let got = store
            .get_channel_metadata(ChannelId(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, meta);
        assert!(store
            .get_channel_metadata(ChannelId(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn monitored_users_keep_known_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .add_monitored_user(&MonitoredUser {
                user_id: UserId(7),
                handle: Some("alice".to_string()),
                first_name: Some("Alice".to_string()),
                last_name: None,
            })
            .await
            .unwrap();
        store
            .add_monitored_user(&MonitoredUser {
                user_id: UserId(7),
                handle: None,
                first_name: None,
                last_name: Some("Smith".to_string()),
            })
            .await
            .unwrap();

        let users = store.monitored_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].handle.as_deref(), Some("alice"));
        assert_eq!(users[0].last_name.as_deref(), Some("Smith"));

        assert!(store.remove_monitored_user(UserId(7)).await.unwrap());
        assert!(!store.remove_monitored_user(UserId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn status_history_is_newest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (secs, status) in [(10, "online"), (30, "offline"), (20, "recently")] {
            store
                .append_status(&StatusUpdate {
                    user_id: UserId(7),
                    status: status.to_string(),
                    at: at(secs),
                })
                .await
                .unwrap();
        }
        store
            .append_status(&StatusUpdate {
                user_id: UserId(8),
                status: "online".to_string(),
                at: at(40),
            })
            .await
            .unwrap();

        let history = store.status_history(UserId(7), 2).await.unwrap();
        let statuses: Vec<&str> = history.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(statuses, vec!["offline", "recently"]);
    }

    #[tokio::test]
    async fn file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chanwatch.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.save_message(&record(1, 1, "kept")).await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.count_messages().await.unwrap(), 1);
    }
}

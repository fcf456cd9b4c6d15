use std::borrow::Cow;

use crate::storage::ChangeNotification;

/// Postgres channel used for cross-process change notifications.
pub const NOTIFY_CHANNEL: &str = "broker_change";

/// SQL flavour spoken by a connection model.
///
/// Queries are written once with `?` placeholders; the dialect rewrites them
/// and supplies the few statements whose syntax differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Postgres => "postgres",
        }
    }

    /// Rewrite `?` placeholders into the dialect's form (`$1`, `$2`, ... for Postgres).
    /// Question marks inside single-quoted literals are left alone.
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self {
            SqlDialect::Sqlite => Cow::Borrowed(query),
            SqlDialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 16);
                let mut index = 0;
                let mut in_literal = false;
                for c in query.chars() {
                    match c {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(c);
                        }
                        '?' if !in_literal => {
                            index += 1;
                            out.push('$');
                            out.push_str(&index.to_string());
                        }
                        _ => out.push(c),
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Suffix that locks selected rows for the rest of the transaction.
    pub fn row_lock(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "",
            SqlDialect::Postgres => " FOR UPDATE SKIP LOCKED",
        }
    }

    /// Statement announcing a change to other processes, sent inside the
    /// transaction so it is only delivered on commit.
    pub fn notify_statement(&self, notification: &ChangeNotification) -> Option<String> {
        match self {
            SqlDialect::Sqlite => None,
            SqlDialect::Postgres => {
                let payload = format!("{}|{}", notification.kind.as_str(), notification.queue_name)
                    .replace('\'', "''");
                Some(format!("NOTIFY {NOTIFY_CHANNEL}, '{payload}'"))
            }
        }
    }

    pub fn schema(&self) -> &'static [&'static str] {
        match self {
            SqlDialect::Sqlite => SQLITE_SCHEMA,
            SqlDialect::Postgres => POSTGRES_SCHEMA,
        }
    }
}

/// Parse a payload produced by [`SqlDialect::notify_statement`].
pub fn parse_notify_payload(payload: &str) -> Option<ChangeNotification> {
    let (kind, queue_name) = payload.split_once('|')?;
    Some(ChangeNotification {
        queue_name: queue_name.to_string(),
        kind: crate::storage::ChangeKind::parse(kind)?,
    })
}

pub const SCHEMA_VERSION: i64 = 1;

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS broker_migration (
        version BIGINT PRIMARY KEY,
        applied_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS broker_topic (
        name TEXT PRIMARY KEY,
        tags TEXT NOT NULL DEFAULT '{}',
        created_at BIGINT NOT NULL,
        last_modified_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS broker_queue (
        name TEXT PRIMARY KEY,
        created_at BIGINT NOT NULL,
        last_modified_at BIGINT NOT NULL,
        expires_at BIGINT,
        paused BIGINT NOT NULL DEFAULT 0,
        delay_ms BIGINT,
        visibility_timeout_ms BIGINT,
        max_message_size BIGINT,
        message_retention_period_ms BIGINT,
        receive_message_wait_time_ms BIGINT,
        max_receive_count BIGINT,
        dead_letter_queue_name TEXT REFERENCES broker_queue (name),
        dead_letter_topic_name TEXT REFERENCES broker_topic (name),
        expires_ms BIGINT,
        nak_expire_behavior TEXT NOT NULL DEFAULT '\"retry\"',
        tags TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS broker_subscription (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        topic_name TEXT NOT NULL REFERENCES broker_topic (name) ON DELETE CASCADE,
        protocol TEXT NOT NULL,
        queue_name TEXT NOT NULL REFERENCES broker_queue (name) ON DELETE CASCADE,
        UNIQUE (topic_name, queue_name)
    )",
    "CREATE TABLE IF NOT EXISTS broker_message (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        queue_name TEXT NOT NULL REFERENCES broker_queue (name) ON DELETE CASCADE,
        body BLOB NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}',
        priority BIGINT NOT NULL DEFAULT 0,
        sent_at BIGINT NOT NULL,
        order_by BIGINT NOT NULL,
        delay_until BIGINT,
        expires_at BIGINT,
        not_visible_until BIGINT,
        receipt_handle TEXT,
        receive_count BIGINT NOT NULL DEFAULT 0,
        first_received_at BIGINT,
        last_nak_reason TEXT,
        deduplication_id TEXT,
        UNIQUE (queue_name, id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS broker_message_dedup
        ON broker_message (queue_name, deduplication_id)",
    "CREATE INDEX IF NOT EXISTS broker_message_order
        ON broker_message (queue_name, priority DESC, order_by, seq)",
    "CREATE INDEX IF NOT EXISTS broker_message_receipt
        ON broker_message (queue_name, receipt_handle)",
    "CREATE TABLE IF NOT EXISTS broker_user (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT,
        access_key_id TEXT UNIQUE,
        secret_access_key TEXT
    )",
];

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS broker_migration (
        version BIGINT PRIMARY KEY,
        applied_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS broker_topic (
        name TEXT PRIMARY KEY,
        tags TEXT NOT NULL DEFAULT '{}',
        created_at BIGINT NOT NULL,
        last_modified_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS broker_queue (
        name TEXT PRIMARY KEY,
        created_at BIGINT NOT NULL,
        last_modified_at BIGINT NOT NULL,
        expires_at BIGINT,
        paused BIGINT NOT NULL DEFAULT 0,
        delay_ms BIGINT,
        visibility_timeout_ms BIGINT,
        max_message_size BIGINT,
        message_retention_period_ms BIGINT,
        receive_message_wait_time_ms BIGINT,
        max_receive_count BIGINT,
        dead_letter_queue_name TEXT REFERENCES broker_queue (name),
        dead_letter_topic_name TEXT REFERENCES broker_topic (name),
        expires_ms BIGINT,
        nak_expire_behavior TEXT NOT NULL DEFAULT '\"retry\"',
        tags TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS broker_subscription (
        seq BIGSERIAL PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        topic_name TEXT NOT NULL REFERENCES broker_topic (name) ON DELETE CASCADE,
        protocol TEXT NOT NULL,
        queue_name TEXT NOT NULL REFERENCES broker_queue (name) ON DELETE CASCADE,
        UNIQUE (topic_name, queue_name)
    )",
    "CREATE TABLE IF NOT EXISTS broker_message (
        seq BIGSERIAL PRIMARY KEY,
        id TEXT NOT NULL,
        queue_name TEXT NOT NULL REFERENCES broker_queue (name) ON DELETE CASCADE,
        body BYTEA NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}',
        priority BIGINT NOT NULL DEFAULT 0,
        sent_at BIGINT NOT NULL,
        order_by BIGINT NOT NULL,
        delay_until BIGINT,
        expires_at BIGINT,
        not_visible_until BIGINT,
        receipt_handle TEXT,
        receive_count BIGINT NOT NULL DEFAULT 0,
        first_received_at BIGINT,
        last_nak_reason TEXT,
        deduplication_id TEXT,
        UNIQUE (queue_name, id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS broker_message_dedup
        ON broker_message (queue_name, deduplication_id)",
    "CREATE INDEX IF NOT EXISTS broker_message_order
        ON broker_message (queue_name, priority DESC, order_by, seq)",
    "CREATE INDEX IF NOT EXISTS broker_message_receipt
        ON broker_message (queue_name, receipt_handle)",
    "CREATE TABLE IF NOT EXISTS broker_user (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT,
        access_key_id TEXT UNIQUE,
        secret_access_key TEXT
    )",
];

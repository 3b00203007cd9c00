use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::debug;

use shared::{
    conversation::ConversationKey,
    domain::{MessageId, MessageKind, User, UserId},
    protocol::SortOrder,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub participants: ConversationKey,
    pub content: String,
    pub kind: MessageKind,
    pub sender_name: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub read_by: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub sender_name: Option<String>,
    pub sent_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, participant_low, participant_high, content, kind, sender_name, sent_at_ms";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own empty database, so
        // in-memory pools are pinned to a single connection that never expires.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, photo, primary_category, is_online)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                photo=excluded.photo,
                primary_category=excluded.primary_category,
                is_online=excluded.is_online,
                updated_at=CURRENT_TIMESTAMP",
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .bind(user.photo.as_deref())
        .bind(user.primary_category.as_deref())
        .bind(user.is_online)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user {}", user.id))?;
        Ok(())
    }

    pub async fn load_user(&self, user_id: &UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, name, photo, primary_category, is_online FROM users WHERE id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, name, photo, primary_category, is_online
             FROM users
             ORDER BY lower(name) ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    /// Inserts a message together with the sender's own read receipt.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        let participants = ConversationKey::new(&message.sender_id, &message.receiver_id)
            .map_err(|err| anyhow!("invalid message participants: {err}"))?;

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, participant_low, participant_high, content, kind, sender_name, sent_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.sender_id.as_str())
        .bind(message.receiver_id.as_str())
        .bind(participants.low().as_str())
        .bind(participants.high().as_str())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.sender_name.as_deref())
        .bind(message.sent_at.timestamp_millis())
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(message.sender_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to record sender read receipt")?;
        tx.commit().await?;

        debug!(message_id = message_id.0, %participants, "stored message");
        Ok(message_id)
    }

    /// Adds `user_id` to the message's read set. Returns `false` when the
    /// receipt already existed; repeating the call never duplicates it.
    pub async fn mark_message_read(&self, message_id: MessageId, user_id: &UserId) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?, ?)")
                .bind(message_id.0)
                .bind(user_id.as_str())
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to mark message {} read", message_id.0))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;
        message.read_by = self.read_receipts(message_id).await?;
        Ok(Some(message))
    }

    pub async fn read_receipts(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows =
            sqlx::query("SELECT user_id FROM message_reads WHERE message_id = ? ORDER BY rowid ASC")
                .bind(message_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<String, _>(0)))
            .collect())
    }

    /// Every message whose canonical pair contains `user_id`, with read sets attached.
    pub async fn list_messages_for_participant(
        &self,
        user_id: &UserId,
        order: SortOrder,
    ) -> Result<Vec<StoredMessage>> {
        let order_clause = match order {
            SortOrder::Ascending => "ORDER BY sent_at_ms ASC, id ASC",
            SortOrder::Descending => "ORDER BY sent_at_ms DESC, id DESC",
            SortOrder::Unspecified => "",
        };
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE participant_low = ?1 OR participant_high = ?1
             {order_clause}"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let receipt_rows = sqlx::query(
            "SELECT r.message_id, r.user_id
             FROM message_reads r
             INNER JOIN messages m ON m.id = r.message_id
             WHERE m.participant_low = ?1 OR m.participant_high = ?1
             ORDER BY r.rowid ASC",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut receipts: HashMap<i64, Vec<UserId>> = HashMap::new();
        for row in receipt_rows {
            receipts
                .entry(row.get::<i64, _>(0))
                .or_default()
                .push(UserId(row.get::<String, _>(1)));
        }

        rows.iter()
            .map(|row| {
                let mut message = message_from_row(row)?;
                message.read_by = receipts.remove(&message.message_id.0).unwrap_or_default();
                Ok(message)
            })
            .collect()
    }
}

fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: UserId(row.get::<String, _>(0)),
        name: row.get::<String, _>(1),
        photo: row.get::<Option<String>, _>(2),
        primary_category: row.get::<Option<String>, _>(3),
        is_online: row.get::<bool, _>(4),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let message_id = MessageId(row.get::<i64, _>(0));
    let participants = ConversationKey::from_participants(&[
        UserId(row.get::<String, _>(3)),
        UserId(row.get::<String, _>(4)),
    ])
    .map_err(|err| anyhow!("message {} has corrupt participants: {err}", message_id.0))?;
    let kind_raw = row.get::<String, _>(6);
    let kind = MessageKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("message {} has unknown kind '{kind_raw}'", message_id.0))?;
    let sent_at_ms = row.get::<i64, _>(8);
    let sent_at = DateTime::<Utc>::from_timestamp_millis(sent_at_ms)
        .ok_or_else(|| anyhow!("message {} has out-of-range timestamp", message_id.0))?;

    Ok(StoredMessage {
        message_id,
        sender_id: UserId(row.get::<String, _>(1)),
        receiver_id: UserId(row.get::<String, _>(2)),
        participants,
        content: row.get::<String, _>(5),
        kind,
        sender_name: row.get::<Option<String>, _>(7),
        sent_at,
        read_by: Vec::new(),
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

//! Durable persistence for users, devices, pairing codes, pairings, message
//! logs, and the pending-command queue.
//!
//! The `Storage` handle owns the SQLite pool; all session state lives in the
//! in-memory registry, never here. Every method is a single transaction.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Returns the current instant in the canonical column format.
///
/// All timestamp columns hold RFC 3339 UTC text; because the format is
/// fixed, range predicates (`expires_at > ?`, retention cutoffs) are plain
/// string comparisons in SQL.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ─── Model types ─────────────────────────────────────────────────────────────

/// The two sides of a pairing. Immutable once a device is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Host,
    Client,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Host => "host",
            DeviceRole::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(DeviceRole::Host),
            "client" => Some(DeviceRole::Client),
            _ => None,
        }
    }

    /// The role a paired peer must have.
    pub fn opposite(self) -> Self {
        match self {
            DeviceRole::Host => DeviceRole::Client,
            DeviceRole::Client => DeviceRole::Host,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    /// PHC-formatted Argon2 hash. NULL for federated-only accounts.
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub google_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub device_type: String,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

impl DeviceRow {
    pub fn role(&self) -> Option<DeviceRole> {
        DeviceRole::parse(&self.device_type)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairingCodeRow {
    pub id: i64,
    pub user_id: i64,
    pub host_device_id: i64,
    pub code: String,
    pub expires_at: String,
    /// `0` = unused, `1` = consumed (SQLite INTEGER).
    pub used: i64,
    pub created_at: String,
}

impl PairingCodeRow {
    pub fn is_used(&self) -> bool {
        self.used != 0
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairingRow {
    pub id: i64,
    pub host_device_id: i64,
    pub client_device_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageLogRow {
    pub id: i64,
    pub from_device_id: i64,
    pub to_device_id: i64,
    pub msg_kind: String,
    /// Opaque JSON text, stored exactly as relayed.
    pub payload: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingCommandRow {
    pub id: i64,
    pub host_device_id: i64,
    pub from_device_id: i64,
    pub payload: String,
    /// `0` = waiting, `1` = delivered (SQLite INTEGER).
    pub delivered: i64,
    pub created_at: String,
}

// ─── Storage ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        password_hash: Option<&str>,
        email: Option<&str>,
        google_id: Option<&str>,
    ) -> Result<UserRow> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, email, google_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(email)
        .bind(google_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_user(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_user_by_google_id(&self, google_id: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE google_id = ?")
            .bind(google_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn link_google_id(&self, user_id: i64, google_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET google_id = ? WHERE id = ?")
            .bind(google_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Devices ────────────────────────────────────────────────────────────

    pub async fn create_device(
        &self,
        user_id: i64,
        name: &str,
        role: DeviceRole,
    ) -> Result<DeviceRow> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "INSERT INTO devices (user_id, name, device_type, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(role.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_device(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("device not found after insert"))
    }

    pub async fn get_device(&self, id: i64) -> Result<Option<DeviceRow>> {
        Ok(sqlx::query_as("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_devices(&self, user_id: i64) -> Result<Vec<DeviceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM devices WHERE user_id = ? ORDER BY id ASC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// The caller's first client device (lowest id) — the implicit sender
    /// for HTTP-originated commands.
    pub async fn first_client_device(&self, user_id: i64) -> Result<Option<DeviceRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM devices WHERE user_id = ? AND device_type = 'client'
             ORDER BY id ASC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn touch_last_seen(&self, device_id: i64) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE devices SET last_seen_at = ? WHERE id = ?")
            .bind(&now)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Pairing codes ──────────────────────────────────────────────────────

    /// Invalidate any unused codes for the host, then insert the fresh one —
    /// one transaction, so at most one live code exists per host at any
    /// instant.
    pub async fn replace_pairing_code(
        &self,
        user_id: i64,
        host_device_id: i64,
        code: &str,
        expires_at: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE pairing_codes SET used = 1 WHERE host_device_id = ? AND used = 0")
            .bind(host_device_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO pairing_codes (user_id, host_device_id, code, expires_at, used, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(user_id)
        .bind(host_device_id)
        .bind(code)
        .bind(expires_at)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// An expired-but-unused code is indistinguishable from a missing one.
    pub async fn find_active_code(&self, code: &str) -> Result<Option<PairingCodeRow>> {
        let now = now_rfc3339();
        Ok(sqlx::query_as(
            "SELECT * FROM pairing_codes WHERE code = ? AND used = 0 AND expires_at > ? LIMIT 1",
        )
        .bind(code)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn mark_code_used(&self, code_id: i64) -> Result<()> {
        sqlx::query("UPDATE pairing_codes SET used = 1 WHERE id = ?")
            .bind(code_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All codes ever issued for a host, newest first.
    pub async fn codes_for_host(&self, host_device_id: i64) -> Result<Vec<PairingCodeRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM pairing_codes WHERE host_device_id = ? ORDER BY id DESC")
                .bind(host_device_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Insert a code row with an explicit expiry, leaving prior codes alone.
    pub async fn insert_pairing_code(
        &self,
        user_id: i64,
        host_device_id: i64,
        code: &str,
        expires_at: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO pairing_codes (user_id, host_device_id, code, expires_at, used, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(user_id)
        .bind(host_device_id)
        .bind(code)
        .bind(expires_at)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Pairings ───────────────────────────────────────────────────────────

    pub async fn find_pairing(
        &self,
        host_device_id: i64,
        client_device_id: i64,
    ) -> Result<Option<PairingRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM pairings WHERE host_device_id = ? AND client_device_id = ?",
        )
        .bind(host_device_id)
        .bind(client_device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Consume the code and create the pairing atomically. Returns the new
    /// pairing id.
    pub async fn consume_code_and_pair(
        &self,
        code_id: i64,
        host_device_id: i64,
        client_device_id: i64,
    ) -> Result<i64> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE pairing_codes SET used = 1 WHERE id = ?")
            .bind(code_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "INSERT INTO pairings (host_device_id, client_device_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(host_device_id)
        .bind(client_device_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// First pairing for a device on the given side, lowest id first.
    pub async fn first_pairing_for(
        &self,
        device_id: i64,
        side: DeviceRole,
    ) -> Result<Option<PairingRow>> {
        let sql = match side {
            DeviceRole::Host => "SELECT * FROM pairings WHERE host_device_id = ? ORDER BY id ASC LIMIT 1",
            DeviceRole::Client => {
                "SELECT * FROM pairings WHERE client_device_id = ? ORDER BY id ASC LIMIT 1"
            }
        };
        Ok(sqlx::query_as(sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Device ids paired with `device_id`, where `side` is the role of
    /// `device_id` itself (a host's peers are clients and vice versa).
    pub async fn paired_peer_ids(&self, device_id: i64, side: DeviceRole) -> Result<Vec<i64>> {
        let sql = match side {
            DeviceRole::Host => "SELECT client_device_id FROM pairings WHERE host_device_id = ?",
            DeviceRole::Client => "SELECT host_device_id FROM pairings WHERE client_device_id = ?",
        };
        let rows: Vec<(i64,)> = sqlx::query_as(sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ─── Message logs ───────────────────────────────────────────────────────

    pub async fn log_message(
        &self,
        from_device_id: i64,
        to_device_id: i64,
        msg_kind: &str,
        payload: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO message_logs (from_device_id, to_device_id, msg_kind, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(from_device_id)
        .bind(to_device_id)
        .bind(msg_kind)
        .bind(payload)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Page of logs touching any of the user's devices, newest first, plus
    /// the total count for the same filter.
    pub async fn history(
        &self,
        user_id: i64,
        device_filter: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<MessageLogRow>, i64)> {
        let (items, total) = if let Some(device_id) = device_filter {
            let items: Vec<MessageLogRow> = sqlx::query_as(
                "SELECT * FROM message_logs
                 WHERE (from_device_id = ? OR to_device_id = ?)
                 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(device_id)
            .bind(device_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            let (total,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM message_logs WHERE from_device_id = ? OR to_device_id = ?",
            )
            .bind(device_id)
            .bind(device_id)
            .fetch_one(&self.pool)
            .await?;
            (items, total)
        } else {
            let items: Vec<MessageLogRow> = sqlx::query_as(
                "SELECT * FROM message_logs
                 WHERE from_device_id IN (SELECT id FROM devices WHERE user_id = ?)
                    OR to_device_id IN (SELECT id FROM devices WHERE user_id = ?)
                 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(user_id)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            let (total,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM message_logs
                 WHERE from_device_id IN (SELECT id FROM devices WHERE user_id = ?)
                    OR to_device_id IN (SELECT id FROM devices WHERE user_id = ?)",
            )
            .bind(user_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            (items, total)
        };
        Ok((items, total))
    }

    /// Delete logs older than `days` days and return the count. Invoked once
    /// at process start.
    pub async fn purge_old_logs(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
        let n = sqlx::query("DELETE FROM message_logs WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }

    // ─── Pending commands ───────────────────────────────────────────────────

    pub async fn queue_command(
        &self,
        host_device_id: i64,
        from_device_id: i64,
        payload: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO pending_commands (host_device_id, from_device_id, payload, delivered, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(host_device_id)
        .bind(from_device_id)
        .bind(payload)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Undelivered commands for a host in insertion order. The drain marks
    /// each row delivered only after its send succeeds, so an aborted drain
    /// resumes exactly where it stopped.
    pub async fn undelivered_commands(&self, host_device_id: i64) -> Result<Vec<PendingCommandRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM pending_commands WHERE host_device_id = ? AND delivered = 0
             ORDER BY created_at ASC, id ASC",
        )
        .bind(host_device_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn mark_command_delivered(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE pending_commands SET delivered = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        (storage, dir)
    }

    async fn seed_host(storage: &Storage) -> (i64, i64) {
        let user = storage
            .create_user("alice", Some("x"), None, None)
            .await
            .unwrap();
        let host = storage
            .create_device(user.id, "Phone", DeviceRole::Host)
            .await
            .unwrap();
        (user.id, host.id)
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let (storage, _dir) = open_storage().await;
        storage.create_user("bob", Some("x"), None, None).await.unwrap();
        assert!(storage.create_user("bob", Some("y"), None, None).await.is_err());
    }

    #[tokio::test]
    async fn replace_pairing_code_leaves_one_active() {
        let (storage, _dir) = open_storage().await;
        let (user_id, host_id) = seed_host(&storage).await;
        let later = (Utc::now() + Duration::minutes(10)).to_rfc3339();

        storage
            .replace_pairing_code(user_id, host_id, "111111", &later)
            .await
            .unwrap();
        storage
            .replace_pairing_code(user_id, host_id, "222222", &later)
            .await
            .unwrap();

        let codes = storage.codes_for_host(host_id).await.unwrap();
        assert_eq!(codes.len(), 2);
        let active: Vec<_> = codes.iter().filter(|c| !c.is_used()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code, "222222");

        assert!(storage.find_active_code("111111").await.unwrap().is_none());
        assert!(storage.find_active_code("222222").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_code_is_not_active() {
        let (storage, _dir) = open_storage().await;
        let (user_id, host_id) = seed_host(&storage).await;
        let past = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        storage
            .insert_pairing_code(user_id, host_id, "999999", &past)
            .await
            .unwrap();
        assert!(storage.find_active_code("999999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_commands_drain_in_insertion_order() {
        let (storage, _dir) = open_storage().await;
        let (user_id, host_id) = seed_host(&storage).await;
        let client = storage
            .create_device(user_id, "Laptop", DeviceRole::Client)
            .await
            .unwrap();

        for payload in ["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"] {
            storage.queue_command(host_id, client.id, payload).await.unwrap();
        }

        let pending = storage.undelivered_commands(host_id).await.unwrap();
        let payloads: Vec<_> = pending.iter().map(|c| c.payload.as_str()).collect();
        assert_eq!(payloads, vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);

        storage.mark_command_delivered(pending[0].id).await.unwrap();
        let remaining = storage.undelivered_commands(host_id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].payload, "{\"n\":2}");
    }

    #[tokio::test]
    async fn history_pages_and_counts() {
        let (storage, _dir) = open_storage().await;
        let (user_id, host_id) = seed_host(&storage).await;
        let client = storage
            .create_device(user_id, "Laptop", DeviceRole::Client)
            .await
            .unwrap();

        for i in 0..5 {
            storage
                .log_message(client.id, host_id, "command", &format!("{{\"n\":{i}}}"))
                .await
                .unwrap();
        }

        let (items, total) = storage.history(user_id, None, 2, 0).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 2);

        let (items, total) = storage.history(user_id, None, 200, 4).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 1);

        // A stranger sees nothing.
        let other = storage.create_user("mallory", Some("x"), None, None).await.unwrap();
        let (items, total) = storage.history(other.id, None, 50, 0).await.unwrap();
        assert_eq!(total, 0);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_only_old_logs() {
        let (storage, _dir) = open_storage().await;
        let (user_id, host_id) = seed_host(&storage).await;
        let client = storage
            .create_device(user_id, "Laptop", DeviceRole::Client)
            .await
            .unwrap();

        storage.log_message(client.id, host_id, "command", "{}").await.unwrap();
        // Plant an old row directly.
        let old = (Utc::now() - Duration::days(120)).to_rfc3339();
        sqlx::query(
            "INSERT INTO message_logs (from_device_id, to_device_id, msg_kind, payload, created_at)
             VALUES (?, ?, 'command', '{}', ?)",
        )
        .bind(client.id)
        .bind(host_id)
        .bind(&old)
        .execute(&storage.pool)
        .await
        .unwrap();

        let purged = storage.purge_old_logs(90).await.unwrap();
        assert_eq!(purged, 1);
        let (_, total) = storage.history(user_id, None, 50, 0).await.unwrap();
        assert_eq!(total, 1);
    }
}

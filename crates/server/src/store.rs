//! Durable relay state: agents, devices, pairing codes, refresh tokens,
//! billing accounts, and rate counters.
//!
//! `Store` is the trait surface named in the design; `SqliteStore` is the
//! only production implementation, backed by `sqlx` against a single SQLite
//! file opened in WAL mode. Schema is created with idempotent
//! `CREATE TABLE IF NOT EXISTS` statements on first use rather than a
//! migration framework, appropriate for a schema this small. Row access uses
//! `sqlx::query`/`query_as` with hand-written `FromRow` structs, not the
//! compile-time-checked `query!` macros, since those need a live
//! `DATABASE_URL` at build time and this crate must build offline.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::RelayError;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRow {
    pub id: String,
    pub display_name: String,
    pub secret_hash: String,
    pub tenant_id: Option<String>,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub agent_id: String,
    pub label: String,
    pub tenant_id: Option<String>,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone)]
pub struct PairingSnapshot {
    pub agent_id: String,
    pub display_name: String,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: String,
    pub email: String,
    pub provider: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub plan: String,
    pub subscription_status: Option<String>,
}

/// Durable state with transactional batches and targeted queries.
///
/// Implemented as native `async fn`s in a trait (stable since the 2024
/// edition) rather than pulling in `async-trait`; nothing in this server
/// needs `dyn Store`, so the lack of trait-object support costs nothing.
pub trait Store: Send + Sync + 'static {
    async fn upsert_agent(
        &self,
        agent_id: &str,
        display_name: &str,
        secret_hash: &str,
        tenant_id: Option<&str>,
    ) -> Result<AgentRow, RelayError>;

    async fn find_agent_by_id(&self, agent_id: &str) -> Result<Option<AgentRow>, RelayError>;

    async fn touch_agent_last_seen(&self, agent_id: &str) -> Result<(), RelayError>;

    async fn agents_in_tenant(&self, tenant_id: Option<&str>) -> Result<Vec<AgentRow>, RelayError>;

    async fn issue_pairing(
        &self,
        agent_id: &str,
        code: &str,
        expires_at: i64,
    ) -> Result<(), RelayError>;

    async fn consume_pairing(
        &self,
        code: &str,
        now: i64,
        max_attempts: u32,
    ) -> Result<PairingSnapshot, RelayError>;

    async fn create_device(
        &self,
        device_id: &str,
        agent_id: &str,
        label: &str,
        tenant_id: Option<&str>,
        now: i64,
    ) -> Result<(), RelayError>;

    async fn store_refresh_token(
        &self,
        token_hash: &str,
        device_id: &str,
        agent_id: &str,
        expires_at: i64,
    ) -> Result<(), RelayError>;

    /// Atomically delete `old_hash` and insert the successor row. The two
    /// must never both be valid at once.
    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        new_hash: &str,
        device_id: &str,
        agent_id: &str,
        new_expires: i64,
    ) -> Result<(), RelayError>;

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(String, String, i64)>, RelayError>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<AccountRow>, RelayError>;

    async fn create_account(
        &self,
        account_id: &str,
        email: &str,
        provider: &str,
    ) -> Result<AccountRow, RelayError>;

    async fn upsert_session(
        &self,
        token_hash: &str,
        account_id: &str,
        expires_at: i64,
    ) -> Result<(), RelayError>;

    async fn resolve_session(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<AccountRow>, RelayError>;

    async fn link_account_agent(&self, account_id: &str, agent_id: &str) -> Result<(), RelayError>;

    async fn count_account_agents(&self, account_id: &str) -> Result<u32, RelayError>;

    async fn account_has_agent(&self, account_id: &str, agent_id: &str) -> Result<bool, RelayError>;

    async fn replace_account_agents(
        &self,
        account_id: &str,
        agent_ids: &[String],
    ) -> Result<(), RelayError>;

    /// Attach billing state to an account, matched by an existing
    /// `stripe_customer_id` or, on the first webhook event for an account
    /// that has none yet, by `account_id`.
    async fn update_account_billing(
        &self,
        account_id: Option<&str>,
        customer_id: &str,
        subscription_id: Option<&str>,
        plan: &str,
        status: &str,
    ) -> Result<(), RelayError>;

    async fn find_account_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<AccountRow>, RelayError>;

    /// First attempt in a window inserts; an expired window resets the
    /// counter; otherwise increments and compares against `max`.
    async fn rate_check(
        &self,
        key: &str,
        max: u32,
        window_seconds: i64,
    ) -> Result<bool, RelayError>;

    async fn cleanup(&self, now: i64) -> Result<(), RelayError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self, RelayError> {
        if let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::Internal(format!("failed to create db directory: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| RelayError::Internal(format!("invalid sqlite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_memory() -> Result<Self, RelayError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                tenant_id TEXT,
                last_seen_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                label TEXT NOT NULL,
                tenant_id TEXT,
                last_seen_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                token_hash TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                stripe_customer_id TEXT,
                stripe_subscription_id TEXT,
                plan TEXT NOT NULL DEFAULT 'free',
                subscription_status TEXT
            );
            CREATE TABLE IF NOT EXISTS account_sessions (
                token_hash TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS account_agents (
                account_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                PRIMARY KEY (account_id, agent_id)
            );
            CREATE TABLE IF NOT EXISTS rate_counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                window_start INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl Store for SqliteStore {
    async fn upsert_agent(
        &self,
        agent_id: &str,
        display_name: &str,
        secret_hash: &str,
        tenant_id: Option<&str>,
    ) -> Result<AgentRow, RelayError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, AgentRow>(
            "SELECT id, display_name, secret_hash, tenant_id, last_seen_at FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO agents (id, display_name, secret_hash, tenant_id, last_seen_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(agent_id)
                .bind(display_name)
                .bind(secret_hash)
                .bind(tenant_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                AgentRow {
                    id: agent_id.to_string(),
                    display_name: display_name.to_string(),
                    secret_hash: secret_hash.to_string(),
                    tenant_id: tenant_id.map(str::to_string),
                    last_seen_at: now,
                }
            }
            Some(existing) => {
                if !crate::crypto::constant_time_eq(
                    existing.secret_hash.as_bytes(),
                    secret_hash.as_bytes(),
                ) {
                    return Err(RelayError::AgentSecretMismatch);
                }
                sqlx::query(
                    "UPDATE agents SET display_name = ?, tenant_id = ? WHERE id = ?",
                )
                .bind(display_name)
                .bind(tenant_id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
                AgentRow {
                    id: agent_id.to_string(),
                    display_name: display_name.to_string(),
                    secret_hash: existing.secret_hash,
                    tenant_id: tenant_id.map(str::to_string),
                    last_seen_at: existing.last_seen_at,
                }
            }
        };

        tx.commit().await?;
        Ok(row)
    }

    async fn find_agent_by_id(&self, agent_id: &str) -> Result<Option<AgentRow>, RelayError> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT id, display_name, secret_hash, tenant_id, last_seen_at FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_agent_last_seen(&self, agent_id: &str) -> Result<(), RelayError> {
        sqlx::query("UPDATE agents SET last_seen_at = ? WHERE id = ?")
            .bind(now_unix())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn agents_in_tenant(&self, tenant_id: Option<&str>) -> Result<Vec<AgentRow>, RelayError> {
        let rows = match tenant_id {
            Some(t) => {
                sqlx::query_as::<_, AgentRow>(
                    "SELECT id, display_name, secret_hash, tenant_id, last_seen_at FROM agents WHERE tenant_id = ?",
                )
                .bind(t)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AgentRow>(
                    "SELECT id, display_name, secret_hash, tenant_id, last_seen_at FROM agents WHERE tenant_id IS NULL",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn issue_pairing(
        &self,
        agent_id: &str,
        code: &str,
        expires_at: i64,
    ) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pairing_codes WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO pairing_codes (code, agent_id, expires_at, attempts) VALUES (?, ?, ?, 0)",
        )
        .bind(code)
        .bind(agent_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn consume_pairing(
        &self,
        code: &str,
        now: i64,
        max_attempts: u32,
    ) -> Result<PairingSnapshot, RelayError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT agent_id, expires_at, attempts FROM pairing_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Err(RelayError::PairingInvalid);
        };
        let agent_id: String = row.get("agent_id");
        let expires_at: i64 = row.get("expires_at");
        let attempts: i64 = row.get("attempts");

        if expires_at < now {
            tx.commit().await?;
            return Err(RelayError::PairingExpired);
        }

        if attempts as u32 >= max_attempts {
            sqlx::query("DELETE FROM pairing_codes WHERE code = ?")
                .bind(code)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Err(RelayError::PairingAttemptsExceeded);
        }

        sqlx::query("UPDATE pairing_codes SET attempts = attempts + 1 WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await?;

        let agent = sqlx::query_as::<_, AgentRow>(
            "SELECT id, display_name, secret_hash, tenant_id, last_seen_at FROM agents WHERE id = ?",
        )
        .bind(&agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        // Code stays live on a transient miss (e.g. a race with the agent
        // being re-registered) so a resubmission of the same code can still
        // succeed, bounded by the attempts increment above.
        let Some(agent) = agent else {
            tx.commit().await?;
            return Err(RelayError::PairingInvalid);
        };

        sqlx::query("DELETE FROM pairing_codes WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PairingSnapshot {
            agent_id: agent.id,
            display_name: agent.display_name,
            tenant_id: agent.tenant_id,
        })
    }

    async fn create_device(
        &self,
        device_id: &str,
        agent_id: &str,
        label: &str,
        tenant_id: Option<&str>,
        now: i64,
    ) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO devices (id, agent_id, label, tenant_id, last_seen_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(agent_id)
        .bind(label)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_refresh_token(
        &self,
        token_hash: &str,
        device_id: &str,
        agent_id: &str,
        expires_at: i64,
    ) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, device_id, agent_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(token_hash)
        .bind(device_id)
        .bind(agent_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        new_hash: &str,
        device_id: &str,
        agent_id: &str,
        new_expires: i64,
    ) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = ?")
            .bind(old_hash)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, device_id, agent_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(new_hash)
        .bind(device_id)
        .bind(agent_id)
        .bind(new_expires)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(String, String, i64)>, RelayError> {
        let row = sqlx::query("SELECT device_id, agent_id, expires_at FROM refresh_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("device_id"), r.get("agent_id"), r.get("expires_at"))))
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<AccountRow>, RelayError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, email, provider, stripe_customer_id, stripe_subscription_id, plan, subscription_status \
             FROM accounts WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_account(
        &self,
        account_id: &str,
        email: &str,
        provider: &str,
    ) -> Result<AccountRow, RelayError> {
        sqlx::query(
            "INSERT INTO accounts (id, email, provider, plan, subscription_status) VALUES (?, ?, ?, 'free', NULL)",
        )
        .bind(account_id)
        .bind(email)
        .bind(provider)
        .execute(&self.pool)
        .await?;
        Ok(AccountRow {
            id: account_id.to_string(),
            email: email.to_string(),
            provider: provider.to_string(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            plan: "free".to_string(),
            subscription_status: None,
        })
    }

    async fn upsert_session(
        &self,
        token_hash: &str,
        account_id: &str,
        expires_at: i64,
    ) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO account_sessions (token_hash, account_id, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(token_hash) DO UPDATE SET account_id = excluded.account_id, expires_at = excluded.expires_at",
        )
        .bind(token_hash)
        .bind(account_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_session(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<AccountRow>, RelayError> {
        let row = sqlx::query(
            "SELECT account_id, expires_at FROM account_sessions WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let account_id: String = row.get("account_id");
        let expires_at: i64 = row.get("expires_at");
        if expires_at < now {
            return Ok(None);
        }
        self.find_account_by_id(&account_id).await
    }

    async fn link_account_agent(&self, account_id: &str, agent_id: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT OR IGNORE INTO account_agents (account_id, agent_id) VALUES (?, ?)",
        )
        .bind(account_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_account_agents(&self, account_id: &str) -> Result<u32, RelayError> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM account_agents WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }

    async fn account_has_agent(&self, account_id: &str, agent_id: &str) -> Result<bool, RelayError> {
        let row = sqlx::query(
            "SELECT 1 as present FROM account_agents WHERE account_id = ? AND agent_id = ?",
        )
        .bind(account_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn replace_account_agents(
        &self,
        account_id: &str,
        agent_ids: &[String],
    ) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM account_agents WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        for agent_id in agent_ids {
            sqlx::query("INSERT OR IGNORE INTO account_agents (account_id, agent_id) VALUES (?, ?)")
                .bind(account_id)
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_account_billing(
        &self,
        account_id: Option<&str>,
        customer_id: &str,
        subscription_id: Option<&str>,
        plan: &str,
        status: &str,
    ) -> Result<(), RelayError> {
        let id_match = account_id.unwrap_or(customer_id);
        sqlx::query(
            "UPDATE accounts SET stripe_customer_id = ?, stripe_subscription_id = COALESCE(?, stripe_subscription_id), \
             plan = ?, subscription_status = ? WHERE stripe_customer_id = ? OR id = ?",
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(plan)
        .bind(status)
        .bind(customer_id)
        .bind(id_match)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_account_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<AccountRow>, RelayError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, email, provider, stripe_customer_id, stripe_subscription_id, plan, subscription_status \
             FROM accounts WHERE stripe_customer_id = ?",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn rate_check(&self, key: &str, max: u32, window_seconds: i64) -> Result<bool, RelayError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT count, window_start FROM rate_counters WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let allowed = match row {
            None => {
                sqlx::query(
                    "INSERT INTO rate_counters (key, count, window_start) VALUES (?, 1, ?)",
                )
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                true
            }
            Some(row) => {
                let count: i64 = row.get("count");
                let window_start: i64 = row.get("window_start");
                if now - window_start >= window_seconds {
                    sqlx::query(
                        "UPDATE rate_counters SET count = 1, window_start = ? WHERE key = ?",
                    )
                    .bind(now)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                    true
                } else if count < max as i64 {
                    sqlx::query("UPDATE rate_counters SET count = count + 1 WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                    true
                } else {
                    false
                }
            }
        };

        tx.commit().await?;
        Ok(allowed)
    }

    async fn cleanup(&self, now: i64) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM pairing_codes WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rate_counters WHERE window_start < ?")
            .bind(now - 3600)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM account_sessions WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl SqliteStore {
    async fn find_account_by_id(&self, account_id: &str) -> Result<Option<AccountRow>, RelayError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, email, provider, stripe_customer_id, stripe_subscription_id, plan, subscription_status \
             FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect_memory().await.unwrap()
    }

    #[tokio::test]
    async fn upsert_agent_inserts_then_updates_non_secret_fields() {
        let s = store().await;
        let a = s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        assert_eq!(a.display_name, "Agent One");

        let a2 = s.upsert_agent("a1", "Agent One Renamed", "hash1", Some("tenant-x")).await.unwrap();
        assert_eq!(a2.display_name, "Agent One Renamed");
        assert_eq!(a2.tenant_id.as_deref(), Some("tenant-x"));
    }

    #[tokio::test]
    async fn upsert_agent_rejects_mismatched_secret() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        let err = s.upsert_agent("a1", "Agent One", "hash2", None).await.unwrap_err();
        assert!(matches!(err, RelayError::AgentSecretMismatch));
    }

    #[tokio::test]
    async fn pairing_issue_replaces_prior_code() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        s.issue_pairing("a1", "CODE0001", now_unix() + 600).await.unwrap();
        s.issue_pairing("a1", "CODE0002", now_unix() + 600).await.unwrap();

        let err = s.consume_pairing("CODE0001", now_unix(), 5).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingInvalid));

        let snap = s.consume_pairing("CODE0002", now_unix(), 5).await.unwrap();
        assert_eq!(snap.agent_id, "a1");
    }

    #[tokio::test]
    async fn pairing_consume_is_single_use() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        s.issue_pairing("a1", "CODE0003", now_unix() + 600).await.unwrap();

        s.consume_pairing("CODE0003", now_unix(), 5).await.unwrap();
        let err = s.consume_pairing("CODE0003", now_unix(), 5).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingInvalid));
    }

    #[tokio::test]
    async fn pairing_rejects_after_expiry() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        s.issue_pairing("a1", "CODE0004", now_unix() - 1).await.unwrap();

        let err = s.consume_pairing("CODE0004", now_unix(), 5).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingExpired));
    }

    #[tokio::test]
    async fn pairing_rejects_past_max_attempts() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        s.issue_pairing("a1", "CODE0005", now_unix() + 600).await.unwrap();

        for _ in 0..5 {
            let _ = s.consume_pairing("WRONGCDE", now_unix(), 5).await;
        }
        // directly drive the attempts counter up on the real code via repeated
        // invalid completions isn't meaningful here; simulate by calling
        // consume_pairing with a max_attempts of 0 instead.
        let err = s.consume_pairing("CODE0005", now_unix(), 0).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingAttemptsExceeded));
    }

    #[tokio::test]
    async fn pairing_attempts_accumulate_across_failed_consumptions() {
        let s = store().await;
        s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        s.issue_pairing("a1", "CODE0006", now_unix() + 600).await.unwrap();
        sqlx::query("DELETE FROM agents WHERE id = 'a1'")
            .execute(&s.pool)
            .await
            .unwrap();

        for _ in 0..3 {
            let err = s.consume_pairing("CODE0006", now_unix(), 3).await.unwrap_err();
            assert!(matches!(err, RelayError::PairingInvalid));
        }
        // the code stayed live across the transient agent-lookup misses above,
        // so the accumulated attempts now trip the guard
        let err = s.consume_pairing("CODE0006", now_unix(), 3).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingAttemptsExceeded));

        let err = s.consume_pairing("CODE0006", now_unix(), 3).await.unwrap_err();
        assert!(matches!(err, RelayError::PairingInvalid));
    }

    #[tokio::test]
    async fn refresh_token_rotation_invalidates_old_hash() {
        let s = store().await;
        s.store_refresh_token("hash-r1", "device-1", "agent-1", now_unix() + 1000).await.unwrap();
        s.rotate_refresh_token("hash-r1", "hash-r2", "device-1", "agent-1", now_unix() + 2000)
            .await
            .unwrap();

        assert!(s.find_refresh_token("hash-r1").await.unwrap().is_none());
        assert!(s.find_refresh_token("hash-r2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rate_check_allows_up_to_max_then_blocks() {
        let s = store().await;
        for _ in 0..5 {
            assert!(s.rate_check("ip:1.2.3.4:pairing", 5, 60).await.unwrap());
        }
        assert!(!s.rate_check("ip:1.2.3.4:pairing", 5, 60).await.unwrap());
    }

    #[tokio::test]
    async fn rate_check_resets_after_window() {
        let s = store().await;
        for _ in 0..5 {
            assert!(s.rate_check("k", 5, 1).await.unwrap());
        }
        assert!(!s.rate_check("k", 5, 1).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert!(s.rate_check("k", 5, 1).await.unwrap());
    }

    #[tokio::test]
    async fn account_agent_linking_counts_distinct_agents() {
        let s = store().await;
        let acc = s.create_account("acc-1", "a@example.com", "google").await.unwrap();
        s.link_account_agent(&acc.id, "agent-a").await.unwrap();
        s.link_account_agent(&acc.id, "agent-b").await.unwrap();
        s.link_account_agent(&acc.id, "agent-a").await.unwrap(); // idempotent

        assert_eq!(s.count_account_agents(&acc.id).await.unwrap(), 2);
        assert!(s.account_has_agent(&acc.id, "agent-a").await.unwrap());
        assert!(!s.account_has_agent(&acc.id, "agent-z").await.unwrap());
    }

    #[tokio::test]
    async fn session_resolves_only_before_expiry() {
        let s = store().await;
        let acc = s.create_account("acc-2", "b@example.com", "google").await.unwrap();
        s.upsert_session("sesshash", &acc.id, now_unix() + 10).await.unwrap();

        let resolved = s.resolve_session("sesshash", now_unix()).await.unwrap();
        assert!(resolved.is_some());

        let expired = s.resolve_session("sesshash", now_unix() + 20).await.unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_expired_rows() {
        let s = store().await;
        s.store_refresh_token("stale", "d", "a", now_unix() - 10).await.unwrap();
        s.cleanup(now_unix()).await.unwrap();
        assert!(s.find_refresh_token("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_creates_a_file_backed_database_that_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.sqlite");
        let path = path.to_str().unwrap();

        {
            let s = SqliteStore::connect(path).await.unwrap();
            s.upsert_agent("a1", "Agent One", "hash1", None).await.unwrap();
        }

        let reopened = SqliteStore::connect(path).await.unwrap();
        let agent = reopened.find_agent_by_id("a1").await.unwrap();
        assert_eq!(agent.unwrap().display_name, "Agent One");
    }
}

//! Typed row store over SQLite and PostgreSQL
//!
//! All durable state goes through this module. Queries are plain SQL
//! templates, one file per statement under `sql/`, written in the portable
//! subset both engines accept; only the migration DDL diverges per dialect.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::models::*;
use crate::config::{DatabaseType, FileConfig};
use crate::error::{AppError, Result};

/// Load one SQL template from `sql/`
macro_rules! statement {
    ($name:literal) => {
        include_str!(concat!("sql/", $name, ".sql"))
    };
}

/// Relay implementations matched by the `RELAYS` software-ban token
pub const RELAY_SOFTWARE: &[&str] = &[
    "activityrelay",
    "activity-relay",
    "aoderelay",
    "feditools-relay",
];

/// Consecutive 404 responses before an inbox counts as failed
const FAILED_AFTER_404S: i64 = 3;

struct Migration {
    version: i64,
    sqlite: &'static str,
    postgres: &'static str,
}

/// Ordered, forward-only migrations; the applied version is recorded in
/// `config` under `schema-version`.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sqlite: include_str!("sql/migrations/0001_init.sqlite.sql"),
        postgres: include_str!("sql/migrations/0001_init.postgres.sql"),
    },
    Migration {
        version: 2,
        sqlite: include_str!("sql/migrations/0002_delivery_state.sqlite.sql"),
        postgres: include_str!("sql/migrations/0002_delivery_state.postgres.sql"),
    },
];

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| AppError::Validation(format!("invalid stored timestamp: {e}")))
}

fn instance_from_row(row: &AnyRow) -> Result<Instance> {
    let failed_since: Option<String> = row.try_get("failed_since")?;

    Ok(Instance {
        domain: row.try_get("domain")?,
        actor: row.try_get("actor")?,
        inbox: row.try_get("inbox")?,
        followid: row.try_get("followid")?,
        software: row.try_get("software")?,
        accepted: row.try_get::<i64, _>("accepted")? != 0,
        failures: row.try_get("failures")?,
        failed_since: failed_since.as_deref().map(parse_ts).transpose()?,
        created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
    })
}

fn user_from_row(row: &AnyRow) -> Result<User> {
    Ok(User {
        username: row.try_get("username")?,
        hash: row.try_get("hash")?,
        handle: row.try_get("handle")?,
        created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
    })
}

/// New or refreshed state for an inbox row
#[derive(Debug, Clone)]
pub struct InstanceUpsert {
    pub domain: String,
    pub actor: String,
    pub inbox: String,
    pub followid: Option<String>,
    pub software: Option<String>,
    pub accepted: bool,
}

/// Database connection pool wrapper
pub struct Store {
    pool: AnyPool,
    kind: DatabaseType,
}

impl Store {
    // =========================================================================
    // Connection and migration
    // =========================================================================

    /// Open the pool described by the file config
    ///
    /// Pool size follows the concurrency model: min 1, max twice the
    /// fan-out worker count.
    pub async fn from_config(file_config: &FileConfig) -> Result<Self> {
        let url = match file_config.database_type {
            DatabaseType::Sqlite => {
                format!("sqlite://{}?mode=rwc", file_config.sqlite_path.display())
            }
            DatabaseType::Postgres => {
                let pg = &file_config.postgres;
                let auth = match &pg.pass {
                    Some(pass) => format!("{}:{}", pg.user, pass),
                    None => pg.user.clone(),
                };
                format!("postgres://{}@{}:{}/{}", auth, pg.host, pg.port, pg.name)
            }
        };

        let max_connections = (file_config.worker_count() * 2).max(1) as u32;
        Self::connect(file_config.database_type, &url, max_connections).await
    }

    /// Connect to a database by URL
    pub async fn connect(kind: DatabaseType, url: &str, max_connections: u32) -> Result<Self> {
        install_default_drivers();

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool, kind })
    }

    /// An in-memory SQLite store, used by tests
    ///
    /// Capped at a single connection so every query sees the same
    /// in-memory database.
    pub async fn memory() -> Result<Self> {
        let store = Self::connect(DatabaseType::Sqlite, "sqlite::memory:", 1).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations
    ///
    /// Idempotent: already-applied versions are skipped based on the
    /// recorded `schema-version`. A database newer than this binary is a
    /// fatal configuration error.
    pub async fn migrate(&self) -> Result<()> {
        let current = self.schema_version().await;

        if current > SCHEMA_VERSION {
            return Err(AppError::Config(format!(
                "database schema version {current} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let ddl = match self.kind {
                DatabaseType::Sqlite => migration.sqlite,
                DatabaseType::Postgres => migration.postgres,
            };

            let mut tx = self.pool.begin().await?;

            for fragment in ddl.split(';') {
                let sql = fragment.trim();
                if sql.is_empty() {
                    continue;
                }
                sqlx::query(sql).execute(&mut *tx).await?;
            }

            sqlx::query(statement!("put-config"))
                .bind("schema-version")
                .bind(migration.version.to_string())
                .bind(ValueType::Int.as_str())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            tracing::info!(version = migration.version, "Applied schema migration");
        }

        Ok(())
    }

    /// The recorded schema version, or 0 when the config table is missing
    async fn schema_version(&self) -> i64 {
        let row = sqlx::query(statement!("get-config"))
            .bind("schema-version")
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => row
                .try_get::<String, _>("value")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    // =========================================================================
    // Runtime configuration
    // =========================================================================

    /// Load the full runtime configuration, with defaults for absent keys
    pub async fn get_relay_config(&self) -> Result<RelayConfig> {
        let rows = sqlx::query(statement!("get-config-all"))
            .fetch_all(&self.pool)
            .await?;

        let mut relay_config = RelayConfig::default();

        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;

            if let Err(error) = relay_config.apply(&key, &value) {
                tracing::warn!(%key, %error, "Ignoring unreadable config row");
            }
        }

        Ok(relay_config)
    }

    /// Validate and store one config value; returns the canonical form
    pub async fn put_config(&self, key: &str, value: &str) -> Result<String> {
        let (canonical, value_type) = RelayConfig::encode(key, value)?;

        sqlx::query(statement!("put-config"))
            .bind(key)
            .bind(&canonical)
            .bind(value_type.as_str())
            .execute(&self.pool)
            .await?;

        Ok(canonical)
    }

    /// Remove a config row, falling back to the built-in default
    pub async fn del_config(&self, key: &str) -> Result<()> {
        sqlx::query(statement!("del-config"))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Inboxes
    // =========================================================================

    /// Look up an inbox row by domain, actor IRI or inbox IRI
    pub async fn get_inbox(&self, needle: &str) -> Result<Option<Instance>> {
        let row = sqlx::query(statement!("get-inbox"))
            .bind(needle)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    /// All subscribed inboxes
    pub async fn get_inboxes(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(statement!("get-inboxes"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(instance_from_row).collect()
    }

    /// Follows waiting for admin approval
    pub async fn get_requests(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(statement!("get-requests"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(instance_from_row).collect()
    }

    /// Create or refresh an inbox row, keyed on domain
    ///
    /// A re-follow updates the stored `followid`; delivery failure
    /// counters are left untouched by the upsert.
    pub async fn put_inbox(&self, upsert: &InstanceUpsert) -> Result<Instance> {
        sqlx::query(statement!("put-inbox"))
            .bind(&upsert.domain)
            .bind(&upsert.actor)
            .bind(&upsert.inbox)
            .bind(&upsert.followid)
            .bind(&upsert.software)
            .bind(i64::from(upsert.accepted))
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;

        self.get_inbox(&upsert.domain)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("upserted inbox row vanished")))
    }

    /// Flip a pending follow to subscribed
    pub async fn set_inbox_accepted(&self, domain: &str) -> Result<bool> {
        let result = sqlx::query(statement!("set-inbox-accepted"))
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Backfill the software name learned from nodeinfo
    pub async fn set_inbox_software(&self, domain: &str, software: &str) -> Result<()> {
        sqlx::query(statement!("set-inbox-software"))
            .bind(software)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete an inbox row by domain, actor IRI or inbox IRI
    pub async fn del_inbox(&self, needle: &str) -> Result<bool> {
        let result = sqlx::query(statement!("del-inbox"))
            .bind(needle)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() >= 1)
    }

    /// Delete the inbox row whose Follow activity matches, for Undo
    pub async fn del_inbox_by_followid(&self, followid: &str) -> Result<Option<Instance>> {
        let row = sqlx::query(statement!("get-inbox-by-followid"))
            .bind(followid)
            .fetch_optional(&self.pool)
            .await?;

        let Some(instance) = row.as_ref().map(instance_from_row).transpose()? else {
            return Ok(None);
        };

        let result = sqlx::query(statement!("del-inbox-by-followid"))
            .bind(followid)
            .execute(&self.pool)
            .await?;

        Ok((result.rows_affected() >= 1).then_some(instance))
    }

    /// Reset the failure counter after a successful delivery
    pub async fn record_delivery_success(&self, domain: &str) -> Result<()> {
        sqlx::query(statement!("reset-inbox-failures"))
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record one failed delivery and return the updated row
    ///
    /// `hard` marks responses that prove the endpoint is gone (410).
    /// A row becomes failed on a hard failure or the third consecutive
    /// 404-class failure; `failed_since` then tracks the start of the
    /// continuous failure window used for auto-removal.
    pub async fn record_delivery_failure(&self, domain: &str, hard: bool) -> Result<Option<Instance>> {
        let Some(instance) = self.get_inbox(domain).await? else {
            return Ok(None);
        };

        let failures = instance.failures + 1;
        let failed_since = match instance.failed_since {
            Some(existing) => Some(existing),
            None if hard || failures >= FAILED_AFTER_404S => Some(Utc::now()),
            None => None,
        };

        sqlx::query(statement!("set-inbox-failure"))
            .bind(failures)
            .bind(failed_since.map(fmt_ts))
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(Some(Instance {
            failures,
            failed_since,
            ..instance
        }))
    }

    // =========================================================================
    // Domain bans
    // =========================================================================

    pub async fn get_domain_ban(&self, domain: &str) -> Result<Option<DomainBan>> {
        let row = sqlx::query(statement!("get-domain-ban"))
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(DomainBan {
                domain: row.try_get("domain")?,
                reason: row.try_get("reason")?,
                note: row.try_get("note")?,
                created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
            })
        })
        .transpose()
    }

    pub async fn get_domain_bans(&self) -> Result<Vec<DomainBan>> {
        let rows = sqlx::query(statement!("get-domain-bans"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DomainBan {
                    domain: row.try_get("domain")?,
                    reason: row.try_get("reason")?,
                    note: row.try_get("note")?,
                    created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
                })
            })
            .collect()
    }

    /// Ban a domain
    ///
    /// The ban, the removal of the domain's inbox rows and the removal of
    /// its whitelist entry happen in a single transaction.
    pub async fn put_domain_ban(
        &self,
        domain: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<DomainBan> {
        let created = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(statement!("put-domain-ban"))
            .bind(domain)
            .bind(reason)
            .bind(note)
            .bind(fmt_ts(created))
            .execute(&mut *tx)
            .await?;

        sqlx::query(statement!("del-inboxes-for-domain"))
            .bind(domain)
            .execute(&mut *tx)
            .await?;

        sqlx::query(statement!("del-whitelist-domain"))
            .bind(domain)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(DomainBan {
            domain: domain.to_string(),
            reason: reason.map(str::to_string),
            note: note.map(str::to_string),
            created,
        })
    }

    pub async fn update_domain_ban(
        &self,
        domain: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<Option<DomainBan>> {
        let Some(existing) = self.get_domain_ban(domain).await? else {
            return Ok(None);
        };

        let reason = reason.map(str::to_string).or(existing.reason);
        let note = note.map(str::to_string).or(existing.note);

        sqlx::query(statement!("update-domain-ban"))
            .bind(&reason)
            .bind(&note)
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(Some(DomainBan {
            domain: domain.to_string(),
            reason,
            note,
            created: existing.created,
        }))
    }

    pub async fn del_domain_ban(&self, domain: &str) -> Result<bool> {
        let result = sqlx::query(statement!("del-domain-ban"))
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Software bans
    // =========================================================================

    pub async fn get_software_ban(&self, name: &str) -> Result<Option<SoftwareBan>> {
        let row = sqlx::query(statement!("get-software-ban"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(SoftwareBan {
                name: row.try_get("name")?,
                reason: row.try_get("reason")?,
                note: row.try_get("note")?,
                created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
            })
        })
        .transpose()
    }

    pub async fn get_software_bans(&self) -> Result<Vec<SoftwareBan>> {
        let rows = sqlx::query(statement!("get-software-bans"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SoftwareBan {
                    name: row.try_get("name")?,
                    reason: row.try_get("reason")?,
                    note: row.try_get("note")?,
                    created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
                })
            })
            .collect()
    }

    pub async fn put_software_ban(
        &self,
        name: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<SoftwareBan> {
        let created = Utc::now();

        sqlx::query(statement!("put-software-ban"))
            .bind(name)
            .bind(reason)
            .bind(note)
            .bind(fmt_ts(created))
            .execute(&self.pool)
            .await?;

        Ok(SoftwareBan {
            name: name.to_string(),
            reason: reason.map(str::to_string),
            note: note.map(str::to_string),
            created,
        })
    }

    pub async fn update_software_ban(
        &self,
        name: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<Option<SoftwareBan>> {
        let Some(existing) = self.get_software_ban(name).await? else {
            return Ok(None);
        };

        let reason = reason.map(str::to_string).or(existing.reason);
        let note = note.map(str::to_string).or(existing.note);

        sqlx::query(statement!("update-software-ban"))
            .bind(&reason)
            .bind(&note)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(Some(SoftwareBan {
            name: name.to_string(),
            reason,
            note,
            created: existing.created,
        }))
    }

    pub async fn del_software_ban(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(statement!("del-software-ban"))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Whitelist
    // =========================================================================

    pub async fn get_whitelist_domain(&self, domain: &str) -> Result<Option<WhitelistEntry>> {
        let row = sqlx::query(statement!("get-whitelist-domain"))
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(WhitelistEntry {
                domain: row.try_get("domain")?,
                created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
            })
        })
        .transpose()
    }

    pub async fn get_whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        let rows = sqlx::query(statement!("get-whitelist"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(WhitelistEntry {
                    domain: row.try_get("domain")?,
                    created: parse_ts(row.try_get::<String, _>("created")?.as_str())?,
                })
            })
            .collect()
    }

    pub async fn put_whitelist_domain(&self, domain: &str) -> Result<WhitelistEntry> {
        let created = Utc::now();

        sqlx::query(statement!("put-whitelist-domain"))
            .bind(domain)
            .bind(fmt_ts(created))
            .execute(&self.pool)
            .await?;

        Ok(WhitelistEntry {
            domain: domain.to_string(),
            created,
        })
    }

    pub async fn del_whitelist_domain(&self, domain: &str) -> Result<bool> {
        let result = sqlx::query(statement!("del-whitelist-domain"))
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Users and tokens
    // =========================================================================

    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(statement!("get-user"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(statement!("get-users"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(user_from_row).collect()
    }

    /// Create or update a user with a freshly hashed password
    pub async fn put_user(
        &self,
        username: &str,
        password: &str,
        handle: Option<&str>,
    ) -> Result<User> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("password hashing failed: {e}")))?
            .to_string();

        sqlx::query(statement!("put-user"))
            .bind(username)
            .bind(&hash)
            .bind(handle)
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;

        self.get_user(username)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("upserted user row vanished")))
    }

    /// Check a password against the stored hash
    pub async fn verify_user(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .get_user(username)
            .await?
            .ok_or_else(|| AppError::Auth("invalid credentials".to_string()))?;

        let parsed = PasswordHash::new(&user.hash)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("stored hash unreadable: {e}")))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AppError::Auth("invalid credentials".to_string()))?;

        Ok(user)
    }

    /// Delete a user and every token it owns, in one transaction
    pub async fn del_user(&self, username: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(statement!("del-user-tokens"))
            .bind(username)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(statement!("del-user"))
            .bind(username)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Look up the owner of an API token
    pub async fn get_user_by_token(&self, code: &str) -> Result<Option<User>> {
        let row = sqlx::query(statement!("get-user-by-token"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    /// Mint a new API token for a user
    pub async fn put_token(&self, username: &str) -> Result<Token> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let code = URL_SAFE_NO_PAD.encode(bytes);
        let created = Utc::now();

        sqlx::query(statement!("put-token"))
            .bind(&code)
            .bind(username)
            .bind(fmt_ts(created))
            .execute(&self.pool)
            .await?;

        Ok(Token {
            code,
            user: username.to_string(),
            created,
        })
    }

    pub async fn del_token(&self, code: &str) -> Result<bool> {
        let result = sqlx::query(statement!("del-token"))
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Cache rows (DB cache backend)
    // =========================================================================

    pub async fn get_cache_item(&self, namespace: &str, key: &str) -> Result<Option<CacheItem>> {
        let row = sqlx::query(statement!("get-cache-item"))
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(CacheItem {
                value: row.try_get("value")?,
                value_type: ValueType::parse(row.try_get::<String, _>("type")?.as_str())?,
                updated: parse_ts(row.try_get::<String, _>("updated")?.as_str())?,
            })
        })
        .transpose()
    }

    pub async fn set_cache_item(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        value_type: ValueType,
    ) -> Result<()> {
        sqlx::query(statement!("set-cache-item"))
            .bind(namespace)
            .bind(key)
            .bind(value)
            .bind(value_type.as_str())
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn del_cache_item(&self, namespace: &str, key: &str) -> Result<()> {
        sqlx::query(statement!("del-cache-item"))
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn del_cache_namespace(&self, namespace: &str) -> Result<()> {
        sqlx::query(statement!("del-cache-namespace"))
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_cache(&self) -> Result<()> {
        sqlx::query(statement!("clear-cache"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop cache rows last written before the cutoff
    pub async fn sweep_cache(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(statement!("sweep-cache"))
            .bind(fmt_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(domain: &str) -> InstanceUpsert {
        InstanceUpsert {
            domain: domain.to_string(),
            actor: format!("https://{domain}/actor"),
            inbox: format!("https://{domain}/inbox"),
            followid: Some(format!("https://{domain}/follows/1")),
            software: None,
            accepted: true,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();

        let relay_config = store.get_relay_config().await.unwrap();
        assert_eq!(relay_config.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn inbox_needle_matches_domain_actor_and_inbox() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("a.example")).await.unwrap();

        for needle in [
            "a.example",
            "https://a.example/actor",
            "https://a.example/inbox",
        ] {
            let found = store.get_inbox(needle).await.unwrap();
            assert_eq!(found.unwrap().domain, "a.example", "needle {needle}");
        }

        assert!(store.get_inbox("b.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refollow_updates_followid_without_duplicating() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("a.example")).await.unwrap();

        let mut second = upsert("a.example");
        second.followid = Some("https://a.example/follows/2".to_string());
        store.put_inbox(&second).await.unwrap();

        let inboxes = store.get_inboxes().await.unwrap();
        assert_eq!(inboxes.len(), 1);
        assert_eq!(
            inboxes[0].followid.as_deref(),
            Some("https://a.example/follows/2")
        );
    }

    #[tokio::test]
    async fn domain_ban_cascades_over_inboxes_and_whitelist() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("bad.example")).await.unwrap();
        store.put_whitelist_domain("bad.example").await.unwrap();

        store
            .put_domain_ban("bad.example", Some("spam"), None)
            .await
            .unwrap();

        assert!(store.get_inbox("bad.example").await.unwrap().is_none());
        assert!(store
            .get_whitelist_domain("bad.example")
            .await
            .unwrap()
            .is_none());
        assert!(store.get_domain_ban("bad.example").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleting_user_invalidates_tokens() {
        let store = Store::memory().await.unwrap();
        store.put_user("admin", "hunter2!", None).await.unwrap();
        let token = store.put_token("admin").await.unwrap();

        assert!(store
            .get_user_by_token(&token.code)
            .await
            .unwrap()
            .is_some());

        assert!(store.del_user("admin").await.unwrap());
        assert!(store
            .get_user_by_token(&token.code)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn password_verification_round_trips() {
        let store = Store::memory().await.unwrap();
        store.put_user("admin", "correct horse", None).await.unwrap();

        assert!(store.verify_user("admin", "correct horse").await.is_ok());
        assert!(matches!(
            store.verify_user("admin", "wrong").await,
            Err(AppError::Auth(_))
        ));
        assert!(matches!(
            store.verify_user("nobody", "x").await,
            Err(AppError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn delivery_failures_accumulate_and_reset() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("flaky.example")).await.unwrap();

        // two soft failures: counted but not yet failed
        for _ in 0..2 {
            let row = store
                .record_delivery_failure("flaky.example", false)
                .await
                .unwrap()
                .unwrap();
            assert!(row.failed_since.is_none());
        }

        // third soft failure crosses the threshold
        let row = store
            .record_delivery_failure("flaky.example", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.failures, 3);
        assert!(row.failed_since.is_some());

        // success resets everything
        store.record_delivery_success("flaky.example").await.unwrap();
        let row = store.get_inbox("flaky.example").await.unwrap().unwrap();
        assert_eq!(row.failures, 0);
        assert!(row.failed_since.is_none());
    }

    #[tokio::test]
    async fn hard_failure_marks_failed_immediately() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("gone.example")).await.unwrap();

        let row = store
            .record_delivery_failure("gone.example", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.failures, 1);
        assert!(row.failed_since.is_some());
    }

    #[tokio::test]
    async fn cache_rows_round_trip_and_sweep() {
        let store = Store::memory().await.unwrap();
        store
            .set_cache_item("nodeinfo", "a.example", "mastodon", ValueType::Str)
            .await
            .unwrap();

        let item = store
            .get_cache_item("nodeinfo", "a.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.value, "mastodon");
        assert_eq!(item.value_type, ValueType::Str);

        // nothing is older than a cutoff in the past
        let removed = store
            .sweep_cache(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // everything is older than a cutoff in the future
        let removed = store
            .sweep_cache(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_cache_item("nodeinfo", "a.example")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn undo_by_followid_removes_the_right_row() {
        let store = Store::memory().await.unwrap();
        store.put_inbox(&upsert("a.example")).await.unwrap();
        store.put_inbox(&upsert("b.example")).await.unwrap();

        let removed = store
            .del_inbox_by_followid("https://a.example/follows/1")
            .await
            .unwrap();
        assert_eq!(removed.unwrap().domain, "a.example");
        assert_eq!(store.get_inboxes().await.unwrap().len(), 1);

        assert!(store
            .del_inbox_by_followid("https://nowhere.example/f/9")
            .await
            .unwrap()
            .is_none());
    }
}

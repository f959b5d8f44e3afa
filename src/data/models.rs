//! Data models
//!
//! Rust structs representing database rows, the DB-stored runtime
//! configuration, and the tagged cache value codec.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Value type tag for `config` and `cache` rows
///
/// Readers decode strictly based on this tag; there is no dynamic
/// evaluation of stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Str,
    Int,
    Bool,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Json => "json",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "str" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "bool" => Ok(Self::Bool),
            "json" => Ok(Self::Json),
            other => Err(AppError::Validation(format!(
                "unknown value type: {other}"
            ))),
        }
    }
}

/// Parse the loose boolean encodings accepted on the wire and in config
pub fn parse_boolean(value: &str) -> Result<bool, AppError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "y" | "yes" | "true" | "enable" | "enabled" | "1" => Ok(true),
        "off" | "n" | "no" | "false" | "disable" | "disabled" | "0" => Ok(false),
        other => Err(AppError::Validation(format!(
            "cannot parse \"{other}\" as a boolean"
        ))),
    }
}

// =============================================================================
// Durable rows
// =============================================================================

/// A subscribed (or pending) instance
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    /// DNS name incl. explicit port; the natural key
    pub domain: String,
    /// Actor IRI
    pub actor: String,
    /// Inbox IRI used for delivery
    pub inbox: String,
    /// IRI of the Follow activity, matched on Undo
    pub followid: Option<String>,
    /// Software name from nodeinfo, if known
    pub software: Option<String>,
    /// False while waiting for admin approval
    pub accepted: bool,
    /// Consecutive delivery failures since the last success
    #[serde(skip_serializing)]
    pub failures: i64,
    /// When the endpoint started failing continuously
    #[serde(skip_serializing)]
    pub failed_since: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// A banned domain
#[derive(Debug, Clone, Serialize)]
pub struct DomainBan {
    pub domain: String,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub created: DateTime<Utc>,
}

/// A banned software name (lowercased nodeinfo name)
#[derive(Debug, Clone, Serialize)]
pub struct SoftwareBan {
    pub name: String,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub created: DateTime<Utc>,
}

/// A whitelisted domain
#[derive(Debug, Clone, Serialize)]
pub struct WhitelistEntry {
    pub domain: String,
    pub created: DateTime<Utc>,
}

/// An admin user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub username: String,
    /// Argon2 PHC string; salt and cost parameters are inline
    #[serde(skip_serializing)]
    pub hash: String,
    /// Optional ActivityPub handle
    pub handle: Option<String>,
    pub created: DateTime<Utc>,
}

/// An API token
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub code: String,
    pub user: String,
    pub created: DateTime<Utc>,
}

/// A cached value with its age, returned by the KV cache
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub value: String,
    pub value_type: ValueType,
    pub updated: DateTime<Utc>,
}

impl CacheItem {
    /// Whether the item is older than the given TTL
    pub fn older_than(&self, ttl: Duration) -> bool {
        Utc::now() - self.updated > ttl
    }
}

// =============================================================================
// DB-stored runtime configuration
// =============================================================================

/// Admin-selectable UI theme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Default,
    Pink,
    Blue,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Pink => "pink",
            Self::Blue => "blue",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "pink" => Ok(Self::Pink),
            "blue" => Ok(Self::Blue),
            other => Err(AppError::Validation(format!(
                "\"{other}\" is not a valid theme"
            ))),
        }
    }
}

/// Runtime-adjustable log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "VERBOSE" => Ok(Self::Verbose),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(AppError::Validation(format!(
                "\"{other}\" is not a valid log level"
            ))),
        }
    }
}

/// The schema version written by the newest migration
pub const SCHEMA_VERSION: i64 = 2;

/// Runtime-mutable configuration stored in the `config` table
///
/// The table is the canonical source; this struct is the decoded view.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: i64,
    /// PEM-encoded RSA private key of the relay actor
    pub private_key: Option<String>,
    pub approval_required: bool,
    pub log_level: LogLevel,
    pub name: String,
    pub note: String,
    pub theme: Theme,
    pub whitelist_enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            schema_version: 0,
            private_key: None,
            approval_required: false,
            log_level: LogLevel::Info,
            name: "ap-relay".to_string(),
            note: "Make a note about your instance here.".to_string(),
            theme: Theme::Default,
            whitelist_enabled: false,
        }
    }
}

impl RelayConfig {
    /// Keys an admin may change through the API
    pub const USER_KEYS: &'static [&'static str] = &[
        "name",
        "note",
        "theme",
        "log-level",
        "whitelist-enabled",
        "approval-required",
    ];

    /// All recognized keys
    pub const KEYS: &'static [&'static str] = &[
        "schema-version",
        "private-key",
        "name",
        "note",
        "theme",
        "log-level",
        "whitelist-enabled",
        "approval-required",
    ];

    /// Apply one raw `config` row to the decoded view
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        match key {
            "schema-version" => {
                self.schema_version = value
                    .parse()
                    .map_err(|_| AppError::Validation("schema-version must be an int".into()))?
            }
            "private-key" => self.private_key = Some(value.to_string()),
            "approval-required" => self.approval_required = parse_boolean(value)?,
            "log-level" => self.log_level = LogLevel::parse(value)?,
            "name" => self.name = value.to_string(),
            "note" => self.note = value.to_string(),
            "theme" => self.theme = Theme::parse(value)?,
            "whitelist-enabled" => self.whitelist_enabled = parse_boolean(value)?,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown config key: {other}"
                )))
            }
        }

        Ok(())
    }

    /// Serialize a value for storage, validating it against the key
    ///
    /// Returns the canonical string form plus its type tag.
    pub fn encode(key: &str, value: &str) -> Result<(String, ValueType), AppError> {
        match key {
            "schema-version" => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| AppError::Validation("schema-version must be an int".into()))?;
                Ok((parsed.to_string(), ValueType::Int))
            }
            "private-key" | "name" | "note" => Ok((value.to_string(), ValueType::Str)),
            "theme" => Ok((Theme::parse(value)?.as_str().to_string(), ValueType::Str)),
            "log-level" => Ok((LogLevel::parse(value)?.as_str().to_string(), ValueType::Str)),
            "approval-required" | "whitelist-enabled" => {
                Ok((parse_boolean(value)?.to_string(), ValueType::Bool))
            }
            other => Err(AppError::Validation(format!(
                "unknown config key: {other}"
            ))),
        }
    }

    /// The default string form of a key, for `DELETE /api/v1/config`
    pub fn default_value(key: &str) -> Result<String, AppError> {
        let defaults = Self::default();
        Ok(match key {
            "name" => defaults.name,
            "note" => defaults.note,
            "theme" => defaults.theme.as_str().to_string(),
            "log-level" => defaults.log_level.as_str().to_string(),
            "whitelist-enabled" => defaults.whitelist_enabled.to_string(),
            "approval-required" => defaults.approval_required.to_string(),
            other => {
                return Err(AppError::Validation(format!(
                    "unknown config key: {other}"
                )))
            }
        })
    }
}

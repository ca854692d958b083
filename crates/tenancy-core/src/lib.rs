//! Worklane Tenancy Core
//!
//! Core types, error taxonomy, SQLite schema and the tenant-scoped table
//! registry shared by the tenancy repair components.

use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::{FkPath, TableRegistry, TableSpec};

/// Reserved slug for the quarantine sentinel tenant.
///
/// The slug is fixed and well known; the UNIQUE constraint on `tenants.slug`
/// is what guarantees at most one quarantine tenant ever exists, even under
/// concurrent `ensure` calls.
pub const QUARANTINE_SLUG: &str = "system-quarantine";

/// Default cap on sample ids carried in scan/backfill/integrity reports.
pub const DEFAULT_SAMPLE_LIMIT: usize = 20;

/// Default page size for quarantine catalog listings.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Errors that can occur in tenancy repair operations.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("ambiguous tenant resolution: {0}")]
    Ambiguous(String),

    #[error("schema drift: {0}")]
    SchemaDrift(String),

    #[error("confirmation mismatch: {0}")]
    ConfirmationMismatch(String),

    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("other error: {0}")]
    Other(String),
}

/// Result type for tenancy repair operations.
pub type Result<T> = std::result::Result<T, TenancyError>;

/// Tenant status for lifecycle management.
///
/// Lifecycle transitions are owned by the tenant lifecycle component; this
/// subsystem only reads status and creates the single `Isolated` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Tenant is active and can be a backfill/assign target
    #[default]
    Active,
    /// Tenant is deactivated but retained
    Inactive,
    /// Tenant is suspended (billing, abuse, etc.)
    Suspended,
    /// Reserved for the quarantine sentinel tenant
    Isolated,
}

impl TenantStatus {
    /// Get status as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Isolated => "isolated",
        }
    }

    /// Check if the tenant can receive rows from assign/backfill.
    pub fn is_active(&self) -> bool {
        matches!(self, TenantStatus::Active)
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = TenancyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "suspended" => Ok(TenantStatus::Suspended),
            "isolated" => Ok(TenantStatus::Isolated),
            _ => Err(TenancyError::InvalidState(format!(
                "unknown tenant status: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant record as read from the `tenants` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Tenant {
    /// Get the tenant status as an enum.
    pub fn status_enum(&self) -> Option<TenantStatus> {
        self.status.parse().ok()
    }

    /// Check if the tenant can receive rows from assign/backfill.
    pub fn is_active(&self) -> bool {
        self.status_enum().map(|s| s.is_active()).unwrap_or(false)
    }
}

/// Severity of an integrity issue. Static per issue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Tenant isolation is breached; fix before anything else
    Blocker,
    /// Inconsistent but contained; should be investigated
    Warn,
    /// Informational only
    Info,
}

impl Severity {
    /// Get severity as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Blocker => "blocker",
            Severity::Warn => "warn",
            Severity::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit event row. Append-only; this subsystem never updates or deletes
/// audit rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub actor_user_id: Option<i64>,
    pub event_type: String,
    pub message: String,
    /// JSON-encoded before/after state and counters
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Configuration injected into every repair component at construction time.
///
/// No component reads ambient environment state inside its methods; all
/// flags, limits and the quarantine slug flow through this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Reserved slug of the quarantine sentinel tenant
    pub quarantine_slug: String,
    /// Gate for `BackfillEngine` apply mode; dry run is always permitted
    pub backfill_apply_enabled: bool,
    /// Gate for manual remediation actions (assign/archive/delete)
    pub remediation_enabled: bool,
    /// Extra gate for hard delete, on top of `remediation_enabled`
    pub hard_delete_enabled: bool,
    /// Cap on sample ids in reports
    pub sample_limit: usize,
    /// Default page size for quarantine listings
    pub page_size: usize,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            quarantine_slug: QUARANTINE_SLUG.to_string(),
            backfill_apply_enabled: false,
            remediation_enabled: true,
            hard_delete_enabled: false,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Initialize the application schema.
///
/// Creates the tenants table, the tenant-scoped application tables and the
/// append-only audit log. Idempotent - safe to call multiple times.
///
/// The application tables deliberately carry no FOREIGN KEY clauses: the
/// legacy schema this subsystem repairs never enforced them, which is how
/// orphan and cross-tenant rows exist in the first place.
pub fn init_app_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    -- Tenant lifecycle records. The UNIQUE slug backs quarantine idempotence.
    CREATE TABLE IF NOT EXISTS tenants (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      slug TEXT UNIQUE NOT NULL,
      name TEXT NOT NULL,
      status TEXT NOT NULL DEFAULT 'active',
      created_at TEXT NOT NULL DEFAULT (datetime('now')),
      updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS users (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      email TEXT NOT NULL,
      display_name TEXT,
      is_platform_admin INTEGER NOT NULL DEFAULT 0,
      is_active INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS clients (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      name TEXT NOT NULL,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS projects (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      client_id INTEGER,
      name TEXT NOT NULL,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS tasks (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      project_id INTEGER,
      title TEXT NOT NULL,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS time_entries (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      task_id INTEGER,
      user_id INTEGER,
      minutes INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS channels (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      name TEXT NOT NULL,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS messages (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      channel_id INTEGER,
      sender_id INTEGER,
      body TEXT,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Append-only audit log for every mutating repair action
    CREATE TABLE IF NOT EXISTS audit_events (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id INTEGER,
      actor_user_id INTEGER,
      event_type TEXT NOT NULL,
      message TEXT NOT NULL,
      metadata TEXT,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_users_tenant ON users(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_clients_tenant ON clients(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_projects_tenant ON projects(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_tenant ON tasks(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_time_entries_tenant ON time_entries(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_channels_tenant ON channels(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_messages_tenant ON messages(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_audit_events_tenant ON audit_events(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_audit_events_created ON audit_events(created_at);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Check whether a table exists.
///
/// Absence is a first-class return value, not an error: scan and backfill
/// treat a missing table as schema drift and absorb it per table.
pub fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Check whether a column exists on a table.
pub fn column_exists(conn: &rusqlite::Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(rows.any(|r| r.map(|name| name == column).unwrap_or(false)))
}

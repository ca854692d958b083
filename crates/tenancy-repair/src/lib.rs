//! Worklane Tenancy Repair
//!
//! Components for detecting and repairing broken tenant associations in the
//! shared Worklane database:
//!
//! - [`OrphanScanner`] - bounded read-only scan for rows with no tenant
//! - [`BackfillEngine`] - infers tenant ownership via declared FK paths
//! - [`QuarantineManager`] - owns the quarantine sentinel tenant and the
//!   manual remediation actions (assign / archive / delete)
//! - [`QuarantineCatalog`] - paginated, searchable view over quarantined rows
//! - [`IntegrityChecker`] - read-only cross-tenant consistency analyzer
//! - [`TenancyHealthAggregator`] - dashboard snapshot over the above
//! - [`AuditRecorder`] - append-only, best-effort event log
//!
//! All components are constructed from a database path plus an injected
//! [`TenancyConfig`](worklane_tenancy_core::TenancyConfig) and shared
//! [`TableRegistry`](worklane_tenancy_core::TableRegistry); SQLite work runs
//! on `tokio::task::spawn_blocking`.

use rusqlite::Connection;
use worklane_tenancy_core::{Result, TenancyError};

pub mod audit;
pub mod backfill;
pub mod catalog;
pub mod health;
pub mod integrity;
pub mod quarantine;
pub mod scanner;

pub use audit::AuditRecorder;
pub use backfill::{BackfillEngine, BackfillMode, BackfillReport};
pub use catalog::{QuarantineCatalog, QuarantinePage, QuarantineSummary, QuarantinedRow};
pub use health::{TenancyHealth, TenancyHealthAggregator};
pub use integrity::{IntegrityChecker, IntegrityIssue, IntegrityReport};
pub use quarantine::{delete_confirmation_phrase, QuarantineManager};
pub use scanner::{OrphanReport, OrphanScan, OrphanScanner};

/// Open a connection to the shared database.
pub(crate) fn open_db(db_path: &str) -> Result<Connection> {
    Ok(Connection::open(db_path)?)
}

/// Map a tokio join error into the domain error.
pub(crate) fn join_err(err: tokio::task::JoinError) -> TenancyError {
    TenancyError::Other(format!("task join error: {}", err))
}

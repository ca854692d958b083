//! Append-only audit log for repair actions.
//!
//! Audit durability is deliberately asymmetric: every mutating repair action
//! writes exactly one event after its data commit, and a failed audit insert
//! is logged but never propagated back through the business operation.

use rusqlite::OptionalExtension;
use tracing::{debug, warn};
use worklane_tenancy_core::{AuditEvent, Result};

use crate::{join_err, open_db};

/// Best-effort recorder over the `audit_events` table.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    db_path: String,
}

impl AuditRecorder {
    /// Create a recorder for the given database.
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Append one event. Returns `true` if the event was persisted.
    ///
    /// Failure is absorbed: the caller's data mutation has already
    /// committed, and losing an audit row must not roll it back.
    pub async fn append(
        &self,
        tenant_id: Option<i64>,
        actor_user_id: Option<i64>,
        event_type: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let db_path = self.db_path.clone();
        let event_type = event_type.to_string();
        let message = message.to_string();
        let metadata = metadata.map(|m| m.to_string());

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            conn.execute(
                "INSERT INTO audit_events (tenant_id, actor_user_id, event_type, message, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![tenant_id, actor_user_id, event_type, message, metadata],
            )?;
            Ok::<_, worklane_tenancy_core::TenancyError>(())
        })
        .await
        .map_err(join_err)
        .and_then(|r| r);

        match outcome {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to append audit event; continuing");
                false
            }
        }
    }

    /// Most recent events, newest first, optionally filtered by tenant.
    pub async fn recent(&self, tenant_id: Option<i64>, limit: usize) -> Result<Vec<AuditEvent>> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            let map_row = |row: &rusqlite::Row<'_>| {
                Ok(AuditEvent {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    actor_user_id: row.get(2)?,
                    event_type: row.get(3)?,
                    message: row.get(4)?,
                    metadata: row.get(5)?,
                    created_at: row.get(6)?,
                })
            };

            let events: Vec<AuditEvent> = if let Some(tid) = tenant_id {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, actor_user_id, event_type, message, metadata, created_at
                     FROM audit_events WHERE tenant_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![tid, limit as i64], map_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, actor_user_id, event_type, message, metadata, created_at
                     FROM audit_events
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![limit as i64], map_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            debug!(count = events.len(), "read audit events");
            Ok(events)
        })
        .await
        .map_err(join_err)?
    }

    /// Latest event of a given type, if any. Used by tests and operators to
    /// verify the one-event-per-action contract.
    pub async fn latest_of_type(&self, event_type: &str) -> Result<Option<AuditEvent>> {
        let db_path = self.db_path.clone();
        let event_type = event_type.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            let event = conn
                .query_row(
                    "SELECT id, tenant_id, actor_user_id, event_type, message, metadata, created_at
                     FROM audit_events WHERE event_type = ?1
                     ORDER BY id DESC LIMIT 1",
                    [&event_type],
                    |row| {
                        Ok(AuditEvent {
                            id: row.get(0)?,
                            tenant_id: row.get(1)?,
                            actor_user_id: row.get(2)?,
                            event_type: row.get(3)?,
                            message: row.get(4)?,
                            metadata: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(event)
        })
        .await
        .map_err(join_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worklane_tenancy_core::init_app_schema;

    fn setup() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worklane.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        init_app_schema(&conn).unwrap();
        (dir, path.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_append_and_recent() {
        let (_dir, db_path) = setup();
        let audit = AuditRecorder::new(&db_path);

        assert!(
            audit
                .append(
                    Some(1),
                    Some(42),
                    "tenancy.assign",
                    "moved row",
                    Some(serde_json::json!({"table": "projects", "record_id": 7})),
                )
                .await
        );
        assert!(
            audit
                .append(Some(2), None, "tenancy.archive", "deactivated user", None)
                .await
        );

        let all = audit.recent(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].event_type, "tenancy.archive");

        let scoped = audit.recent(Some(1), 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].actor_user_id, Some(42));
        assert!(scoped[0].metadata.as_deref().unwrap().contains("projects"));
    }

    #[tokio::test]
    async fn test_append_failure_is_absorbed() {
        // No schema at all: the insert fails, append reports false and does
        // not panic or error.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        let audit = AuditRecorder::new(path.to_str().unwrap());

        assert!(!audit.append(None, None, "tenancy.delete", "x", None).await);
    }

    #[tokio::test]
    async fn test_latest_of_type() {
        let (_dir, db_path) = setup();
        let audit = AuditRecorder::new(&db_path);

        audit.append(None, None, "tenancy.delete", "first", None).await;
        audit.append(None, None, "tenancy.delete", "second", None).await;

        let latest = audit.latest_of_type("tenancy.delete").await.unwrap().unwrap();
        assert_eq!(latest.message, "second");
        assert!(audit.latest_of_type("tenancy.assign").await.unwrap().is_none());
    }
}

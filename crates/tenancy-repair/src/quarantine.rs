//! Quarantine tenant ownership and manual remediation actions.
//!
//! The quarantine tenant is a reserved sentinel identified by a fixed slug.
//! Creation is idempotent under concurrency: the UNIQUE constraint on
//! `tenants.slug` is the arbiter, not application-level locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};
use worklane_tenancy_core::{
    Result, TableRegistry, Tenant, TenancyConfig, TenancyError,
};

use crate::audit::AuditRecorder;
use crate::{join_err, open_db};

/// The exact phrase a caller must supply to hard-delete a record.
///
/// Compared byte-for-byte; a near miss is a client-side rejection.
pub fn delete_confirmation_phrase(table: &str, record_id: i64) -> String {
    format!("permanently delete {} {}", table, record_id)
}

pub(crate) fn map_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const TENANT_COLUMNS: &str = "id, slug, name, status, created_at, updated_at";

pub(crate) fn find_tenant_by_slug(conn: &Connection, slug: &str) -> Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            &format!("SELECT {} FROM tenants WHERE slug = ?1", TENANT_COLUMNS),
            [slug],
            map_tenant,
        )
        .optional()?;
    Ok(tenant)
}

pub(crate) fn find_tenant_by_id(conn: &Connection, id: i64) -> Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            &format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLUMNS),
            [id],
            map_tenant,
        )
        .optional()?;
    Ok(tenant)
}

/// Create-if-absent lookup of the quarantine tenant.
///
/// A uniqueness conflict on concurrent creation means "already exists": the
/// insert is a no-op and the follow-up select returns the surviving row.
pub(crate) fn ensure_quarantine_blocking(conn: &Connection, slug: &str) -> Result<Tenant> {
    conn.execute(
        "INSERT INTO tenants (slug, name, status) VALUES (?1, 'Quarantine', 'isolated')
         ON CONFLICT(slug) DO NOTHING",
        [slug],
    )?;
    find_tenant_by_slug(conn, slug)?.ok_or_else(|| {
        TenancyError::Other(format!("quarantine tenant vanished after ensure: {}", slug))
    })
}

/// Manager for the quarantine sentinel and the manual remediation actions.
#[derive(Debug, Clone)]
pub struct QuarantineManager {
    db_path: String,
    registry: Arc<TableRegistry>,
    config: TenancyConfig,
    audit: AuditRecorder,
}

impl QuarantineManager {
    /// Create a manager for the given database.
    pub fn new(
        db_path: impl Into<String>,
        registry: Arc<TableRegistry>,
        config: TenancyConfig,
    ) -> Self {
        let db_path = db_path.into();
        let audit = AuditRecorder::new(db_path.clone());
        Self {
            db_path,
            registry,
            config,
            audit,
        }
    }

    /// Lookup-or-create the quarantine tenant.
    pub async fn ensure_quarantine_tenant(&self) -> Result<Tenant> {
        let db_path = self.db_path.clone();
        let slug = self.config.quarantine_slug.clone();

        let tenant = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            ensure_quarantine_blocking(&conn, &slug)
        })
        .await
        .map_err(join_err)??;

        Ok(tenant)
    }

    /// Move a row to a specific tenant.
    ///
    /// The target tenant must exist and be active; the quarantine tenant
    /// itself is `isolated` and therefore never a valid target here.
    pub async fn assign(
        &self,
        table: &str,
        record_id: i64,
        target_tenant_id: i64,
        actor_user_id: Option<i64>,
    ) -> Result<()> {
        self.require_remediation()?;
        let spec = self.spec(table)?;

        let db_path = self.db_path.clone();
        let before = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;

            let target = find_tenant_by_id(&conn, target_tenant_id)?
                .ok_or_else(|| TenancyError::NotFound(format!("tenant {}", target_tenant_id)))?;
            if !target.is_active() {
                return Err(TenancyError::InvalidState(format!(
                    "target tenant {} is {}, not active",
                    target.slug, target.status
                )));
            }

            let before: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE id = ?1",
                        spec.tenant_column, spec.name
                    ),
                    [record_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| {
                    TenancyError::NotFound(format!("{} record {}", spec.name, record_id))
                })?;

            conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?1 WHERE id = ?2",
                    spec.name, spec.tenant_column
                ),
                rusqlite::params![target_tenant_id, record_id],
            )?;

            Ok::<_, TenancyError>(before)
        })
        .await
        .map_err(join_err)??;

        info!(table, record_id, target_tenant_id, "assigned quarantined row");
        self.audit
            .append(
                Some(target_tenant_id),
                actor_user_id,
                "tenancy.assign",
                &format!("assigned {} {} to tenant {}", table, record_id, target_tenant_id),
                Some(serde_json::json!({
                    "table": table,
                    "record_id": record_id,
                    "before_tenant_id": before,
                    "after_tenant_id": target_tenant_id,
                })),
            )
            .await;
        Ok(())
    }

    /// Soft-disable a quarantined row.
    ///
    /// Only defined for tables declaring an archive flag (user-like rows are
    /// deactivated rather than reassigned).
    pub async fn archive(
        &self,
        table: &str,
        record_id: i64,
        actor_user_id: Option<i64>,
    ) -> Result<()> {
        self.require_remediation()?;
        let spec = self.spec(table)?;
        let flag = spec.archive_flag.ok_or_else(|| {
            TenancyError::InvalidState(format!("table {} is not archivable", table))
        })?;

        let db_path = self.db_path.clone();
        let (owner, was_active) = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;

            let row: Option<(Option<i64>, i64)> = conn
                .query_row(
                    &format!(
                        "SELECT {}, {} FROM {} WHERE id = ?1",
                        spec.tenant_column, flag, spec.name
                    ),
                    [record_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (owner, flag_value) = row.ok_or_else(|| {
                TenancyError::NotFound(format!("{} record {}", spec.name, record_id))
            })?;

            conn.execute(
                &format!("UPDATE {} SET {} = 0 WHERE id = ?1", spec.name, flag),
                [record_id],
            )?;

            Ok::<_, TenancyError>((owner, flag_value != 0))
        })
        .await
        .map_err(join_err)??;

        info!(table, record_id, "archived quarantined row");
        self.audit
            .append(
                owner,
                actor_user_id,
                "tenancy.archive",
                &format!("archived {} {}", table, record_id),
                Some(serde_json::json!({
                    "table": table,
                    "record_id": record_id,
                    "was_active": was_active,
                })),
            )
            .await;
        Ok(())
    }

    /// Hard delete with cascade over the registry ownership graph.
    ///
    /// Three independent gates must all hold: the hard-delete feature flag,
    /// a dedicated confirmation signal, and an exact confirmation phrase.
    /// Returns per-table deleted row counts, the target row included.
    pub async fn delete(
        &self,
        table: &str,
        record_id: i64,
        confirmation: &str,
        confirmed: bool,
        actor_user_id: Option<i64>,
    ) -> Result<BTreeMap<String, u64>> {
        self.require_remediation()?;
        if !self.config.hard_delete_enabled {
            return Err(TenancyError::FeatureDisabled(
                "hard delete is disabled".to_string(),
            ));
        }
        if !confirmed {
            return Err(TenancyError::ConfirmationMismatch(
                "confirmation signal not set".to_string(),
            ));
        }
        let expected = delete_confirmation_phrase(table, record_id);
        if confirmation.as_bytes() != expected.as_bytes() {
            return Err(TenancyError::ConfirmationMismatch(format!(
                "expected confirmation phrase {:?}",
                expected
            )));
        }

        let spec = self.spec(table)?;
        let registry = Arc::clone(&self.registry);
        let db_path = self.db_path.clone();

        let (owner, counts) = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;

            let owner: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE id = ?1",
                        spec.tenant_column, spec.name
                    ),
                    [record_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| {
                    TenancyError::NotFound(format!("{} record {}", spec.name, record_id))
                })?;

            let tx = conn.unchecked_transaction()?;
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            let root_select = format!("SELECT id FROM {} WHERE id = ?1", spec.name);
            let mut stack = vec![spec.name];
            cascade_delete(&tx, &registry, spec.name, &root_select, record_id, &mut counts, &mut stack)?;

            let deleted = tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", spec.name),
                [record_id],
            )?;
            *counts.entry(spec.name.to_string()).or_insert(0) += deleted as u64;
            tx.commit()?;

            Ok::<_, TenancyError>((owner, counts))
        })
        .await
        .map_err(join_err)??;

        info!(table, record_id, ?counts, "hard-deleted quarantined row");
        self.audit
            .append(
                owner,
                actor_user_id,
                "tenancy.delete",
                &format!("deleted {} {} and owned descendants", table, record_id),
                Some(serde_json::json!({
                    "table": table,
                    "record_id": record_id,
                    "deleted": counts,
                })),
            )
            .await;
        Ok(counts)
    }

    fn require_remediation(&self) -> Result<()> {
        if !self.config.remediation_enabled {
            return Err(TenancyError::FeatureDisabled(
                "remediation actions are disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn spec(&self, table: &str) -> Result<worklane_tenancy_core::TableSpec> {
        self.registry
            .get(table)
            .cloned()
            .ok_or_else(|| TenancyError::InvalidState(format!("table not registered: {}", table)))
    }
}

/// Depth-first postorder delete of owned descendants.
///
/// Children are addressed through nested `IN (SELECT …)` chains rooted at
/// the record id, so grandchildren go before children and the whole cascade
/// runs inside the caller's transaction.
fn cascade_delete(
    tx: &rusqlite::Transaction<'_>,
    registry: &TableRegistry,
    table: &str,
    parent_select: &str,
    record_id: i64,
    counts: &mut BTreeMap<String, u64>,
    stack: &mut Vec<&'static str>,
) -> Result<()> {
    for edge in registry.children_of(table) {
        if stack.contains(&edge.child_table) {
            warn!(
                child = edge.child_table,
                "ownership cycle detected; skipping edge"
            );
            continue;
        }

        let child_select = format!(
            "SELECT id FROM {} WHERE {} IN ({})",
            edge.child_table, edge.child_column, parent_select
        );

        stack.push(edge.child_table);
        cascade_delete(
            tx,
            registry,
            edge.child_table,
            &child_select,
            record_id,
            counts,
            stack,
        )?;
        stack.pop();

        let deleted = tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} IN ({})",
                edge.child_table, edge.child_column, parent_select
            ),
            [record_id],
        )?;
        if deleted > 0 {
            *counts.entry(edge.child_table.to_string()).or_insert(0) += deleted as u64;
        }
    }
    Ok(())
}

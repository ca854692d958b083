//! Paginated, searchable view over quarantined rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use worklane_tenancy_core::{
    Result, TableRegistry, Tenant, TenancyConfig, TenancyError,
};

use crate::quarantine::find_tenant_by_slug;
use crate::{join_err, open_db};

/// One quarantined row as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedRow {
    pub id: i64,
    /// Table-specific display field (name/title/email-like)
    pub display: Option<String>,
    pub created_at: String,
}

/// One page of quarantined rows.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinePage {
    pub table: String,
    pub rows: Vec<QuarantinedRow>,
    /// Filtered count, not the table total
    pub total: u64,
    pub page: usize,
    pub limit: usize,
}

/// Per-table quarantine counts.
///
/// `tenant: None` means the quarantine tenant has never been created, which
/// is reported distinctly from "exists with zero rows".
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineSummary {
    pub tenant: Option<Tenant>,
    pub tables: BTreeMap<String, u64>,
}

/// Read-only catalog over rows owned by the quarantine tenant.
#[derive(Debug, Clone)]
pub struct QuarantineCatalog {
    db_path: String,
    registry: Arc<TableRegistry>,
    config: TenancyConfig,
}

impl QuarantineCatalog {
    /// Create a catalog for the given database.
    pub fn new(
        db_path: impl Into<String>,
        registry: Arc<TableRegistry>,
        config: TenancyConfig,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            registry,
            config,
        }
    }

    /// List quarantined rows of one table, paginated and optionally filtered
    /// by a case-insensitive substring over the table's search columns.
    ///
    /// Pages are 1-based; `limit == 0` falls back to the configured page
    /// size. Without a quarantine tenant the page is trivially empty.
    pub async fn list(
        &self,
        table: &str,
        page: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<QuarantinePage> {
        let spec = self
            .registry
            .get(table)
            .cloned()
            .ok_or_else(|| TenancyError::InvalidState(format!("table not registered: {}", table)))?;

        let db_path = self.db_path.clone();
        let slug = self.config.quarantine_slug.clone();
        let page = page.max(1);
        let limit = if limit == 0 { self.config.page_size } else { limit };
        let search = search.map(String::from);

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;

            let tenant = match find_tenant_by_slug(&conn, &slug)? {
                Some(tenant) => tenant,
                None => {
                    return Ok(QuarantinePage {
                        table: spec.name.to_string(),
                        rows: Vec::new(),
                        total: 0,
                        page,
                        limit,
                    })
                }
            };

            let mut predicate = format!("{} = ?1", spec.tenant_column);
            let pattern = search.as_deref().map(like_pattern);
            if pattern.is_some() {
                let columns = if spec.search_columns.is_empty() {
                    vec![spec.display_column]
                } else {
                    spec.search_columns.to_vec()
                };
                let clauses: Vec<String> = columns
                    .iter()
                    .map(|col| format!("LOWER({}) LIKE ?2 ESCAPE '\\'", col))
                    .collect();
                predicate.push_str(&format!(" AND ({})", clauses.join(" OR ")));
            }

            let count_sql = format!("SELECT COUNT(*) FROM {} WHERE {}", spec.name, predicate);
            let rows_sql = format!(
                "SELECT id, {}, created_at FROM {} WHERE {} ORDER BY id LIMIT {} OFFSET {}",
                spec.display_column,
                spec.name,
                predicate,
                limit,
                (page - 1) * limit,
            );

            let (total, rows) = if let Some(pattern) = pattern {
                let total: i64 = conn.query_row(
                    &count_sql,
                    rusqlite::params![tenant.id, pattern],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(&rows_sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![tenant.id, pattern], map_quarantined)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                (total, rows)
            } else {
                let total: i64 =
                    conn.query_row(&count_sql, rusqlite::params![tenant.id], |row| row.get(0))?;
                let mut stmt = conn.prepare(&rows_sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![tenant.id], map_quarantined)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                (total, rows)
            };

            debug!(table = spec.name, total, page, "quarantine listing");
            Ok(QuarantinePage {
                table: spec.name.to_string(),
                rows,
                total: total as u64,
                page,
                limit,
            })
        })
        .await
        .map_err(join_err)?
    }

    /// Quarantined row counts per registered table.
    pub async fn summary(&self) -> Result<QuarantineSummary> {
        let db_path = self.db_path.clone();
        let registry = Arc::clone(&self.registry);
        let slug = self.config.quarantine_slug.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;

            let tenant = find_tenant_by_slug(&conn, &slug)?;
            let mut tables = BTreeMap::new();
            for spec in registry.iter() {
                let count: u64 = match &tenant {
                    Some(tenant) => {
                        let count: i64 = conn.query_row(
                            &format!(
                                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                                spec.name, spec.tenant_column
                            ),
                            [tenant.id],
                            |row| row.get(0),
                        )?;
                        count as u64
                    }
                    None => 0,
                };
                tables.insert(spec.name.to_string(), count);
            }

            Ok(QuarantineSummary { tenant, tables })
        })
        .await
        .map_err(join_err)?
    }
}

fn map_quarantined(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantinedRow> {
    Ok(QuarantinedRow {
        id: row.get(0)?,
        display: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/// Lowercased `%substring%` pattern with LIKE metacharacters escaped.
fn like_pattern(search: &str) -> String {
    let escaped = search
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

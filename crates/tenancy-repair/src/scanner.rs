//! Bounded read-only scan for orphan rows.
//!
//! One COUNT plus one LIMIT-capped sample query per table; full tables are
//! never loaded into memory. Schema drift (table or tenant column absent) is
//! a soft failure reported as a zero count so a single broken table never
//! aborts an aggregate scan.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};
use worklane_tenancy_core::{column_exists, Result, TableRegistry, TableSpec, TenancyConfig, TenancyError};

use crate::{join_err, open_db};

/// Scan result for one table. Transient; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanScan {
    pub table: String,
    pub count: u64,
    pub sample_ids: Vec<i64>,
    /// False when the table or its tenant column is missing (schema drift)
    pub schema_present: bool,
}

impl OrphanScan {
    fn drifted(table: &str) -> Self {
        Self {
            table: table.to_string(),
            count: 0,
            sample_ids: Vec::new(),
            schema_present: false,
        }
    }
}

/// Per-table breakdown plus total.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub tables: Vec<OrphanScan>,
    pub total: u64,
}

/// Read-only scanner over the registered tenant-scoped tables.
#[derive(Debug, Clone)]
pub struct OrphanScanner {
    db_path: String,
    registry: Arc<TableRegistry>,
    config: TenancyConfig,
}

impl OrphanScanner {
    /// Create a scanner for the given database.
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

    /// Scan one registered table for rows with no tenant association.
    pub async fn scan(&self, table: &str) -> Result<OrphanScan> {
        let spec = self
            .registry
            .get(table)
            .ok_or_else(|| TenancyError::InvalidState(format!("table not registered: {}", table)))?
            .clone();

        let db_path = self.db_path.clone();
        let sample_limit = self.config.sample_limit;

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            scan_table(&conn, &spec, sample_limit)
        })
        .await
        .map_err(join_err)?
    }

    /// Scan every registered table, in registry order.
    ///
    /// A table whose scan fails outright is reported as drifted rather than
    /// failing the aggregate (partial-result policy).
    pub async fn scan_all(&self) -> Result<OrphanReport> {
        let db_path = self.db_path.clone();
        let registry = Arc::clone(&self.registry);
        let sample_limit = self.config.sample_limit;

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            Ok(scan_all_blocking(&conn, &registry, sample_limit))
        })
        .await
        .map_err(join_err)?
    }
}

pub(crate) fn scan_all_blocking(
    conn: &Connection,
    registry: &TableRegistry,
    sample_limit: usize,
) -> OrphanReport {
    let mut tables = Vec::with_capacity(registry.len());
    let mut total = 0u64;

    for spec in registry.iter() {
        let scan = match scan_table(conn, spec, sample_limit) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(table = spec.name, %err, "orphan scan failed; reporting zero");
                OrphanScan::drifted(spec.name)
            }
        };
        total += scan.count;
        tables.push(scan);
    }

    OrphanReport { tables, total }
}

fn scan_table(conn: &Connection, spec: &TableSpec, sample_limit: usize) -> Result<OrphanScan> {
    if !column_exists(conn, spec.name, spec.tenant_column)? {
        warn!(
            table = spec.name,
            column = spec.tenant_column,
            "schema drift: table or tenant column absent"
        );
        return Ok(OrphanScan::drifted(spec.name));
    }

    let mut predicate = format!("{} IS NULL", spec.tenant_column);
    if let Some(filter) = spec.platform_filter {
        predicate.push_str(" AND ");
        predicate.push_str(filter);
    }

    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE {}", spec.name, predicate),
        [],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} ORDER BY id LIMIT ?1",
        spec.name, predicate
    ))?;
    let sample_ids: Vec<i64> = stmt
        .query_map([sample_limit as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    debug!(table = spec.name, count, "orphan scan");
    Ok(OrphanScan {
        table: spec.name.to_string(),
        count: count as u64,
        sample_ids,
        schema_present: true,
    })
}

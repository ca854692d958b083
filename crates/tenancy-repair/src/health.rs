//! Tenancy health snapshot for the operator dashboard.
//!
//! Pure composition of bounded counts - cheap enough to call from a live
//! dashboard poll loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use worklane_tenancy_core::{Result, TableRegistry, TenancyConfig};

use crate::catalog::{QuarantineCatalog, QuarantineSummary};
use crate::scanner::{OrphanReport, OrphanScanner};
use crate::{join_err, open_db};

/// Combined tenancy health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TenancyHealth {
    pub orphans: OrphanReport,
    pub quarantine: QuarantineSummary,
    /// Live active tenants; the quarantine sentinel is never counted
    pub active_tenants: u64,
    pub generated_at: DateTime<Utc>,
}

/// Aggregator over scanner, quarantine catalog and tenant counts.
#[derive(Debug, Clone)]
pub struct TenancyHealthAggregator {
    db_path: String,
    config: TenancyConfig,
    scanner: OrphanScanner,
    catalog: QuarantineCatalog,
}

impl TenancyHealthAggregator {
    /// Create an aggregator for the given database.
    pub fn new(
        db_path: impl Into<String>,
        registry: Arc<TableRegistry>,
        config: TenancyConfig,
    ) -> Self {
        let db_path = db_path.into();
        let scanner = OrphanScanner::new(db_path.clone(), Arc::clone(&registry), config.clone());
        let catalog = QuarantineCatalog::new(db_path.clone(), registry, config.clone());
        Self {
            db_path,
            config,
            scanner,
            catalog,
        }
    }

    /// Take a dashboard snapshot.
    pub async fn snapshot(&self) -> Result<TenancyHealth> {
        let orphans = self.scanner.scan_all().await?;
        let quarantine = self.catalog.summary().await?;
        let active_tenants = self.active_tenant_count().await?;

        debug!(
            orphans = orphans.total,
            active_tenants, "tenancy health snapshot"
        );
        Ok(TenancyHealth {
            orphans,
            quarantine,
            active_tenants,
            generated_at: Utc::now(),
        })
    }

    async fn active_tenant_count(&self) -> Result<u64> {
        let db_path = self.db_path.clone();
        let slug = self.config.quarantine_slug.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            // The quarantine tenant is isolated, never active; the slug
            // exclusion keeps the count honest even if its status is ever
            // mangled by hand.
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tenants WHERE status = 'active' AND slug != ?1",
                [&slug],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
        .map_err(join_err)?
    }
}

//! Read-only cross-tenant consistency analyzer.
//!
//! A fixed catalog of issue codes, each evaluated by one bounded COUNT and
//! one capped sample query. Severity is a static property of the code. A
//! failing check is logged and skipped; the rest of the report still runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use worklane_tenancy_core::{Result, Severity, TenancyConfig};

use crate::{join_err, open_db};

/// Static definition of one integrity check.
struct CheckSpec {
    code: &'static str,
    severity: Severity,
    description: &'static str,
    count_sql: &'static str,
    /// Same predicate, selecting ids; takes the sample limit as ?1
    sample_sql: &'static str,
}

/// The fixed issue catalog. Missing tenant associations are the scanner's
/// concern; these checks cover everything else that can go wrong across
/// tenant boundaries.
static CHECKS: &[CheckSpec] = &[
    CheckSpec {
        code: "project_client_tenant_mismatch",
        severity: Severity::Blocker,
        description: "projects whose tenant differs from their client's tenant",
        count_sql: "SELECT COUNT(*) FROM projects p JOIN clients c ON c.id = p.client_id
                    WHERE p.tenant_id IS NOT NULL AND c.tenant_id IS NOT NULL
                      AND p.tenant_id != c.tenant_id",
        sample_sql: "SELECT p.id FROM projects p JOIN clients c ON c.id = p.client_id
                     WHERE p.tenant_id IS NOT NULL AND c.tenant_id IS NOT NULL
                       AND p.tenant_id != c.tenant_id ORDER BY p.id LIMIT ?1",
    },
    CheckSpec {
        code: "task_project_tenant_mismatch",
        severity: Severity::Blocker,
        description: "tasks whose tenant differs from their project's tenant",
        count_sql: "SELECT COUNT(*) FROM tasks t JOIN projects p ON p.id = t.project_id
                    WHERE t.tenant_id IS NOT NULL AND p.tenant_id IS NOT NULL
                      AND t.tenant_id != p.tenant_id",
        sample_sql: "SELECT t.id FROM tasks t JOIN projects p ON p.id = t.project_id
                     WHERE t.tenant_id IS NOT NULL AND p.tenant_id IS NOT NULL
                       AND t.tenant_id != p.tenant_id ORDER BY t.id LIMIT ?1",
    },
    CheckSpec {
        code: "time_entry_task_tenant_mismatch",
        severity: Severity::Warn,
        description: "time entries whose tenant differs from their task's tenant",
        count_sql: "SELECT COUNT(*) FROM time_entries e JOIN tasks t ON t.id = e.task_id
                    WHERE e.tenant_id IS NOT NULL AND t.tenant_id IS NOT NULL
                      AND e.tenant_id != t.tenant_id",
        sample_sql: "SELECT e.id FROM time_entries e JOIN tasks t ON t.id = e.task_id
                     WHERE e.tenant_id IS NOT NULL AND t.tenant_id IS NOT NULL
                       AND e.tenant_id != t.tenant_id ORDER BY e.id LIMIT ?1",
    },
    CheckSpec {
        code: "message_channel_tenant_mismatch",
        severity: Severity::Warn,
        description: "messages whose tenant differs from their channel's tenant",
        count_sql: "SELECT COUNT(*) FROM messages m JOIN channels ch ON ch.id = m.channel_id
                    WHERE m.tenant_id IS NOT NULL AND ch.tenant_id IS NOT NULL
                      AND m.tenant_id != ch.tenant_id",
        sample_sql: "SELECT m.id FROM messages m JOIN channels ch ON ch.id = m.channel_id
                     WHERE m.tenant_id IS NOT NULL AND ch.tenant_id IS NOT NULL
                       AND m.tenant_id != ch.tenant_id ORDER BY m.id LIMIT ?1",
    },
    CheckSpec {
        code: "task_dangling_project",
        severity: Severity::Warn,
        description: "tasks referencing a project row that no longer exists",
        count_sql: "SELECT COUNT(*) FROM tasks t WHERE t.project_id IS NOT NULL
                      AND NOT EXISTS (SELECT 1 FROM projects p WHERE p.id = t.project_id)",
        sample_sql: "SELECT t.id FROM tasks t WHERE t.project_id IS NOT NULL
                       AND NOT EXISTS (SELECT 1 FROM projects p WHERE p.id = t.project_id)
                     ORDER BY t.id LIMIT ?1",
    },
    CheckSpec {
        code: "time_entry_dangling_task",
        severity: Severity::Warn,
        description: "time entries referencing a task row that no longer exists",
        count_sql: "SELECT COUNT(*) FROM time_entries e WHERE e.task_id IS NOT NULL
                      AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = e.task_id)",
        sample_sql: "SELECT e.id FROM time_entries e WHERE e.task_id IS NOT NULL
                       AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = e.task_id)
                     ORDER BY e.id LIMIT ?1",
    },
    CheckSpec {
        code: "suspended_tenant_active_users",
        severity: Severity::Info,
        description: "active users under a suspended tenant",
        count_sql: "SELECT COUNT(*) FROM users u JOIN tenants tn ON tn.id = u.tenant_id
                    WHERE tn.status = 'suspended' AND u.is_active = 1",
        sample_sql: "SELECT u.id FROM users u JOIN tenants tn ON tn.id = u.tenant_id
                     WHERE tn.status = 'suspended' AND u.is_active = 1
                     ORDER BY u.id LIMIT ?1",
    },
];

/// A detected inconsistency. Transient; recomputed per run.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: Severity,
    pub count: u64,
    pub sample_ids: Vec<i64>,
    pub description: String,
}

/// Aggregated result of one analyzer run.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    /// Issues with a non-zero count only
    pub issues: Vec<IntegrityIssue>,
    pub total_issues: u64,
    pub blocker_count: u64,
    pub warn_count: u64,
    pub info_count: u64,
    pub generated_at: DateTime<Utc>,
}

/// Analyzer over the fixed check catalog.
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    db_path: String,
    config: TenancyConfig,
}

impl IntegrityChecker {
    /// Create a checker for the given database.
    pub fn new(db_path: impl Into<String>, config: TenancyConfig) -> Self {
        Self {
            db_path: db_path.into(),
            config,
        }
    }

    /// Run every check. One failing check never aborts the rest.
    pub async fn run(&self) -> Result<IntegrityReport> {
        let db_path = self.db_path.clone();
        let sample_limit = self.config.sample_limit;

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            let mut issues = Vec::new();

            for check in CHECKS {
                let count: i64 = match conn.query_row(check.count_sql, [], |row| row.get(0)) {
                    Ok(count) => count,
                    Err(err) => {
                        warn!(code = check.code, %err, "integrity check failed; skipping");
                        continue;
                    }
                };
                if count == 0 {
                    continue;
                }

                let sample_ids = match sample(&conn, check.sample_sql, sample_limit) {
                    Ok(ids) => ids,
                    Err(err) => {
                        warn!(code = check.code, %err, "sample query failed");
                        Vec::new()
                    }
                };

                issues.push(IntegrityIssue {
                    code: check.code.to_string(),
                    severity: check.severity,
                    count: count as u64,
                    sample_ids,
                    description: check.description.to_string(),
                });
            }

            let count_by = |severity: Severity| {
                issues.iter().filter(|i| i.severity == severity).count() as u64
            };
            let report = IntegrityReport {
                total_issues: issues.len() as u64,
                blocker_count: count_by(Severity::Blocker),
                warn_count: count_by(Severity::Warn),
                info_count: count_by(Severity::Info),
                issues,
                generated_at: Utc::now(),
            };

            debug!(
                total = report.total_issues,
                blockers = report.blocker_count,
                "integrity run complete"
            );
            Ok(report)
        })
        .await
        .map_err(join_err)?
    }
}

fn sample(conn: &rusqlite::Connection, sql: &str, limit: usize) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([limit as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

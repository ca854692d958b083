//! Tenant-id backfill over declared foreign-key paths.
//!
//! For each registered table, candidate tenants are gathered by joining each
//! FK path to a parent row whose tenant association is non-null. A row
//! resolving to exactly one candidate is written with a `tenant IS NULL`
//! precondition; disagreeing candidates mark the row ambiguous and leave it
//! untouched; rows with no candidate are routed to the quarantine tenant.
//! Each table is its own atomic unit - cross-table atomicity is not a goal
//! and per-table partial progress is always reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use worklane_tenancy_core::{
    column_exists, Result, TableRegistry, TableSpec, TenancyConfig, TenancyError,
};

use crate::audit::AuditRecorder;
use crate::quarantine::{ensure_quarantine_blocking, find_tenant_by_slug};
use crate::{join_err, open_db};

/// Backfill execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillMode {
    /// Count only; unconditionally side-effect-free.
    ///
    /// Predictions are computed against current data: a child row whose
    /// parent is itself resolved later in the same apply pass is predicted
    /// "would quarantine" here even though apply resolves it.
    DryRun,
    /// Write resolutions and quarantine routing
    Apply,
}

impl BackfillMode {
    /// Get mode as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillMode::DryRun => "dry_run",
            BackfillMode::Apply => "apply",
        }
    }
}

impl std::fmt::Display for BackfillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one backfill run. Recomputed per run, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub mode: BackfillMode,
    /// Rows resolved (or resolvable, in dry run) per table
    pub updated: BTreeMap<String, u64>,
    /// Rows routed (or routable) to the quarantine tenant per table
    pub quarantined: BTreeMap<String, u64>,
    /// Sample ids of rows whose candidate tenants disagree, per table
    pub ambiguous_samples: BTreeMap<String, Vec<i64>>,
    /// Per-table failures; remaining tables still ran
    pub errors: BTreeMap<String, String>,
    pub quarantine_tenant_id: Option<i64>,
}

impl BackfillReport {
    fn new(mode: BackfillMode) -> Self {
        Self {
            mode,
            updated: BTreeMap::new(),
            quarantined: BTreeMap::new(),
            ambiguous_samples: BTreeMap::new(),
            errors: BTreeMap::new(),
            quarantine_tenant_id: None,
        }
    }

    /// Total rows updated across tables.
    pub fn total_updated(&self) -> u64 {
        self.updated.values().sum()
    }

    /// Total rows quarantined across tables.
    pub fn total_quarantined(&self) -> u64 {
        self.quarantined.values().sum()
    }
}

/// Per-table decision sets, computed fresh inside the table's transaction.
struct TableDecisions {
    /// row id -> the single agreed candidate tenant
    resolved: BTreeMap<i64, i64>,
    /// row ids whose paths disagree
    ambiguous: Vec<i64>,
    /// row ids with no resolvable candidate
    unresolved: Vec<i64>,
}

/// Engine inferring tenant ownership for orphan rows.
#[derive(Debug, Clone)]
pub struct BackfillEngine {
    db_path: String,
    registry: Arc<TableRegistry>,
    config: TenancyConfig,
    audit: AuditRecorder,
}

impl BackfillEngine {
    /// Create an engine for the given database.
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

    /// Run a backfill pass over every registered table, in registry order.
    ///
    /// Dry run is always permitted; apply requires the explicit enable flag.
    pub async fn run(
        &self,
        mode: BackfillMode,
        actor_user_id: Option<i64>,
    ) -> Result<BackfillReport> {
        if mode == BackfillMode::Apply && !self.config.backfill_apply_enabled {
            return Err(TenancyError::FeatureDisabled(
                "backfill apply is disabled".to_string(),
            ));
        }

        let db_path = self.db_path.clone();
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();

        let report = tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            let mut report = BackfillReport::new(mode);

            // An already existing quarantine tenant is looked up front: it is
            // reported in both modes and must never act as an inference
            // candidate. Dry run never creates one.
            report.quarantine_tenant_id =
                find_tenant_by_slug(&conn, &config.quarantine_slug)?.map(|t| t.id);

            for spec in registry.iter() {
                match backfill_table(&conn, &registry, spec, mode, &config, &mut report) {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(table = spec.name, %err, "backfill failed for table; continuing");
                        report.errors.insert(spec.name.to_string(), err.to_string());
                    }
                }
            }

            Ok::<_, TenancyError>(report)
        })
        .await
        .map_err(join_err)??;

        info!(
            mode = %mode,
            updated = report.total_updated(),
            quarantined = report.total_quarantined(),
            ambiguous_tables = report.ambiguous_samples.len(),
            "backfill run complete"
        );

        if mode == BackfillMode::Apply {
            self.audit
                .append(
                    report.quarantine_tenant_id,
                    actor_user_id,
                    "tenancy.backfill_apply",
                    "applied tenant backfill",
                    Some(serde_json::json!({
                        "updated": report.updated,
                        "quarantined": report.quarantined,
                        "errors": report.errors,
                    })),
                )
                .await;
        }

        Ok(report)
    }

    /// Preview the inference decision for a single orphan row.
    ///
    /// Returns the uniquely inferred tenant, or `None` when no path yields
    /// a candidate (apply would route the row to quarantine). Disagreeing
    /// candidates raise [`TenancyError::Ambiguous`] carrying the candidate
    /// set, which is how operators drill into the sample ids of a report.
    pub async fn infer_tenant(&self, table: &str, record_id: i64) -> Result<Option<i64>> {
        let spec = self
            .registry
            .get(table)
            .cloned()
            .ok_or_else(|| TenancyError::InvalidState(format!("table not registered: {}", table)))?;

        let db_path = self.db_path.clone();
        let registry = Arc::clone(&self.registry);
        let slug = self.config.quarantine_slug.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_db(&db_path)?;
            if !column_exists(&conn, spec.name, spec.tenant_column)? {
                return Err(TenancyError::SchemaDrift(format!(
                    "{}.{} is missing",
                    spec.name, spec.tenant_column
                )));
            }

            let current: Option<i64> = conn
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
            if let Some(tenant_id) = current {
                return Err(TenancyError::InvalidState(format!(
                    "{} {} already belongs to tenant {}",
                    spec.name, record_id, tenant_id
                )));
            }

            let quarantine_id = find_tenant_by_slug(&conn, &slug)?.map(|t| t.id);
            let mut candidates: BTreeSet<i64> = BTreeSet::new();
            for path in spec.fk_paths {
                let parent = match registry.get(path.parent_table) {
                    Some(parent) => parent,
                    None => continue,
                };
                if !column_exists(&conn, parent.name, parent.tenant_column)? {
                    continue;
                }
                let candidate: Option<i64> = conn
                    .query_row(
                        &format!(
                            "SELECT p.{parent_tenant} FROM {table} t
                             JOIN {parent} p ON p.id = t.{fk}
                             WHERE t.id = ?1 AND p.{parent_tenant} IS NOT NULL",
                            parent_tenant = parent.tenant_column,
                            table = spec.name,
                            parent = parent.name,
                            fk = path.column,
                        ),
                        [record_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(tenant_id) = candidate {
                    if Some(tenant_id) != quarantine_id {
                        candidates.insert(tenant_id);
                    }
                }
            }

            match candidates.len() {
                0 => Ok(None),
                1 => Ok(candidates.iter().next().copied()),
                _ => Err(TenancyError::Ambiguous(format!(
                    "{} {} has candidate tenants {:?}",
                    spec.name,
                    record_id,
                    candidates.iter().collect::<Vec<_>>()
                ))),
            }
        })
        .await
        .map_err(join_err)?
    }
}

fn backfill_table(
    conn: &Connection,
    registry: &TableRegistry,
    spec: &TableSpec,
    mode: BackfillMode,
    config: &TenancyConfig,
    report: &mut BackfillReport,
) -> Result<()> {
    if !column_exists(conn, spec.name, spec.tenant_column)? {
        let drift = TenancyError::SchemaDrift(format!(
            "{}.{} is missing",
            spec.name, spec.tenant_column
        ));
        warn!(table = spec.name, %drift, "skipping table");
        report.updated.insert(spec.name.to_string(), 0);
        report.quarantined.insert(spec.name.to_string(), 0);
        report.errors.insert(spec.name.to_string(), drift.to_string());
        return Ok(());
    }

    let decisions = decide_table(conn, registry, spec, report.quarantine_tenant_id)?;

    if !decisions.ambiguous.is_empty() {
        report.ambiguous_samples.insert(
            spec.name.to_string(),
            decisions
                .ambiguous
                .iter()
                .take(config.sample_limit)
                .copied()
                .collect(),
        );
    }

    match mode {
        BackfillMode::DryRun => {
            report
                .updated
                .insert(spec.name.to_string(), decisions.resolved.len() as u64);
            report
                .quarantined
                .insert(spec.name.to_string(), decisions.unresolved.len() as u64);
        }
        BackfillMode::Apply => {
            // The quarantine tenant is created on the base connection,
            // outside the table's transaction: creation is independently
            // idempotent via the slug constraint, and a rollback of this
            // table must not delete the tenant row after its id has been
            // cached in the report.
            let quarantine_id = if decisions.unresolved.is_empty() {
                None
            } else if let Some(id) = report.quarantine_tenant_id {
                Some(id)
            } else {
                let tenant = ensure_quarantine_blocking(conn, &config.quarantine_slug)?;
                report.quarantine_tenant_id = Some(tenant.id);
                Some(tenant.id)
            };

            let tx = conn.unchecked_transaction()?;

            // Group resolved rows by target tenant for batched updates.
            let mut by_tenant: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
            for (row_id, tenant_id) in &decisions.resolved {
                by_tenant.entry(*tenant_id).or_default().push(*row_id);
            }

            let mut updated = 0u64;
            for (tenant_id, ids) in &by_tenant {
                updated += conditional_update(&tx, spec, *tenant_id, ids)?;
            }

            let mut quarantined = 0u64;
            if let Some(quarantine_id) = quarantine_id {
                quarantined = conditional_update(&tx, spec, quarantine_id, &decisions.unresolved)?;
            }

            tx.commit()?;
            report.updated.insert(spec.name.to_string(), updated);
            report
                .quarantined
                .insert(spec.name.to_string(), quarantined);
        }
    }

    debug!(
        table = spec.name,
        resolved = decisions.resolved.len(),
        ambiguous = decisions.ambiguous.len(),
        unresolved = decisions.unresolved.len(),
        "backfill decisions"
    );
    Ok(())
}

/// Compute fresh per-row decisions for one table.
///
/// The quarantine tenant is never an inference candidate: a row whose only
/// ancestor is itself quarantined is unresolved and gets routed, not
/// resolved.
fn decide_table(
    conn: &Connection,
    registry: &TableRegistry,
    spec: &TableSpec,
    quarantine_id: Option<i64>,
) -> Result<TableDecisions> {
    // Candidate tenants per orphan row, across all declared paths in order.
    let mut candidates: HashMap<i64, BTreeSet<i64>> = HashMap::new();

    for path in spec.fk_paths {
        let parent = match registry.get(path.parent_table) {
            Some(parent) => parent,
            None => {
                warn!(
                    table = spec.name,
                    parent = path.parent_table,
                    "inference path points at unregistered table; skipping path"
                );
                continue;
            }
        };
        if !column_exists(conn, parent.name, parent.tenant_column)? {
            warn!(
                table = spec.name,
                parent = parent.name,
                "schema drift on parent; skipping path"
            );
            continue;
        }

        let sql = format!(
            "SELECT t.id, p.{parent_tenant} FROM {table} t
             JOIN {parent} p ON p.id = t.{fk}
             WHERE t.{tenant} IS NULL AND p.{parent_tenant} IS NOT NULL",
            parent_tenant = parent.tenant_column,
            table = spec.name,
            parent = parent.name,
            fk = path.column,
            tenant = spec.tenant_column,
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (id, tenant_id) = row?;
            if Some(tenant_id) == quarantine_id {
                continue;
            }
            candidates.entry(id).or_default().insert(tenant_id);
        }
    }

    // Every orphan row, so rows with no candidate are routed to quarantine.
    let mut predicate = format!("{} IS NULL", spec.tenant_column);
    if let Some(filter) = spec.platform_filter {
        predicate.push_str(" AND ");
        predicate.push_str(filter);
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} ORDER BY id",
        spec.name, predicate
    ))?;
    let orphan_ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut decisions = TableDecisions {
        resolved: BTreeMap::new(),
        ambiguous: Vec::new(),
        unresolved: Vec::new(),
    };
    for id in orphan_ids {
        match candidates.get(&id) {
            Some(set) if set.len() == 1 => {
                decisions.resolved.insert(id, *set.iter().next().unwrap());
            }
            // Two or more distinct non-null candidates: never guess.
            Some(_) => decisions.ambiguous.push(id),
            None => decisions.unresolved.push(id),
        }
    }
    Ok(decisions)
}

/// Batched conditional update; the `IS NULL` precondition makes re-running
/// apply a no-op for rows already resolved.
fn conditional_update(
    conn: &Connection,
    spec: &TableSpec,
    tenant_id: i64,
    ids: &[i64],
) -> Result<u64> {
    let mut affected = 0u64;
    for chunk in ids.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE {table} SET {tenant} = ? WHERE {tenant} IS NULL AND id IN ({placeholders})",
            table = spec.name,
            tenant = spec.tenant_column,
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
        params.push(&tenant_id);
        for id in chunk {
            params.push(id);
        }
        affected += conn.execute(&sql, params.as_slice())? as u64;
    }
    Ok(affected)
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

        conn.execute_batch(
            r#"
            INSERT INTO tenants (slug, name) VALUES ('t1', 'Tenant One');   -- id 1
            INSERT INTO tenants (slug, name) VALUES ('t2', 'Tenant Two');   -- id 2
            "#,
        )
        .unwrap();

        (dir, path.to_str().unwrap().to_string())
    }

    fn engine(db_path: &str, apply_enabled: bool) -> BackfillEngine {
        let config = TenancyConfig {
            backfill_apply_enabled: apply_enabled,
            ..TenancyConfig::default()
        };
        BackfillEngine::new(db_path, Arc::new(TableRegistry::worklane()), config)
    }

    fn tenant_of(db_path: &str, table: &str, id: i64) -> Option<i64> {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.query_row(
            &format!("SELECT tenant_id FROM {} WHERE id = ?1", table),
            [id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_requires_flag() {
        let (_dir, db_path) = setup();
        let err = engine(&db_path, false)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::FeatureDisabled(_)));

        // Dry run is always permitted.
        engine(&db_path, false)
            .run(BackfillMode::DryRun, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_via_fk_path() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C1');                  -- id 1
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P1'); -- id 1
                "#,
            )
            .unwrap();
        }

        let report = engine(&db_path, true)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap();

        assert_eq!(report.updated.get("projects"), Some(&1));
        assert_eq!(tenant_of(&db_path, "projects", 1), Some(1));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_routes_to_quarantine() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                -- Task whose project also has no tenant and no other path.
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, NULL, 'P');  -- id 1
                INSERT INTO tasks (tenant_id, project_id, title) VALUES (NULL, 1, 'X');      -- id 1
                "#,
            )
            .unwrap();
        }

        let report = engine(&db_path, true)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap();

        let q = report.quarantine_tenant_id.expect("quarantine created lazily");
        assert_eq!(report.quarantined.get("projects"), Some(&1));
        assert_eq!(report.quarantined.get("tasks"), Some(&1));
        assert_eq!(tenant_of(&db_path, "tasks", 1), Some(q));
        assert_eq!(tenant_of(&db_path, "projects", 1), Some(q));
    }

    #[tokio::test]
    async fn test_ambiguous_left_unmodified() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');                      -- id 1
                INSERT INTO projects (tenant_id, client_id, name) VALUES (1, 1, 'P');       -- id 1
                INSERT INTO tasks (tenant_id, project_id, title) VALUES (1, 1, 'T');        -- id 1
                INSERT INTO users (tenant_id, email) VALUES (2, 'u@t2.io');                 -- id 1
                -- task says tenant 1, user says tenant 2
                INSERT INTO time_entries (tenant_id, task_id, user_id, minutes) VALUES (NULL, 1, 1, 10);
                "#,
            )
            .unwrap();
        }

        let report = engine(&db_path, true)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap();

        assert_eq!(
            report.ambiguous_samples.get("time_entries"),
            Some(&vec![1i64])
        );
        assert_eq!(report.updated.get("time_entries"), Some(&0));
        assert_eq!(report.quarantined.get("time_entries"), Some(&0));
        assert_eq!(tenant_of(&db_path, "time_entries", 1), None);
    }

    #[tokio::test]
    async fn test_dry_run_is_pure() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P');
                INSERT INTO channels (tenant_id, name) VALUES (NULL, 'general');
                "#,
            )
            .unwrap();
        }

        let snapshot_before = row_tenant_snapshot(&db_path);
        let report = engine(&db_path, false)
            .run(BackfillMode::DryRun, None)
            .await
            .unwrap();
        let snapshot_after = row_tenant_snapshot(&db_path);

        assert_eq!(report.updated.get("projects"), Some(&1));
        assert_eq!(report.quarantined.get("channels"), Some(&1));
        assert_eq!(snapshot_before, snapshot_after);
        // Dry run never creates the quarantine tenant.
        assert!(report.quarantine_tenant_id.is_none());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P');
                INSERT INTO channels (tenant_id, name) VALUES (NULL, 'general');
                "#,
            )
            .unwrap();
        }

        let engine = engine(&db_path, true);
        let first = engine.run(BackfillMode::Apply, None).await.unwrap();
        assert_eq!(first.total_updated(), 1);
        assert_eq!(first.total_quarantined(), 1);

        let second = engine.run(BackfillMode::Apply, None).await.unwrap();
        assert_eq!(second.total_updated(), 0);
        assert_eq!(second.total_quarantined(), 0);
    }

    #[tokio::test]
    async fn test_platform_admins_never_quarantined() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "INSERT INTO users (tenant_id, email, is_platform_admin) VALUES (NULL, 'root@worklane.io', 1);",
            )
            .unwrap();
        }

        let report = engine(&db_path, true)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap();
        assert_eq!(report.quarantined.get("users"), Some(&0));
        assert_eq!(tenant_of(&db_path, "users", 1), None);
    }

    #[tokio::test]
    async fn test_parent_backfilled_before_child_in_same_run() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');                     -- id 1
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P');   -- id 1
                INSERT INTO tasks (tenant_id, project_id, title) VALUES (NULL, 1, 'T');    -- id 1
                "#,
            )
            .unwrap();
        }

        let engine = engine(&db_path, true);

        // Dry run evaluates against current data, so the task is predicted
        // unresolved until the project is actually written.
        let dry = engine.run(BackfillMode::DryRun, None).await.unwrap();
        assert_eq!(dry.updated.get("projects"), Some(&1));
        assert_eq!(dry.quarantined.get("tasks"), Some(&1));

        // Projects precede tasks in the registry, so the task resolves
        // through its freshly backfilled parent within one run.
        let report = engine.run(BackfillMode::Apply, None).await.unwrap();
        assert_eq!(report.updated.get("projects"), Some(&1));
        assert_eq!(report.updated.get("tasks"), Some(&1));
        assert_eq!(tenant_of(&db_path, "tasks", 1), Some(1));
    }

    #[tokio::test]
    async fn test_failed_table_does_not_lose_quarantine_tenant() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO channels (tenant_id, name) VALUES (NULL, 'general');          -- id 1
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, NULL, 'P'); -- id 1
                CREATE TRIGGER channels_block BEFORE UPDATE ON channels
                BEGIN SELECT RAISE(ABORT, 'channels update rejected'); END;
                "#,
            )
            .unwrap();
        }

        let engine = engine(&db_path, true);
        let report = engine.run(BackfillMode::Apply, None).await.unwrap();

        // The channels transaction rolled back and is reported per table.
        assert!(report.errors.contains_key("channels"));
        assert_eq!(tenant_of(&db_path, "channels", 1), None);

        // The tenant row created for the run survives the rollback, so the
        // project routed afterwards points at a live tenant.
        let q = report.quarantine_tenant_id.unwrap();
        assert_eq!(report.quarantined.get("projects"), Some(&1));
        assert_eq!(tenant_of(&db_path, "projects", 1), Some(q));
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let live: i64 = conn
            .query_row("SELECT COUNT(*) FROM tenants WHERE id = ?1", [q], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(live, 1);

        // Once the failure is cleared, a re-run routes the channel to the
        // same tenant instead of minting a new one.
        conn.execute_batch("DROP TRIGGER channels_block;").unwrap();
        let second = engine.run(BackfillMode::Apply, None).await.unwrap();
        assert_eq!(second.quarantine_tenant_id, Some(q));
        assert_eq!(tenant_of(&db_path, "channels", 1), Some(q));
    }

    #[tokio::test]
    async fn test_schema_drift_recorded_per_table() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                DROP TABLE channels;
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P');
                "#,
            )
            .unwrap();
        }

        let report = engine(&db_path, true)
            .run(BackfillMode::Apply, None)
            .await
            .unwrap();

        assert!(report.errors.get("channels").unwrap().contains("schema drift"));
        assert_eq!(report.updated.get("channels"), Some(&0));
        assert_eq!(report.quarantined.get("channels"), Some(&0));
        // The remaining tables still ran.
        assert_eq!(report.updated.get("projects"), Some(&1));
    }

    #[tokio::test]
    async fn test_infer_tenant_previews_decision() {
        let (_dir, db_path) = setup();
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO clients (tenant_id, name) VALUES (1, 'C');                      -- id 1
                INSERT INTO projects (tenant_id, client_id, name) VALUES (NULL, 1, 'P');    -- id 1
                INSERT INTO channels (tenant_id, name) VALUES (NULL, 'general');            -- id 1
                INSERT INTO tasks (tenant_id, project_id, title) VALUES (1, NULL, 'T');     -- id 1
                INSERT INTO users (tenant_id, email) VALUES (2, 'u@t2.io');                 -- id 1
                INSERT INTO time_entries (tenant_id, task_id, user_id, minutes) VALUES (NULL, 1, 1, 10);
                "#,
            )
            .unwrap();
        }

        // Inference is read-only, so the apply flag is irrelevant.
        let engine = engine(&db_path, false);

        assert_eq!(engine.infer_tenant("projects", 1).await.unwrap(), Some(1));
        assert_eq!(engine.infer_tenant("channels", 1).await.unwrap(), None);
        assert!(matches!(
            engine.infer_tenant("time_entries", 1).await.unwrap_err(),
            TenancyError::Ambiguous(_)
        ));
        assert!(matches!(
            engine.infer_tenant("projects", 404).await.unwrap_err(),
            TenancyError::NotFound(_)
        ));
        assert!(matches!(
            engine.infer_tenant("clients", 1).await.unwrap_err(),
            TenancyError::InvalidState(_)
        ));

        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch("DROP TABLE channels;").unwrap();
        }
        assert!(matches!(
            engine.infer_tenant("channels", 1).await.unwrap_err(),
            TenancyError::SchemaDrift(_)
        ));
    }

    fn row_tenant_snapshot(db_path: &str) -> Vec<(String, i64, Option<i64>)> {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        let mut snapshot = Vec::new();
        for table in ["users", "clients", "channels", "projects", "tasks", "time_entries", "messages"] {
            let mut stmt = conn
                .prepare(&format!("SELECT id, tenant_id FROM {} ORDER BY id", table))
                .unwrap();
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)))
                .unwrap();
            for row in rows {
                let (id, tenant) = row.unwrap();
                snapshot.push((table.to_string(), id, tenant));
            }
        }
        snapshot
    }
}

//! Declarative catalog of tenant-scoped tables.
//!
//! The registry is the single place where a table's tenant column, its
//! foreign-key inference paths and its remediation affordances are declared.
//! Declaration order is stable, so scan and backfill output is reproducible
//! across runs.

/// A foreign-key inference path: `column` on the declaring table references
/// `parent_table.id`, and the parent's tenant association is the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FkPath {
    /// Column on the declaring table holding the parent row id
    pub column: &'static str,
    /// Table the column points at
    pub parent_table: &'static str,
}

/// Declaration of one tenant-scoped table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    /// Table name
    pub name: &'static str,
    /// Column holding the tenant association
    pub tenant_column: &'static str,
    /// Column shown in quarantine listings
    pub display_column: &'static str,
    /// Columns matched by quarantine catalog search
    pub search_columns: &'static [&'static str],
    /// Ordered inference paths; empty means the table is a root
    pub fk_paths: &'static [FkPath],
    /// Extra predicate excluding platform-level sentinel rows from scans
    pub platform_filter: Option<&'static str>,
    /// Soft-disable flag column for archivable (user-like) tables
    pub archive_flag: Option<&'static str>,
}

impl TableSpec {
    /// Root tables carry their tenant association directly and are never
    /// inferred.
    pub fn is_root(&self) -> bool {
        self.fk_paths.is_empty()
    }
}

/// An ownership edge in the cascade-delete graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnsEdge {
    /// Child table
    pub child_table: &'static str,
    /// Column on the child referencing the owning row
    pub child_column: &'static str,
}

/// Catalog of tenant-scoped tables and their inference paths.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: Vec<TableSpec>,
}

static USERS_PATHS: &[FkPath] = &[];
static CLIENTS_PATHS: &[FkPath] = &[];
static CHANNELS_PATHS: &[FkPath] = &[];
static PROJECTS_PATHS: &[FkPath] = &[FkPath {
    column: "client_id",
    parent_table: "clients",
}];
static TASKS_PATHS: &[FkPath] = &[FkPath {
    column: "project_id",
    parent_table: "projects",
}];
static TIME_ENTRIES_PATHS: &[FkPath] = &[
    FkPath {
        column: "task_id",
        parent_table: "tasks",
    },
    FkPath {
        column: "user_id",
        parent_table: "users",
    },
];
static MESSAGES_PATHS: &[FkPath] = &[
    FkPath {
        column: "channel_id",
        parent_table: "channels",
    },
    FkPath {
        column: "sender_id",
        parent_table: "users",
    },
];

impl TableRegistry {
    /// Registry covering the Worklane application tables.
    ///
    /// Order matters: parents are declared before children so backfill can
    /// propagate tenant ids down the ownership graph in a single pass.
    pub fn worklane() -> Self {
        Self {
            tables: vec![
                TableSpec {
                    name: "users",
                    tenant_column: "tenant_id",
                    display_column: "display_name",
                    search_columns: &["display_name", "email"],
                    fk_paths: USERS_PATHS,
                    platform_filter: Some("is_platform_admin = 0"),
                    archive_flag: Some("is_active"),
                },
                TableSpec {
                    name: "clients",
                    tenant_column: "tenant_id",
                    display_column: "name",
                    search_columns: &["name"],
                    fk_paths: CLIENTS_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
                TableSpec {
                    name: "channels",
                    tenant_column: "tenant_id",
                    display_column: "name",
                    search_columns: &["name"],
                    fk_paths: CHANNELS_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
                TableSpec {
                    name: "projects",
                    tenant_column: "tenant_id",
                    display_column: "name",
                    search_columns: &["name"],
                    fk_paths: PROJECTS_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
                TableSpec {
                    name: "tasks",
                    tenant_column: "tenant_id",
                    display_column: "title",
                    search_columns: &["title"],
                    fk_paths: TASKS_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
                TableSpec {
                    name: "time_entries",
                    tenant_column: "tenant_id",
                    display_column: "created_at",
                    search_columns: &[],
                    fk_paths: TIME_ENTRIES_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
                TableSpec {
                    name: "messages",
                    tenant_column: "tenant_id",
                    display_column: "body",
                    search_columns: &["body"],
                    fk_paths: MESSAGES_PATHS,
                    platform_filter: None,
                    archive_flag: None,
                },
            ],
        }
    }

    /// Build a registry from explicit specs (test and embedding use).
    pub fn from_specs(tables: Vec<TableSpec>) -> Self {
        Self { tables }
    }

    /// Look up a table declaration by name.
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter()
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Ownership edges out of `parent`: every declared FK path doubles as an
    /// "owns" edge, so a table added to the registry is automatically part
    /// of cascade cleanup.
    pub fn children_of(&self, parent: &str) -> Vec<OwnsEdge> {
        let mut edges = Vec::new();
        for spec in &self.tables {
            for path in spec.fk_paths {
                if path.parent_table == parent {
                    edges.push(OwnsEdge {
                        child_table: spec.name,
                        child_column: path.column,
                    });
                }
            }
        }
        edges
    }
}

//! Schema manager
//!
//! Creates the six tables and their indexes if absent, then verifies what the
//! database actually has against the expected layout. Column problems are
//! fatal. Index drift only produces warnings with the SQL that would fix it;
//! nothing is migrated automatically.

use sqlx::mysql::MySqlDatabaseError;
use sqlx::MySqlPool;
use std::collections::BTreeMap;

use session_core::error::{Result, SessionError};

use crate::sql::{
    TableNames, TABLE_APP_STATES, TABLE_SESSION_EVENTS, TABLE_SESSION_STATES, TABLE_SESSION_SUMMARIES,
    TABLE_SESSION_TRACK_EVENTS, TABLE_USER_STATES,
};

/// MySQL "Duplicate key name".
const ER_DUP_KEYNAME: u16 = 1061;

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub data_type: &'static str,
    pub nullable: bool,
    pub ddl: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexColumn {
    pub name: &'static str,
    /// Key prefix length, for columns too wide for a utf8mb4 index.
    pub prefix: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub suffix: &'static str,
    pub unique: bool,
    pub columns: &'static [IndexColumn],
}

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub base: &'static str,
    pub columns: &'static [ColumnSpec],
    pub indexes: &'static [IndexSpec],
}

const fn col(name: &'static str, data_type: &'static str, nullable: bool, ddl: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        data_type,
        nullable,
        ddl,
    }
}

const fn ic(name: &'static str) -> IndexColumn {
    IndexColumn { name, prefix: None }
}

const fn ic191(name: &'static str) -> IndexColumn {
    IndexColumn {
        name,
        prefix: Some(191),
    }
}

const ID: ColumnSpec = col("id", "bigint", false, "`id` BIGINT NOT NULL AUTO_INCREMENT");
const APP_NAME: ColumnSpec = col("app_name", "varchar", false, "`app_name` VARCHAR(255) NOT NULL");
const USER_ID: ColumnSpec = col("user_id", "varchar", false, "`user_id` VARCHAR(255) NOT NULL");
const SESSION_ID: ColumnSpec = col("session_id", "varchar", false, "`session_id` VARCHAR(255) NOT NULL");
const CREATED_AT: ColumnSpec = col(
    "created_at",
    "timestamp",
    false,
    "`created_at` TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)",
);
const UPDATED_AT: ColumnSpec = col(
    "updated_at",
    "timestamp",
    false,
    "`updated_at` TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)",
);
const EXPIRES_AT: ColumnSpec = col("expires_at", "timestamp", true, "`expires_at` TIMESTAMP(6) NULL DEFAULT NULL");
const DELETED_AT: ColumnSpec = col("deleted_at", "timestamp", true, "`deleted_at` TIMESTAMP(6) NULL DEFAULT NULL");
const EVENT: ColumnSpec = col("event", "json", false, "`event` JSON NOT NULL");
const KEY: ColumnSpec = col("key", "varchar", false, "`key` VARCHAR(255) NOT NULL");
const VALUE: ColumnSpec = col("value", "text", true, "`value` TEXT NULL");

const EXPIRES_INDEX: IndexSpec = IndexSpec {
    suffix: "expires",
    unique: false,
    columns: &[ic("expires_at")],
};

const EVENT_LOOKUP_INDEX: IndexSpec = IndexSpec {
    suffix: "lookup",
    unique: false,
    columns: &[ic("app_name"), ic("user_id"), ic("session_id"), ic("created_at")],
};

pub static TABLE_SPECS: [TableSpec; 6] = [
    TableSpec {
        base: TABLE_SESSION_STATES,
        columns: &[
            ID,
            APP_NAME,
            USER_ID,
            SESSION_ID,
            col("state", "json", true, "`state` JSON DEFAULT NULL"),
            CREATED_AT,
            UPDATED_AT,
            EXPIRES_AT,
            DELETED_AT,
        ],
        indexes: &[
            IndexSpec {
                suffix: "unique_active",
                unique: true,
                columns: &[ic("app_name"), ic("user_id"), ic("session_id"), ic("deleted_at")],
            },
            EXPIRES_INDEX,
        ],
    },
    TableSpec {
        base: TABLE_SESSION_EVENTS,
        columns: &[
            ID, APP_NAME, USER_ID, SESSION_ID, EVENT, CREATED_AT, UPDATED_AT, EXPIRES_AT, DELETED_AT,
        ],
        indexes: &[EVENT_LOOKUP_INDEX, EXPIRES_INDEX],
    },
    TableSpec {
        base: TABLE_SESSION_TRACK_EVENTS,
        columns: &[
            ID,
            APP_NAME,
            USER_ID,
            SESSION_ID,
            col("track", "varchar", false, "`track` VARCHAR(255) NOT NULL"),
            EVENT,
            CREATED_AT,
            UPDATED_AT,
            EXPIRES_AT,
            DELETED_AT,
        ],
        indexes: &[EVENT_LOOKUP_INDEX, EXPIRES_INDEX],
    },
    TableSpec {
        base: TABLE_SESSION_SUMMARIES,
        columns: &[
            ID,
            APP_NAME,
            USER_ID,
            SESSION_ID,
            col("filter_key", "varchar", false, "`filter_key` VARCHAR(255) NOT NULL DEFAULT ''"),
            col("summary", "json", true, "`summary` JSON NULL"),
            UPDATED_AT,
            EXPIRES_AT,
            DELETED_AT,
        ],
        indexes: &[
            // Excludes deleted_at: one row per filter key, tombstoned or not.
            IndexSpec {
                suffix: "unique_active",
                unique: true,
                columns: &[
                    ic191("app_name"),
                    ic191("user_id"),
                    ic191("session_id"),
                    ic191("filter_key"),
                ],
            },
            EXPIRES_INDEX,
        ],
    },
    TableSpec {
        base: TABLE_APP_STATES,
        columns: &[ID, APP_NAME, KEY, VALUE, CREATED_AT, UPDATED_AT, EXPIRES_AT, DELETED_AT],
        indexes: &[
            IndexSpec {
                suffix: "unique_active",
                unique: true,
                columns: &[ic("app_name"), ic("key"), ic("deleted_at")],
            },
            EXPIRES_INDEX,
        ],
    },
    TableSpec {
        base: TABLE_USER_STATES,
        columns: &[
            ID, APP_NAME, USER_ID, KEY, VALUE, CREATED_AT, UPDATED_AT, EXPIRES_AT, DELETED_AT,
        ],
        indexes: &[
            IndexSpec {
                suffix: "unique_active",
                unique: true,
                columns: &[ic("app_name"), ic("user_id"), ic("key"), ic("deleted_at")],
            },
            EXPIRES_INDEX,
        ],
    },
];

// ============================================================================
// DDL
// ============================================================================

pub fn create_table_sql(tables: &TableNames, spec: &TableSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| format!("  {}", c.ddl))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS `{}` (\n{columns},\n  PRIMARY KEY (`id`)\n) \
         ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
        tables.full(spec.base)
    )
}

fn index_columns_sql(index: &IndexSpec) -> String {
    index
        .columns
        .iter()
        .map(|c| match c.prefix {
            Some(len) => format!("`{}`({len})", c.name),
            None => format!("`{}`", c.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_index_sql(tables: &TableNames, spec: &TableSpec, index: &IndexSpec) -> String {
    format!(
        "CREATE {}INDEX `{}` ON `{}` ({})",
        if index.unique { "UNIQUE " } else { "" },
        tables.index_name(spec.base, index.suffix),
        tables.full(spec.base),
        index_columns_sql(index)
    )
}

pub fn drop_index_sql(table: &str, index_name: &str) -> String {
    format!("DROP INDEX `{index_name}` ON `{table}`")
}

fn is_duplicate_key_name(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| e.number() == ER_DUP_KEYNAME),
        _ => false,
    }
}

/// Create missing tables and indexes, then verify.
pub async fn init_schema(pool: &MySqlPool, tables: &TableNames) -> Result<SchemaReport> {
    for spec in &TABLE_SPECS {
        sqlx::query(&create_table_sql(tables, spec))
            .execute(pool)
            .await
            .map_err(|e| SessionError::db(format!("create table {}", tables.full(spec.base)), e))?;

        for index in spec.indexes {
            match sqlx::query(&create_index_sql(tables, spec, index)).execute(pool).await {
                Ok(_) => {}
                Err(e) if is_duplicate_key_name(&e) => {}
                Err(e) => {
                    return Err(SessionError::db(
                        format!("create index {}", tables.index_name(spec.base, index.suffix)),
                        e,
                    ))
                }
            }
        }
    }
    tracing::info!(prefix = tables.prefix(), "session store schema ready");
    verify_schema(pool, tables).await
}

// ============================================================================
// VERIFY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualIndexColumn {
    pub name: String,
    pub sub_part: Option<i64>,
}

/// Index warnings and the SQL that would resolve them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl SchemaReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn merge(&mut self, other: SchemaReport) {
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
    }
}

pub async fn verify_schema(pool: &MySqlPool, tables: &TableNames) -> Result<SchemaReport> {
    let mut report = SchemaReport::default();
    for spec in &TABLE_SPECS {
        let table = tables.full(spec.base);
        let exists: Option<(String,)> = sqlx::query_as(
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(&table)
        .fetch_optional(pool)
        .await
        .map_err(|e| SessionError::db("read information_schema.tables", e))?;
        if exists.is_none() {
            return Err(SessionError::Schema(format!("table {table} does not exist")));
        }

        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(DATA_TYPE AS CHAR), CAST(IS_NULLABLE AS CHAR) \
             FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(&table)
        .fetch_all(pool)
        .await
        .map_err(|e| SessionError::db("read information_schema.columns", e))?;
        let columns: Vec<ActualColumn> = columns
            .into_iter()
            .map(|(name, data_type, nullable)| ActualColumn {
                name,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
            })
            .collect();
        let problems = diff_columns(&table, spec, &columns);
        if !problems.is_empty() {
            return Err(SessionError::Schema(problems.join("; ")));
        }

        let rows: Vec<(String, String, Option<i64>)> = sqlx::query_as(
            "SELECT CAST(INDEX_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), CAST(SUB_PART AS SIGNED) \
             FROM information_schema.statistics WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(&table)
        .fetch_all(pool)
        .await
        .map_err(|e| SessionError::db("read information_schema.statistics", e))?;
        let mut indexes: BTreeMap<String, Vec<ActualIndexColumn>> = BTreeMap::new();
        for (index, column, sub_part) in rows {
            indexes.entry(index).or_default().push(ActualIndexColumn {
                name: column,
                sub_part,
            });
        }
        report.merge(diff_indexes(tables, spec, &indexes));
    }

    for warning in &report.warnings {
        tracing::warn!(%warning, "schema divergence");
    }
    for sql in &report.suggestions {
        tracing::warn!(%sql, "suggested schema fix");
    }
    Ok(report)
}

/// Missing columns and type or nullability mismatches. All are fatal.
pub fn diff_columns(table: &str, spec: &TableSpec, actual: &[ActualColumn]) -> Vec<String> {
    let mut problems = Vec::new();
    for expected in spec.columns {
        let Some(found) = actual.iter().find(|c| c.name.eq_ignore_ascii_case(expected.name)) else {
            problems.push(format!("{table}.{} is missing", expected.name));
            continue;
        };
        if !found.data_type.eq_ignore_ascii_case(expected.data_type) {
            problems.push(format!(
                "{table}.{} has type {}, expected {}",
                expected.name, found.data_type, expected.data_type
            ));
        }
        if found.nullable != expected.nullable {
            problems.push(format!(
                "{table}.{} nullable={}, expected nullable={}",
                expected.name, found.nullable, expected.nullable
            ));
        }
    }
    problems
}

fn same_index_columns(expected: &IndexSpec, actual: &[ActualIndexColumn]) -> bool {
    expected.columns.len() == actual.len()
        && expected.columns.iter().zip(actual).all(|(e, a)| {
            e.name.eq_ignore_ascii_case(&a.name)
                && match (e.prefix, a.sub_part) {
                    (_, None) => true,
                    (Some(len), Some(sub)) => i64::from(len) == sub,
                    (None, Some(_)) => false,
                }
        })
}

/// Compare indexes by name and column list. Never fatal.
pub fn diff_indexes(
    tables: &TableNames,
    spec: &TableSpec,
    actual: &BTreeMap<String, Vec<ActualIndexColumn>>,
) -> SchemaReport {
    let table = tables.full(spec.base);
    let mut report = SchemaReport::default();
    let mut expected_names = Vec::with_capacity(spec.indexes.len());

    for index in spec.indexes {
        let name = tables.index_name(spec.base, index.suffix);
        match actual.iter().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            None => {
                report.warnings.push(format!("index {name} on {table} is missing"));
                report.suggestions.push(create_index_sql(tables, spec, index));
            }
            Some((_, columns)) if !same_index_columns(index, columns) => {
                let found: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                report.warnings.push(format!(
                    "index {name} on {table} has columns ({}), expected ({})",
                    found.join(", "),
                    index_columns_sql(index).replace('`', "")
                ));
                report.suggestions.push(drop_index_sql(&table, &name));
                report.suggestions.push(create_index_sql(tables, spec, index));
            }
            Some(_) => {}
        }
        expected_names.push(name);
    }

    for name in actual.keys() {
        if name.eq_ignore_ascii_case("PRIMARY") || expected_names.iter().any(|e| e.eq_ignore_ascii_case(name)) {
            continue;
        }
        report.warnings.push(format!("unexpected index {name} on {table}"));
        report.suggestions.push(drop_index_sql(&table, name));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(base: &str) -> &'static TableSpec {
        TABLE_SPECS.iter().find(|s| s.base == base).unwrap()
    }

    fn actual_columns(spec: &TableSpec) -> Vec<ActualColumn> {
        spec.columns
            .iter()
            .map(|c| ActualColumn {
                name: c.name.to_uppercase(),
                data_type: c.data_type.to_uppercase(),
                nullable: c.nullable,
            })
            .collect()
    }

    fn actual_indexes(tables: &TableNames, spec: &TableSpec) -> BTreeMap<String, Vec<ActualIndexColumn>> {
        let mut out = BTreeMap::new();
        out.insert(
            "PRIMARY".to_string(),
            vec![ActualIndexColumn {
                name: "id".into(),
                sub_part: None,
            }],
        );
        for index in spec.indexes {
            out.insert(
                tables.index_name(spec.base, index.suffix),
                index
                    .columns
                    .iter()
                    .map(|c| ActualIndexColumn {
                        name: c.name.to_string(),
                        sub_part: c.prefix.map(i64::from),
                    })
                    .collect(),
            );
        }
        out
    }

    #[test]
    fn test_create_table_sql() {
        let tables = TableNames::new("p_");
        let sql = create_table_sql(&tables, spec(TABLE_SESSION_STATES));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `p_session_states`"));
        assert!(sql.contains("`state` JSON DEFAULT NULL"));
        assert!(sql.contains("utf8mb4_unicode_ci"));
    }

    #[test]
    fn test_summary_index_uses_prefix_length() {
        let tables = TableNames::new("");
        let s = spec(TABLE_SESSION_SUMMARIES);
        let sql = create_index_sql(&tables, s, &s.indexes[0]);
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX `idx_session_summaries_unique_active` ON `session_summaries` \
             (`app_name`(191), `user_id`(191), `session_id`(191), `filter_key`(191))"
        );
    }

    #[test]
    fn test_matching_columns_are_clean() {
        let s = spec(TABLE_USER_STATES);
        assert!(diff_columns("user_states", s, &actual_columns(s)).is_empty());
    }

    #[test]
    fn test_column_divergence_is_reported() {
        let s = spec(TABLE_SESSION_EVENTS);
        let mut cols = actual_columns(s);
        cols.retain(|c| c.name != "EXPIRES_AT");
        if let Some(event) = cols.iter_mut().find(|c| c.name == "EVENT") {
            event.data_type = "longtext".into();
            event.nullable = true;
        }
        let problems = diff_columns("session_events", s, &cols);
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("expires_at is missing")));
    }

    #[test]
    fn test_matching_indexes_are_clean() {
        let tables = TableNames::new("x_");
        for s in &TABLE_SPECS {
            assert!(diff_indexes(&tables, s, &actual_indexes(&tables, s)).is_clean());
        }
    }

    #[test]
    fn test_summary_index_accepts_full_length() {
        let tables = TableNames::new("");
        let s = spec(TABLE_SESSION_SUMMARIES);
        let mut indexes = actual_indexes(&tables, s);
        for cols in indexes.values_mut() {
            for c in cols.iter_mut() {
                c.sub_part = None;
            }
        }
        assert!(diff_indexes(&tables, s, &indexes).is_clean());
    }

    #[test]
    fn test_index_divergence_suggests_sql() {
        let tables = TableNames::new("");
        let s = spec(TABLE_APP_STATES);
        let mut indexes = actual_indexes(&tables, s);
        indexes.remove("idx_app_states_expires");
        indexes.insert(
            "idx_app_states_unique_active".into(),
            vec![ActualIndexColumn {
                name: "app_name".into(),
                sub_part: None,
            }],
        );
        indexes.insert(
            "idx_extra".into(),
            vec![ActualIndexColumn {
                name: "value".into(),
                sub_part: Some(10),
            }],
        );

        let report = diff_indexes(&tables, s, &indexes);
        assert_eq!(report.warnings.len(), 3);
        assert!(report
            .suggestions
            .contains(&"CREATE INDEX `idx_app_states_expires` ON `app_states` (`expires_at`)".to_string()));
        assert!(report
            .suggestions
            .contains(&"DROP INDEX `idx_app_states_unique_active` ON `app_states`".to_string()));
        assert!(report
            .suggestions
            .contains(&"DROP INDEX `idx_extra` ON `app_states`".to_string()));
    }
}

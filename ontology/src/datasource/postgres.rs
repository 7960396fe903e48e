use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock as AsyncRwLock;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use tokio_util::sync::CancellationToken;

use super::{
    ColumnProfile, ColumnRef, DataSourceConfig, DatasourceError, DeclaredForeignKey, JoinStats,
    LiveColumn, LiveTable, QueryExecutor, TableProfile, TableRef,
};

/// Read-only PostgreSQL executor.
///
/// One upstream session is opened lazily and shared by every call; it is
/// re-opened if the server closes it. The session is pinned read-only with
/// a statement timeout so nothing issued through it can modify the datasource.
pub struct PostgresExecutor {
    cfg: DataSourceConfig,
    client: AsyncRwLock<Option<Arc<tokio_postgres::Client>>>,
}

type Param<'a> = &'a (dyn ToSql + Sync);

impl PostgresExecutor {
    pub fn new(cfg: DataSourceConfig) -> Self {
        Self {
            cfg,
            client: AsyncRwLock::new(None),
        }
    }

    /// Return the shared client, connecting on first use.
    async fn client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<tokio_postgres::Client>, DatasourceError> {
        {
            let guard = self.client.read().await;
            if let Some(ref c) = *guard
                && !c.is_closed()
            {
                return Ok(c.clone());
            }
        }

        let mut guard = self.client.write().await;
        if let Some(ref c) = *guard
            && !c.is_closed()
        {
            return Ok(c.clone());
        }

        let client = Arc::new(self.connect_with_cancel(cancel).await?);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn connect_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio_postgres::Client, DatasourceError> {
        let ssl_mode = match self.cfg.ssl_mode.as_str() {
            "disable" => "disable",
            "allow" | "prefer" => "prefer",
            _ => "require",
        };

        let conn_str = format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=30",
            self.cfg.host,
            self.cfg.port,
            self.cfg.database,
            self.cfg.username,
            self.cfg.password,
            ssl_mode,
        );

        let (client, connection) = tokio::select! {
            res = tokio_postgres::connect(&conn_str, NoTls) => {
                res.map_err(|e| DatasourceError::Connect(e.to_string()))?
            }
            _ = cancel.cancelled() => {
                return Err(DatasourceError::Cancelled);
            }
        };

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("Datasource connection error: {e}");
            }
        });

        // Introspection and sampling only: refuse writes and bound slow aggregates
        tokio::select! {
            res = client.batch_execute(
                "SET default_transaction_read_only = on; SET statement_timeout = '60s'",
            ) => {
                res.map_err(|e| DatasourceError::Connect(e.to_string()))?;
            }
            _ = cancel.cancelled() => {
                return Err(DatasourceError::Cancelled);
            }
        }

        tracing::debug!(host = %self.cfg.host, database = %self.cfg.database, "Opened read-only datasource session");
        Ok(client)
    }

    async fn query(
        &self,
        sql: &str,
        params: &[Param<'_>],
        cancel: &CancellationToken,
    ) -> Result<Vec<tokio_postgres::Row>, DatasourceError> {
        let client = self.client(cancel).await?;
        tokio::select! {
            res = client.query(sql, params) => res.map_err(|e| DatasourceError::Query(e.to_string())),
            _ = cancel.cancelled() => Err(DatasourceError::Cancelled),
        }
    }

    fn schema_param(&self) -> Vec<&str> {
        self.cfg.schemas.iter().map(|s| s.as_str()).collect()
    }
}

/// Quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_table(table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_ident(&table.schema_name),
        quote_ident(&table.table_name)
    )
}

/// SQL for the single aggregate join-overlap query of a candidate pair.
/// Both sides are compared as text so uuid/text pairs join.
pub(crate) fn join_stats_sql(source: &ColumnRef, target: &ColumnRef) -> String {
    let src = quote_ident(&source.column_name);
    let tgt = quote_ident(&target.column_name);
    let src_table = quote_table(&source.table);
    let tgt_table = quote_table(&target.table);
    format!(
        "WITH s AS (SELECT DISTINCT {src}::text AS v FROM {src_table} WHERE {src} IS NOT NULL), \
              t AS (SELECT DISTINCT {tgt}::text AS v FROM {tgt_table} WHERE {tgt} IS NOT NULL) \
         SELECT \
           (SELECT COUNT(*) FROM s)::bigint, \
           (SELECT COUNT(*) FROM t)::bigint, \
           (SELECT COUNT(*) FROM s JOIN t ON s.v = t.v)::bigint, \
           (SELECT COUNT(*) FROM s WHERE NOT EXISTS (SELECT 1 FROM t WHERE t.v = s.v))::bigint, \
           (SELECT COUNT(*) FROM t WHERE NOT EXISTS (SELECT 1 FROM s WHERE s.v = t.v))::bigint, \
           (SELECT COUNT({src}) FROM {src_table})::bigint, \
           (SELECT COUNT({tgt}) FROM {tgt_table})::bigint"
    )
}

#[async_trait::async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn list_tables(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LiveTable>, DatasourceError> {
        if self.cfg.schemas.is_empty() {
            return Ok(vec![]);
        }
        let schema_refs = self.schema_param();
        let schema_params: &[Param<'_>] = &[&schema_refs];

        let table_rows = self
            .query(
                "SELECT table_schema::text, table_name::text, table_type::text \
                 FROM information_schema.tables \
                 WHERE table_schema = ANY($1) \
                 ORDER BY table_schema, table_name",
                schema_params,
                cancel,
            )
            .await?;

        let mut tables: Vec<LiveTable> = table_rows
            .into_iter()
            .map(|row| {
                let raw_type: String = row.get(2);
                let table_type = match raw_type.as_str() {
                    "VIEW" => "VIEW",
                    _ => "TABLE",
                }
                .to_string();
                LiveTable {
                    table: TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                    table_type,
                    columns: Vec::new(),
                }
            })
            .collect();

        let column_rows = self
            .query(
                "SELECT table_schema::text, table_name::text, column_name::text, \
                 ordinal_position::int, \
                 CASE WHEN data_type = 'USER-DEFINED' THEN udt_name::text ELSE data_type::text END, \
                 is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = ANY($1) \
                 ORDER BY table_schema, table_name, ordinal_position",
                schema_params,
                cancel,
            )
            .await?;

        // (schema, table, column) -> (is_primary_key, is_unique)
        let constraint_rows = self
            .query(
                "SELECT tc.table_schema::text, tc.table_name::text, kcu.column_name::text, \
                 tc.constraint_type::text, \
                 COUNT(*) OVER (PARTITION BY tc.constraint_schema, tc.constraint_name)::bigint \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_schema = tc.constraint_schema \
                  AND kcu.constraint_name = tc.constraint_name \
                  AND kcu.table_schema = tc.table_schema \
                  AND kcu.table_name = tc.table_name \
                 WHERE tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') \
                   AND tc.table_schema = ANY($1)",
                schema_params,
                cancel,
            )
            .await?;

        let mut key_flags: HashMap<(String, String, String), (bool, bool)> = HashMap::new();
        for row in constraint_rows {
            let key = (row.get::<_, String>(0), row.get::<_, String>(1), row.get::<_, String>(2));
            let constraint_type: String = row.get(3);
            let width: i64 = row.get(4);
            let entry = key_flags.entry(key).or_insert((false, false));
            if constraint_type == "PRIMARY KEY" {
                entry.0 = true;
            }
            if width == 1 {
                entry.1 = true;
            }
        }

        let index: HashMap<(String, String), usize> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| ((t.table.schema_name.clone(), t.table.table_name.clone()), i))
            .collect();

        for row in column_rows {
            let schema_name: String = row.get(0);
            let table_name: String = row.get(1);
            let column_name: String = row.get(2);
            let Some(&i) = index.get(&(schema_name.clone(), table_name.clone())) else {
                continue;
            };
            let is_nullable: String = row.get(5);
            let (is_primary_key, is_unique) = key_flags
                .get(&(schema_name, table_name, column_name.clone()))
                .copied()
                .unwrap_or((false, false));
            tables[i].columns.push(LiveColumn {
                column_name,
                ordinal_position: row.get(3),
                data_type: row.get(4),
                is_nullable: is_nullable.eq_ignore_ascii_case("YES"),
                is_primary_key,
                is_unique,
            });
        }

        Ok(tables)
    }

    async fn table_profile(
        &self,
        table: &TableRef,
        columns: &[String],
        sample_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<TableProfile, DatasourceError> {
        let from = quote_table(table);

        let mut select = vec!["COUNT(*)::bigint".to_string()];
        for column in columns {
            let c = quote_ident(column);
            select.push(format!("COUNT(DISTINCT {c}::text)::bigint"));
            select.push(format!("(COUNT(*) - COUNT({c}))::bigint"));
        }
        let sql = format!("SELECT {} FROM {from}", select.join(", "));
        let rows = self.query(&sql, &[], cancel).await?;
        let row = rows
            .first()
            .ok_or_else(|| DatasourceError::Query(format!("no profile row for {}", table.qualified_name())))?;

        let row_count: i64 = row.get(0);
        let mut profiles = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            profiles.push(ColumnProfile {
                column_name: column.clone(),
                distinct_count: row.get(1 + i * 2),
                null_count: row.get(2 + i * 2),
                samples: Vec::new(),
            });
        }

        if sample_limit > 0 {
            for profile in &mut profiles {
                if cancel.is_cancelled() {
                    return Err(DatasourceError::Cancelled);
                }
                let column = ColumnRef {
                    table: table.clone(),
                    column_name: profile.column_name.clone(),
                };
                profile.samples = self.distinct_values(&column, sample_limit, cancel).await?;
            }
        }

        Ok(TableProfile {
            row_count,
            columns: profiles,
        })
    }

    async fn declared_foreign_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeclaredForeignKey>, DatasourceError> {
        let schema_refs = self.schema_param();
        let schema_params: &[Param<'_>] = &[&schema_refs];

        // Single-column constraints only; composite keys are not modelled as relationships
        let rows = self
            .query(
                "SELECT sn.nspname::text, sc.relname::text, sa.attname::text, \
                        tn.nspname::text, tc.relname::text, ta.attname::text \
                 FROM pg_constraint con \
                 JOIN pg_class sc ON sc.oid = con.conrelid \
                 JOIN pg_namespace sn ON sn.oid = sc.relnamespace \
                 JOIN pg_class tc ON tc.oid = con.confrelid \
                 JOIN pg_namespace tn ON tn.oid = tc.relnamespace \
                 JOIN pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = con.conkey[1] \
                 JOIN pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = con.confkey[1] \
                 WHERE con.contype = 'f' \
                   AND array_length(con.conkey, 1) = 1 \
                   AND sn.nspname = ANY($1) \
                 ORDER BY 1, 2, 3",
                schema_params,
                cancel,
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeclaredForeignKey {
                source: ColumnRef::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    row.get::<_, String>(2),
                ),
                target: ColumnRef::new(
                    row.get::<_, String>(3),
                    row.get::<_, String>(4),
                    row.get::<_, String>(5),
                ),
            })
            .collect())
    }

    async fn join_stats(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        cancel: &CancellationToken,
    ) -> Result<JoinStats, DatasourceError> {
        let sql = join_stats_sql(source, target);
        let rows = self.query(&sql, &[], cancel).await?;
        let row = rows.first().ok_or_else(|| {
            DatasourceError::Query(format!(
                "no join statistics for {} -> {}",
                source.qualified_name(),
                target.qualified_name()
            ))
        })?;

        Ok(JoinStats {
            source_distinct: row.get(0),
            target_distinct: row.get(1),
            matched_count: row.get(2),
            orphan_count: row.get(3),
            reverse_orphan_count: row.get(4),
            source_rows: row.get(5),
            target_rows: row.get(6),
        })
    }

    async fn distinct_values(
        &self,
        column: &ColumnRef,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DatasourceError> {
        let c = quote_ident(&column.column_name);
        let sql = format!(
            "SELECT DISTINCT {c}::text AS v FROM {} WHERE {c} IS NOT NULL ORDER BY v LIMIT $1",
            quote_table(&column.table)
        );
        let limit = limit as i64;
        let rows = self.query(&sql, &[&limit], cancel).await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn join_stats_sql_is_a_single_statement_over_both_tables() {
        let sql = join_stats_sql(
            &ColumnRef::new("public", "orders", "customer_id"),
            &ColumnRef::new("public", "customers", "id"),
        );
        assert!(sql.contains("\"public\".\"orders\""));
        assert!(sql.contains("\"public\".\"customers\""));
        assert!(sql.contains("\"customer_id\"::text"));
        assert!(!sql.contains(';'), "must be one statement");
        assert_eq!(sql.matches("SELECT COUNT(").count(), 7);
    }
}

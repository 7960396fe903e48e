//! Integration tests against a live PostgreSQL datasource
//!
//! Each test creates its own scratch schema, runs the engine against it with
//! an in-memory SQLite metadata store, and drops the schema afterwards.
//!
//! Prerequisites:
//! - PostgreSQL reachable at ONT_TEST_PG_HOST / ONT_TEST_PG_PORT
//!   (defaults 127.0.0.1:5432, user/password/db `postgres`)
//!
//! Run with: `cargo test -- --ignored`

use std::sync::Arc;

use migration::{Migrator, MigratorTrait};
use ontology::changes::{ChangeDetector, PendingChangeStore, SeaOrmChangeStore};
use ontology::config::AnalysisConfig;
use ontology::datasource::postgres::PostgresExecutor;
use ontology::datasource::{self, ColumnRef, DataSourceConfig, QueryExecutor, TableRef};
use ontology::dispatcher::Dispatcher;
use ontology::entity::{relationship, schema_column};
use ontology::model::{ChangeStatus, RunStatus};
use ontology::pipeline::stages::default_stages;
use ontology::pipeline::{Orchestrator, RunRegistry, Services};
use ontology::precedence::Writer;
use ontology::semantic::{
    CandidateUnit, ColumnAnnotation, ColumnContext, RelationshipVerdict, SemanticClient, SemanticError,
    TableContext, TableDescription,
};
use sea_orm::{Database, DatabaseConnection, EntityTrait};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const KEY: [u8; 32] = [9u8; 32];

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn pg_config(schema: &str) -> DataSourceConfig {
    DataSourceConfig {
        host: env_or("ONT_TEST_PG_HOST", "127.0.0.1"),
        port: env_or("ONT_TEST_PG_PORT", "5432").parse().expect("ONT_TEST_PG_PORT"),
        database: env_or("ONT_TEST_PG_DATABASE", "postgres"),
        username: env_or("ONT_TEST_PG_USER", "postgres"),
        password: env_or("ONT_TEST_PG_PASSWORD", "postgres"),
        ssl_mode: "disable".to_string(),
        schemas: vec![schema.to_string()],
    }
}

/// Admin connection used to create and drop the scratch schema.
async fn admin(cfg: &DataSourceConfig) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(
        &format!(
            "host={} port={} dbname={} user={} password={}",
            cfg.host, cfg.port, cfg.database, cfg.username, cfg.password
        ),
        NoTls,
    )
    .await
    .expect("Failed to connect to PostgreSQL");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

struct Scratch {
    schema: String,
    client: tokio_postgres::Client,
    cfg: DataSourceConfig,
}

impl Scratch {
    /// customers <- orders (declared FK), line_items.order_id (undeclared).
    async fn shop() -> Self {
        let schema = format!("ont_it_{}", Uuid::now_v7().simple());
        let cfg = pg_config(&schema);
        let client = admin(&cfg).await;
        client
            .batch_execute(&format!(
                r#"
                CREATE SCHEMA {s};
                CREATE TABLE {s}.customers (
                    id integer PRIMARY KEY,
                    email text UNIQUE NOT NULL,
                    status text NOT NULL
                );
                CREATE TABLE {s}.orders (
                    id integer PRIMARY KEY,
                    customer_id integer NOT NULL REFERENCES {s}.customers(id),
                    total numeric(10, 2)
                );
                CREATE TABLE {s}.line_items (
                    id integer PRIMARY KEY,
                    order_id integer NOT NULL,
                    quantity integer NOT NULL
                );
                INSERT INTO {s}.customers
                    SELECT g, 'c' || g || '@example.com', CASE WHEN g % 3 = 0 THEN 'inactive' ELSE 'active' END
                    FROM generate_series(1, 30) g;
                INSERT INTO {s}.orders
                    SELECT g, 1 + (g % 30), g * 1.5 FROM generate_series(1, 90) g;
                INSERT INTO {s}.line_items
                    SELECT g, 1 + (g % 90), 1 + (g % 4) FROM generate_series(1, 270) g;
                "#,
                s = schema
            ))
            .await
            .expect("Failed to create scratch schema");
        Self { schema, client, cfg }
    }

    fn executor(&self) -> Arc<dyn QueryExecutor> {
        Arc::new(PostgresExecutor::new(self.cfg.clone()))
    }

    fn table(&self, name: &str) -> TableRef {
        TableRef::new(self.schema.as_str(), name)
    }

    fn column(&self, table: &str, column: &str) -> ColumnRef {
        ColumnRef::new(self.schema.as_str(), table, column)
    }

    async fn teardown(self) {
        self.client
            .batch_execute(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .await
            .expect("Failed to drop scratch schema");
    }
}

/// Accepts every candidate as N:1 and names tables after themselves.
struct AcceptAll;

#[async_trait::async_trait]
impl SemanticClient for AcceptAll {
    async fn validate_relationship(&self, _unit: &CandidateUnit) -> Result<RelationshipVerdict, SemanticError> {
        Ok(RelationshipVerdict {
            is_valid_fk: true,
            confidence: 0.9,
            cardinality: Some("N:1".to_string()),
            reasoning: "values resolve".to_string(),
            source_role: None,
        })
    }

    async fn describe_table(&self, table: &TableContext) -> Result<TableDescription, SemanticError> {
        let name = table.qualified_name.rsplit('.').next().unwrap_or_default();
        Ok(TableDescription {
            entity_name: name.to_string(),
            description: format!("rows of {name}"),
            synonyms: Vec::new(),
        })
    }

    async fn enrich_column(&self, _column: &ColumnContext) -> Result<ColumnAnnotation, SemanticError> {
        Ok(ColumnAnnotation::default())
    }
}

async fn metadata_store() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_executor_introspection() {
    let scratch = Scratch::shop().await;
    let executor = scratch.executor();
    let cancel = CancellationToken::new();

    let tables = executor.list_tables(&cancel).await.unwrap();
    assert_eq!(tables.len(), 3);
    let customers = tables.iter().find(|t| t.table == scratch.table("customers")).unwrap();
    let email = customers.columns.iter().find(|c| c.column_name == "email").unwrap();
    assert!(email.is_unique && !email.is_primary_key);
    let id = customers.columns.iter().find(|c| c.column_name == "id").unwrap();
    assert!(id.is_primary_key && id.is_unique);

    let profile = executor
        .table_profile(&scratch.table("customers"), &["status".to_string()], 10, &cancel)
        .await
        .unwrap();
    assert_eq!(profile.row_count, 30);
    assert_eq!(profile.columns[0].distinct_count, 2);
    assert_eq!(profile.columns[0].null_count, 0);

    let fks = executor.declared_foreign_keys(&cancel).await.unwrap();
    assert_eq!(fks.len(), 1);
    assert_eq!(fks[0].source, scratch.column("orders", "customer_id"));
    assert_eq!(fks[0].target, scratch.column("customers", "id"));

    let stats = executor
        .join_stats(&scratch.column("line_items", "order_id"), &scratch.column("orders", "id"), &cancel)
        .await
        .unwrap();
    assert_eq!(stats.source_distinct, 90);
    assert_eq!(stats.matched_count, 90);
    assert_eq!(stats.orphan_count, 0);
    assert_eq!(stats.source_rows, 270);

    let values = executor
        .distinct_values(&scratch.column("customers", "status"), 10, &cancel)
        .await
        .unwrap();
    assert_eq!(values, vec!["active".to_string(), "inactive".to_string()]);

    scratch.teardown().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_cancelled_query_returns_promptly() {
    let scratch = Scratch::shop().await;
    let executor = scratch.executor();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = executor.list_tables(&cancel).await.unwrap_err();
    assert!(matches!(err, datasource::DatasourceError::Cancelled), "got {err:?}");

    scratch.teardown().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_build_then_scan_and_apply() {
    let scratch = Scratch::shop().await;
    let db = metadata_store().await;
    let project_id = Uuid::now_v7();
    let config = serde_json::json!({
        "host": scratch.cfg.host,
        "port": scratch.cfg.port,
        "database": scratch.cfg.database,
        "username": scratch.cfg.username,
        "password": scratch.cfg.password,
        "sslmode": "disable",
        "schemas": [scratch.schema],
    });
    let ds = datasource::register(&db, project_id, "shop", "postgres", config, &KEY)
        .await
        .unwrap();
    let executor: Arc<dyn QueryExecutor> =
        Arc::from(datasource::create_executor("postgres", DataSourceConfig::from_model(&ds, &KEY).unwrap()).unwrap());
    let semantic: Arc<dyn SemanticClient> = Arc::new(AcceptAll);

    // full build
    let services = Services {
        db: db.clone(),
        semantic: semantic.clone(),
        analysis: AnalysisConfig::default(),
        knowledge_seed_path: None,
    };
    let orchestrator = Orchestrator::new(default_stages(), Arc::new(RunRegistry::new())).unwrap();
    let outcome = orchestrator
        .run(services, executor.clone(), project_id, ds.clone(), Writer::inferred("pipeline"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed, "{outcome:?}");
    assert!(!outcome.degraded);

    // declared FK plus the inferred line_items.order_id -> orders.id
    let columns = schema_column::Entity::find().all(&db).await.unwrap();
    let column_name = |id: Uuid| {
        columns
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.column_name.clone())
            .unwrap_or_default()
    };
    let links: Vec<(String, String)> = relationship::Entity::find()
        .all(&db)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.is_accepted())
        .map(|r| (column_name(r.source_column_id), column_name(r.target_column_id)))
        .collect();
    assert!(links.contains(&("customer_id".to_string(), "id".to_string())), "{links:?}");
    assert!(links.contains(&("order_id".to_string(), "id".to_string())), "{links:?}");
    // quantity is a measure, so it never becomes a candidate source
    assert!(!links.iter().any(|(source, _)| source == "quantity"), "{links:?}");

    // drift: a new column on the live side
    scratch
        .client
        .batch_execute(&format!(
            "ALTER TABLE {}.orders ADD COLUMN channel text DEFAULT 'web'",
            scratch.schema
        ))
        .await
        .unwrap();

    let store: Arc<dyn PendingChangeStore> = Arc::new(SeaOrmChangeStore::new(db.clone()));
    let detector = ChangeDetector::new(db.clone(), executor.clone(), store.clone(), AnalysisConfig::default());
    let cancel = CancellationToken::new();
    let created = detector.scan_for_changes(project_id, ds.id, &cancel).await.unwrap();
    let new_column = created
        .iter()
        .find(|c| c.change_type == "new_column")
        .expect("new_column change");
    assert!(new_column.target.ends_with("orders.channel"));

    // rescanning reports nothing new
    assert!(detector.scan_for_changes(project_id, ds.id, &cancel).await.unwrap().is_empty());

    store.update_status(new_column.id, ChangeStatus::Approved, "alice").await.unwrap();
    let dispatcher = Dispatcher::new(
        db.clone(),
        executor,
        semantic,
        store.clone(),
        AnalysisConfig::default(),
        Writer::inferred("dispatcher"),
    );
    let summary = dispatcher.apply_approved(project_id, ds.id, &cancel).await.unwrap();
    assert_eq!(summary.failed, 0);
    assert!(summary.applied >= 1);

    let columns = schema_column::Entity::find().all(&db).await.unwrap();
    assert!(columns.iter().any(|c| c.column_name == "channel"));
    let resolved = store.get(new_column.id).await.unwrap().unwrap();
    assert!(resolved.resolved_at.is_some());

    scratch.teardown().await;
}

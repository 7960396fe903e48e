use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use migration::{Migrator, MigratorTrait};
use ontology::changes::{ChangeDetector, PendingChangeStore, SeaOrmChangeStore};
use ontology::config::{EngineConfig, redact_db_url};
use ontology::datasource::{self, DataSourceConfig, QueryExecutor};
use ontology::dispatcher::Dispatcher;
use ontology::entity::data_source;
use ontology::model::RunStatus;
use ontology::pipeline::run_store;
use ontology::pipeline::stages::default_stages;
use ontology::pipeline::{Orchestrator, RunEvent, RunRegistry, Services};
use ontology::precedence::Writer;
use ontology::semantic::SemanticClient;
use ontology::semantic::http::HttpSemanticClient;
use ontology::tools::Tools;
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "ontology", about = "Ontology extraction and maintenance engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and list monitored data sources
    Datasource {
        #[command(subcommand)]
        action: DatasourceAction,
    },
    /// Run a full ontology build (Ctrl-C cancels)
    Build(Target),
    /// Show the latest build and its stages
    Status(Target),
    /// Compare the live schema with the stored snapshot and record changes
    Scan(Target),
    /// Review detected changes
    Changes {
        #[command(subcommand)]
        action: ChangesAction,
    },
    /// Apply approved changes incrementally
    Apply(Target),
    /// Print a fresh ONT_ENCRYPTION_KEY
    Keygen,
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    project: Uuid,
    /// Data source name
    #[arg(long)]
    datasource: String,
}

#[derive(Subcommand)]
enum DatasourceAction {
    /// Register a data source
    Add {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long = "type", default_value = "postgres")]
        ds_type: String,
        /// Connection settings as JSON: host, port, database, username, password
        /// and optionally sslmode and schemas
        #[arg(long)]
        config: String,
    },
    List {
        #[arg(long)]
        project: Uuid,
    },
}

#[derive(Subcommand)]
enum ChangesAction {
    /// Pending changes, oldest first
    List {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        datasource: Option<String>,
    },
    Approve {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reviewer: String,
    },
    Reject {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reviewer: String,
    },
}

#[tokio::main]
async fn main() -> CliResult {
    // Init structured logging (respects RUST_LOG; defaults to info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Commands::Keygen = cli.command {
        let key = ontology::crypto::random_key();
        println!("{}", key.iter().map(|b| format!("{b:02x}")).collect::<String>());
        return Ok(());
    }

    let cfg = EngineConfig::from_env()?;

    tracing::info!(database = %redact_db_url(&cfg.database_url), "connecting to database");

    let db = Database::connect(&cfg.database_url).await?;
    Migrator::up(&db, None).await?;

    tracing::info!("database initialized");

    match cli.command {
        Commands::Datasource { action } => handle_datasource_action(&db, &cfg, action).await,
        Commands::Build(target) => build(&db, &cfg, target).await,
        Commands::Status(target) => status(&db, target).await,
        Commands::Scan(target) => scan(&db, &cfg, target).await,
        Commands::Changes { action } => handle_changes_action(&db, action).await,
        Commands::Apply(target) => apply(&db, &cfg, target).await,
        Commands::Keygen => Ok(()),
    }
}

/// A token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

fn connect(
    ds: &data_source::Model,
    cfg: &EngineConfig,
) -> Result<Arc<dyn QueryExecutor>, Box<dyn std::error::Error>> {
    let key = cfg.require_encryption_key()?;
    let ds_cfg = DataSourceConfig::from_model(ds, &key)?;
    Ok(Arc::from(datasource::create_executor(&ds.ds_type, ds_cfg)?))
}

fn semantic_client(cfg: &EngineConfig) -> Result<Arc<dyn SemanticClient>, Box<dyn std::error::Error>> {
    Ok(Arc::new(HttpSemanticClient::new(cfg.llm.clone())?))
}

async fn handle_datasource_action(db: &DatabaseConnection, cfg: &EngineConfig, action: DatasourceAction) -> CliResult {
    match action {
        DatasourceAction::Add {
            project,
            name,
            ds_type,
            config,
        } => {
            let key = cfg.require_encryption_key()?;
            let config: serde_json::Value = serde_json::from_str(&config)?;
            let ds = datasource::register(db, project, &name, &ds_type, config, &key).await?;
            tracing::info!(data_source_id = %ds.id, project_id = %project, name = %name, "registered data source");
            println!("{}", ds.id);
        }
        DatasourceAction::List { project } => {
            let sources = data_source::Entity::find()
                .filter(data_source::Column::ProjectId.eq(project))
                .order_by_asc(data_source::Column::Name)
                .all(db)
                .await?;
            for ds in sources {
                let last_build = ds
                    .last_build_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("{}  {:<24} {:<10} last build: {}", ds.id, ds.name, ds.ds_type, last_build);
            }
        }
    }
    Ok(())
}

async fn build(db: &DatabaseConnection, cfg: &EngineConfig, target: Target) -> CliResult {
    let ds = datasource::find_by_name(db, target.project, &target.datasource).await?;
    let executor = connect(&ds, cfg)?;
    let services = Services {
        db: db.clone(),
        semantic: semantic_client(cfg)?,
        analysis: cfg.analysis.clone(),
        knowledge_seed_path: cfg.knowledge_seed_path.clone(),
    };
    let registry = Arc::new(RunRegistry::new());
    let orchestrator = Orchestrator::new(default_stages(), registry.clone())?;

    let data_source_id = ds.id;
    let project_id = target.project;
    let run = tokio::spawn(async move {
        orchestrator
            .run(services, executor, project_id, ds, Writer::inferred("pipeline"))
            .await
    });

    // Wait for the run to register; it may also fail before that (conflict).
    let handle = loop {
        if let Some(handle) = registry.active_for(data_source_id) {
            break Some(handle);
        }
        if run.is_finished() {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    if let Some(handle) = handle {
        let run_id = handle.run_id;
        let mut events = BroadcastStream::new(handle.tx.subscribe());
        drop(handle);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;
        loop {
            tokio::select! {
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    tracing::warn!(run_id = %run_id, "interrupt received, cancelling build");
                    registry.cancel(run_id);
                }
                event = events.next() => match event {
                    Some(Ok(RunEvent::Finished { .. })) | None => break,
                    Some(Ok(event)) => print_event(&event),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::debug!(skipped, "progress events dropped");
                    }
                },
            }
        }
    }

    let outcome = run.await??;
    let degraded = if outcome.degraded { " (degraded)" } else { "" };
    println!("run {}: {}{}", outcome.run_id, outcome.status.as_str(), degraded);
    if outcome.status == RunStatus::Failed {
        let stage = outcome.failed_stage.map(|s| s.as_str()).unwrap_or("-");
        let error = outcome.error.unwrap_or_default();
        return Err(format!("build failed at {stage}: {error}").into());
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StageStarted { stage } => println!("{:<26} started", stage.as_str()),
        RunEvent::Progress {
            stage,
            done,
            total,
            message,
        } => println!(
            "{:<26} {done}/{total} {}",
            stage.as_str(),
            message.as_deref().unwrap_or("")
        ),
        RunEvent::StageFinished { stage, status, error } => match error {
            Some(error) => println!("{:<26} {status}: {error}", stage.as_str()),
            None => println!("{:<26} {status}", stage.as_str()),
        },
        RunEvent::Finished { .. } => {}
    }
}

async fn status(db: &DatabaseConnection, target: Target) -> CliResult {
    let ds = datasource::find_by_name(db, target.project, &target.datasource).await?;
    let Some(view) = run_store::latest_run(db, ds.id).await? else {
        println!("no builds for {}", ds.name);
        return Ok(());
    };
    let run = &view.run;
    println!(
        "run {} {}{} started {}",
        run.id,
        run.status,
        if run.degraded { " (degraded)" } else { "" },
        run.started_at
    );
    if let Some(error) = &run.error {
        println!("  error: {error}");
    }
    for stage in &view.stages {
        println!(
            "  {:<26} {:<10} {}/{} {}",
            stage.stage,
            stage.status,
            stage.done,
            stage.total,
            stage.error.as_deref().or(stage.message.as_deref()).unwrap_or("")
        );
    }
    Ok(())
}

async fn scan(db: &DatabaseConnection, cfg: &EngineConfig, target: Target) -> CliResult {
    let ds = datasource::find_by_name(db, target.project, &target.datasource).await?;
    let executor = connect(&ds, cfg)?;
    let store: Arc<dyn PendingChangeStore> = Arc::new(SeaOrmChangeStore::new(db.clone()));
    let detector = ChangeDetector::new(db.clone(), executor, store, cfg.analysis.clone());
    let cancel = cancel_on_ctrl_c();

    let created = detector.scan_for_changes(target.project, ds.id, &cancel).await?;
    tracing::info!(data_source_id = %ds.id, changes = created.len(), "scan finished");
    for change in &created {
        println!("{}  {:<20} {:<10} {}", change.id, change.change_type, change.status, change.target);
    }
    println!("{} new change(s)", created.len());
    Ok(())
}

async fn handle_changes_action(db: &DatabaseConnection, action: ChangesAction) -> CliResult {
    let store: Arc<dyn PendingChangeStore> = Arc::new(SeaOrmChangeStore::new(db.clone()));
    let tools = Tools::new(db.clone(), store.clone());
    match action {
        ChangesAction::List { project, datasource } => {
            let data_source_id = match datasource {
                Some(name) => Some(datasource::find_by_name(db, project, &name).await?.id),
                None => None,
            };
            for change in store.list_pending(project, data_source_id).await? {
                println!(
                    "{}  {:<20} {}  {}",
                    change.id, change.change_type, change.target, change.created_at
                );
            }
        }
        ChangesAction::Approve { id, reviewer } => {
            let change = tools.approve_change(id, &reviewer).await?;
            println!("{} {}", change.id, change.status);
        }
        ChangesAction::Reject { id, reviewer } => {
            let change = tools.reject_change(id, &reviewer).await?;
            println!("{} {}", change.id, change.status);
        }
    }
    Ok(())
}

async fn apply(db: &DatabaseConnection, cfg: &EngineConfig, target: Target) -> CliResult {
    let ds = datasource::find_by_name(db, target.project, &target.datasource).await?;
    let executor = connect(&ds, cfg)?;
    let store: Arc<dyn PendingChangeStore> = Arc::new(SeaOrmChangeStore::new(db.clone()));
    let dispatcher = Dispatcher::new(
        db.clone(),
        executor,
        semantic_client(cfg)?,
        store,
        cfg.analysis.clone(),
        Writer::inferred("dispatcher"),
    );
    let cancel = cancel_on_ctrl_c();

    let summary = dispatcher.apply_approved(target.project, ds.id, &cancel).await?;
    println!("applied {}, failed {}", summary.applied, summary.failed);
    Ok(())
}

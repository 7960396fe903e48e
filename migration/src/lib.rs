pub use sea_orm_migration::prelude::*;

mod m20260219_000001_create_data_sources;
mod m20260220_000002_create_schema_catalog;
mod m20260221_000003_create_semantic_metadata;
mod m20260222_000004_create_relationships;
mod m20260223_000005_create_pending_changes;
mod m20260224_000006_create_pipeline_runs;
mod m20260301_000007_add_relationship_source_role;
mod m20260302_000008_add_pending_change_open_slot;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260219_000001_create_data_sources::Migration),
            Box::new(m20260220_000002_create_schema_catalog::Migration),
            Box::new(m20260221_000003_create_semantic_metadata::Migration),
            Box::new(m20260222_000004_create_relationships::Migration),
            Box::new(m20260223_000005_create_pending_changes::Migration),
            Box::new(m20260224_000006_create_pipeline_runs::Migration),
            Box::new(m20260301_000007_add_relationship_source_role::Migration),
            Box::new(m20260302_000008_add_pending_change_open_slot::Migration),
        ]
    }
}

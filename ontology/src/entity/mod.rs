pub mod column_metadata;
pub mod data_source;
pub mod pending_change;
pub mod pipeline_run;
pub mod relationship;
pub mod run_stage;
pub mod schema_column;
pub mod schema_table;
pub mod table_metadata;

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // pipeline_run
        manager
            .create_table(
                Table::create()
                    .table(PipelineRun::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PipelineRun::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PipelineRun::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(PipelineRun::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(PipelineRun::Status).string().not_null())
                    .col(ColumnDef::new(PipelineRun::CurrentStage).string().null())
                    .col(
                        ColumnDef::new(PipelineRun::Degraded)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    // "running" while in flight, NULL afterwards; the unique index below
                    // admits many finished runs but only one running run per datasource.
                    .col(ColumnDef::new(PipelineRun::ActiveSlot).string().null())
                    .col(ColumnDef::new(PipelineRun::FailedStage).string().null())
                    .col(ColumnDef::new(PipelineRun::Error).text().null())
                    .col(
                        ColumnDef::new(PipelineRun::StartedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(PipelineRun::CompletedAt).timestamp().null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(PipelineRun::Table, PipelineRun::DataSourceId)
                            .to(DataSource::Table, DataSource::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .unique()
                    .name("uq_pipeline_run_active_slot")
                    .table(PipelineRun::Table)
                    .col(PipelineRun::ProjectId)
                    .col(PipelineRun::DataSourceId)
                    .col(PipelineRun::ActiveSlot)
                    .to_owned(),
            )
            .await?;

        // run_stage
        manager
            .create_table(
                Table::create()
                    .table(RunStage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RunStage::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RunStage::RunId).uuid().not_null())
                    .col(ColumnDef::new(RunStage::Stage).string().not_null())
                    .col(ColumnDef::new(RunStage::Ordinal).integer().not_null())
                    .col(
                        ColumnDef::new(RunStage::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(RunStage::Done)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RunStage::Total)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(RunStage::Message).text().null())
                    .col(ColumnDef::new(RunStage::Error).text().null())
                    .col(ColumnDef::new(RunStage::StartedAt).timestamp().null())
                    .col(ColumnDef::new(RunStage::CompletedAt).timestamp().null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(RunStage::Table, RunStage::RunId)
                            .to(PipelineRun::Table, PipelineRun::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .unique()
                    .name("uq_run_stage_run_stage")
                    .table(RunStage::Table)
                    .col(RunStage::RunId)
                    .col(RunStage::Stage)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RunStage::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PipelineRun::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DataSource {
    Table,
    Id,
}

#[derive(Iden)]
enum PipelineRun {
    Table,
    Id,
    ProjectId,
    DataSourceId,
    Status,
    CurrentStage,
    Degraded,
    ActiveSlot,
    FailedStage,
    Error,
    StartedAt,
    CompletedAt,
}

#[derive(Iden)]
enum RunStage {
    Table,
    Id,
    RunId,
    Stage,
    Ordinal,
    Status,
    Done,
    Total,
    Message,
    Error,
    StartedAt,
    CompletedAt,
}

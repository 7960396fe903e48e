use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PendingChange::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PendingChange::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PendingChange::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(PendingChange::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(PendingChange::ChangeType).string().not_null())
                    .col(ColumnDef::new(PendingChange::Target).string().not_null())
                    .col(
                        ColumnDef::new(PendingChange::Payload)
                            .text()
                            .not_null()
                            .default("{}"),
                    )
                    .col(
                        ColumnDef::new(PendingChange::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(PendingChange::ReviewedBy).string().null())
                    .col(ColumnDef::new(PendingChange::Error).text().null())
                    .col(
                        ColumnDef::new(PendingChange::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PendingChange::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(PendingChange::ResolvedAt).timestamp().null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(PendingChange::Table, PendingChange::DataSourceId)
                            .to(DataSource::Table, DataSource::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("ix_pending_change_lookup")
                    .table(PendingChange::Table)
                    .col(PendingChange::ProjectId)
                    .col(PendingChange::ChangeType)
                    .col(PendingChange::Target)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PendingChange::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DataSource {
    Table,
    Id,
}

#[derive(Iden)]
enum PendingChange {
    Table,
    Id,
    ProjectId,
    DataSourceId,
    ChangeType,
    Target,
    Payload,
    Status,
    ReviewedBy,
    Error,
    CreatedAt,
    UpdatedAt,
    ResolvedAt,
}

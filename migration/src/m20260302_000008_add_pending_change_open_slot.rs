use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(PendingChange::Table)
                    .add_column(ColumnDef::new(PendingChange::OpenSlot).string().null())
                    .to_owned(),
            )
            .await?;

        // At most one open change per (data source, type, target); closed rows hold NULL.
        manager
            .create_index(
                Index::create()
                    .unique()
                    .name("uq_pending_change_open")
                    .table(PendingChange::Table)
                    .col(PendingChange::DataSourceId)
                    .col(PendingChange::ChangeType)
                    .col(PendingChange::Target)
                    .col(PendingChange::OpenSlot)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("uq_pending_change_open")
                    .table(PendingChange::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .alter_table(
                Table::alter()
                    .table(PendingChange::Table)
                    .drop_column(PendingChange::OpenSlot)
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
enum PendingChange {
    Table,
    DataSourceId,
    ChangeType,
    Target,
    OpenSlot,
}

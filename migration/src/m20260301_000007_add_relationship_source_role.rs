use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Relationship::Table)
                    .add_column(ColumnDef::new(Relationship::SourceRole).string().null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Relationship::Table)
                    .drop_column(Relationship::SourceRole)
                    .to_owned(),
            )
            .await
    }
}

#[derive(Iden)]
enum Relationship {
    Table,
    SourceRole,
}

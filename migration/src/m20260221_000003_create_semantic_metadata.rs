use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // table_metadata (1:1 with schema_table)
        manager
            .create_table(
                Table::create()
                    .table(TableMetadata::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TableMetadata::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TableMetadata::SchemaTableId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(TableMetadata::EntityName).string().null())
                    .col(ColumnDef::new(TableMetadata::TableRole).string().null())
                    .col(ColumnDef::new(TableMetadata::Description).text().null())
                    .col(ColumnDef::new(TableMetadata::Synonyms).text().null())
                    .col(ColumnDef::new(TableMetadata::Source).string().not_null())
                    .col(ColumnDef::new(TableMetadata::CreatedBy).string().not_null())
                    .col(ColumnDef::new(TableMetadata::UpdatedBy).string().not_null())
                    .col(
                        ColumnDef::new(TableMetadata::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TableMetadata::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(TableMetadata::Table, TableMetadata::SchemaTableId)
                            .to(SchemaTable::Table, SchemaTable::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // column_metadata (1:1 with schema_column)
        manager
            .create_table(
                Table::create()
                    .table(ColumnMetadata::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ColumnMetadata::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ColumnMetadata::SchemaColumnId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(ColumnMetadata::Purpose).string().null())
                    .col(ColumnDef::new(ColumnMetadata::Role).string().null())
                    .col(ColumnDef::new(ColumnMetadata::SemanticType).string().null())
                    .col(ColumnDef::new(ColumnMetadata::EnumValues).text().null())
                    .col(ColumnDef::new(ColumnMetadata::Synonyms).text().null())
                    .col(ColumnDef::new(ColumnMetadata::FkTargetColumnId).uuid().null())
                    .col(ColumnDef::new(ColumnMetadata::FkConfidence).double().null())
                    .col(ColumnDef::new(ColumnMetadata::Description).text().null())
                    .col(ColumnDef::new(ColumnMetadata::Source).string().not_null())
                    .col(ColumnDef::new(ColumnMetadata::CreatedBy).string().not_null())
                    .col(ColumnDef::new(ColumnMetadata::UpdatedBy).string().not_null())
                    .col(
                        ColumnDef::new(ColumnMetadata::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ColumnMetadata::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(ColumnMetadata::Table, ColumnMetadata::SchemaColumnId)
                            .to(SchemaColumn::Table, SchemaColumn::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ColumnMetadata::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TableMetadata::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum SchemaTable {
    Table,
    Id,
}

#[derive(Iden)]
enum SchemaColumn {
    Table,
    Id,
}

#[derive(Iden)]
enum TableMetadata {
    Table,
    Id,
    SchemaTableId,
    EntityName,
    TableRole,
    Description,
    Synonyms,
    Source,
    CreatedBy,
    UpdatedBy,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ColumnMetadata {
    Table,
    Id,
    SchemaColumnId,
    Purpose,
    Role,
    SemanticType,
    EnumValues,
    Synonyms,
    FkTargetColumnId,
    FkConfidence,
    Description,
    Source,
    CreatedBy,
    UpdatedBy,
    CreatedAt,
    UpdatedAt,
}

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // schema_table
        manager
            .create_table(
                Table::create()
                    .table(SchemaTable::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SchemaTable::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SchemaTable::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(SchemaTable::DataSourceId).uuid().not_null())
                    .col(ColumnDef::new(SchemaTable::SchemaName).string().not_null())
                    .col(ColumnDef::new(SchemaTable::TableName).string().not_null())
                    .col(ColumnDef::new(SchemaTable::TableType).string().not_null())
                    .col(ColumnDef::new(SchemaTable::RowCount).big_integer().null())
                    .col(ColumnDef::new(SchemaTable::DeletedAt).timestamp().null())
                    .col(
                        ColumnDef::new(SchemaTable::DiscoveredAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SchemaTable::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(SchemaTable::Table, SchemaTable::DataSourceId)
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
                    .name("uq_schema_table_natural_key")
                    .table(SchemaTable::Table)
                    .col(SchemaTable::ProjectId)
                    .col(SchemaTable::DataSourceId)
                    .col(SchemaTable::SchemaName)
                    .col(SchemaTable::TableName)
                    .to_owned(),
            )
            .await?;

        // schema_column
        manager
            .create_table(
                Table::create()
                    .table(SchemaColumn::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SchemaColumn::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SchemaColumn::SchemaTableId).uuid().not_null())
                    .col(ColumnDef::new(SchemaColumn::ColumnName).string().not_null())
                    .col(
                        ColumnDef::new(SchemaColumn::OrdinalPosition)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SchemaColumn::DataType).string().not_null())
                    .col(
                        ColumnDef::new(SchemaColumn::IsNullable)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SchemaColumn::IsPrimaryKey)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SchemaColumn::IsUnique)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SchemaColumn::DistinctCount)
                            .big_integer()
                            .null(),
                    )
                    .col(ColumnDef::new(SchemaColumn::NullRate).double().null())
                    .col(ColumnDef::new(SchemaColumn::SampleValues).text().null())
                    .col(ColumnDef::new(SchemaColumn::DeletedAt).timestamp().null())
                    .col(
                        ColumnDef::new(SchemaColumn::DiscoveredAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SchemaColumn::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(SchemaColumn::Table, SchemaColumn::SchemaTableId)
                            .to(SchemaTable::Table, SchemaTable::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .unique()
                    .name("uq_schema_column_table_name")
                    .table(SchemaColumn::Table)
                    .col(SchemaColumn::SchemaTableId)
                    .col(SchemaColumn::ColumnName)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SchemaColumn::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SchemaTable::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DataSource {
    Table,
    Id,
}

#[derive(Iden)]
enum SchemaTable {
    Table,
    Id,
    ProjectId,
    DataSourceId,
    SchemaName,
    TableName,
    TableType,
    RowCount,
    DeletedAt,
    DiscoveredAt,
    UpdatedAt,
}

#[derive(Iden)]
enum SchemaColumn {
    Table,
    Id,
    SchemaTableId,
    ColumnName,
    OrdinalPosition,
    DataType,
    IsNullable,
    IsPrimaryKey,
    IsUnique,
    DistinctCount,
    NullRate,
    SampleValues,
    DeletedAt,
    DiscoveredAt,
    UpdatedAt,
}

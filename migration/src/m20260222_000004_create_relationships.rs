use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Relationship::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Relationship::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Relationship::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Relationship::DataSourceId).uuid().not_null())
                    .col(
                        ColumnDef::new(Relationship::SourceColumnId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationship::TargetColumnId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Relationship::Cardinality)
                            .string()
                            .not_null()
                            .default("unknown"),
                    )
                    .col(
                        ColumnDef::new(Relationship::Confidence)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(Relationship::DetectionMethod)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Relationship::MatchedCount).big_integer().null())
                    .col(ColumnDef::new(Relationship::OrphanCount).big_integer().null())
                    .col(ColumnDef::new(Relationship::Reasoning).text().null())
                    .col(ColumnDef::new(Relationship::RejectionReason).text().null())
                    .col(ColumnDef::new(Relationship::Source).string().not_null())
                    .col(ColumnDef::new(Relationship::CreatedBy).string().not_null())
                    .col(ColumnDef::new(Relationship::UpdatedBy).string().not_null())
                    .col(
                        ColumnDef::new(Relationship::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Relationship::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Relationship::Table, Relationship::DataSourceId)
                            .to(DataSource::Table, DataSource::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Relationship::Table, Relationship::SourceColumnId)
                            .to(SchemaColumn::Table, SchemaColumn::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Relationship::Table, Relationship::TargetColumnId)
                            .to(SchemaColumn::Table, SchemaColumn::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .unique()
                    .name("uq_relationship_source_target")
                    .table(Relationship::Table)
                    .col(Relationship::SourceColumnId)
                    .col(Relationship::TargetColumnId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Relationship::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DataSource {
    Table,
    Id,
}

#[derive(Iden)]
enum SchemaColumn {
    Table,
    Id,
}

#[derive(Iden)]
enum Relationship {
    Table,
    Id,
    ProjectId,
    DataSourceId,
    SourceColumnId,
    TargetColumnId,
    Cardinality,
    Confidence,
    DetectionMethod,
    MatchedCount,
    OrphanCount,
    Reasoning,
    RejectionReason,
    Source,
    CreatedBy,
    UpdatedBy,
    CreatedAt,
    UpdatedAt,
}

//! State store: connection management, schema bootstrap, and tenant-scoped
//! repositories.
//!
//! Every repository is constructed with `(connection, tenant_id)` and adds
//! the tenant predicate to every query it issues. Transaction boundaries
//! belong to the caller: repositories write and flush but never commit.

pub mod audit;
pub mod backfill;
pub mod repository;
pub mod tables;

use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityName, EntityTrait, Schema};

use crate::errors::CoreError;

/// Open a database connection.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, CoreError> {
    let connection = Database::connect(database_url).await?;
    Ok(connection)
}

/// Create every table and index, idempotently. Intended for dev and tests;
/// production deployments run managed migrations built from the same entity
/// definitions.
pub async fn init_schema(db: &DatabaseConnection) -> Result<(), CoreError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    async fn create<E: EntityTrait>(
        db: &DatabaseConnection,
        schema: &Schema,
        entity: E,
    ) -> Result<(), CoreError> {
        let mut statement = schema.create_table_from_entity(entity);
        statement.if_not_exists();
        db.execute(db.get_database_backend().build(&statement))
            .await?;
        Ok(())
    }

    create(db, &schema, tables::models::Entity).await?;
    create(db, &schema, tables::model_versions::Entity).await?;
    create(db, &schema, tables::snapshots::Entity).await?;
    create(db, &schema, tables::plans::Entity).await?;
    create(db, &schema, tables::runs::Entity).await?;
    create(db, &schema, tables::watermarks::Entity).await?;
    create(db, &schema, tables::locks::Entity).await?;
    create(db, &schema, tables::telemetry::Entity).await?;
    create(db, &schema, tables::audit_log::Entity).await?;
    create(db, &schema, tables::backfill_checkpoints::Entity).await?;
    create(db, &schema, tables::backfill_audit::Entity).await?;
    create(db, &schema, tables::reconciliation_checks::Entity).await?;
    create(db, &schema, tables::reconciliation_schedules::Entity).await?;
    create(db, &schema, tables::credentials::Entity).await?;

    for statement in index_statements() {
        db.execute(backend.build(&statement)).await?;
    }

    Ok(())
}

/// Composite indexes beyond the primary keys: every table queried by
/// `(tenant_id, created_at)` gets that pair, plus the lookup paths the
/// repositories use.
fn index_statements() -> Vec<IndexCreateStatement> {
    use tables::*;

    vec![
        Index::create()
            .name("ix_model_versions_tenant_model")
            .table(model_versions::Entity.table_ref())
            .col(model_versions::Column::TenantId)
            .col(model_versions::Column::ModelName)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_snapshots_tenant_env")
            .table(snapshots::Entity.table_ref())
            .col(snapshots::Column::TenantId)
            .col(snapshots::Column::Environment)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_plans_tenant_created")
            .table(plans::Entity.table_ref())
            .col(plans::Column::TenantId)
            .col(plans::Column::CreatedAt)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_runs_tenant_plan")
            .table(runs::Entity.table_ref())
            .col(runs::Column::TenantId)
            .col(runs::Column::PlanId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_runs_tenant_model_status")
            .table(runs::Entity.table_ref())
            .col(runs::Column::TenantId)
            .col(runs::Column::ModelName)
            .col(runs::Column::Status)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_telemetry_tenant_model_captured")
            .table(telemetry::Entity.table_ref())
            .col(telemetry::Column::TenantId)
            .col(telemetry::Column::ModelName)
            .col(telemetry::Column::CapturedAt)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_audit_tenant_created")
            .table(audit_log::Entity.table_ref())
            .col(audit_log::Column::TenantId)
            .col(audit_log::Column::CreatedAt)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_backfill_checkpoints_tenant_model")
            .table(backfill_checkpoints::Entity.table_ref())
            .col(backfill_checkpoints::Column::TenantId)
            .col(backfill_checkpoints::Column::ModelName)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_backfill_audit_tenant_backfill")
            .table(backfill_audit::Entity.table_ref())
            .col(backfill_audit::Column::TenantId)
            .col(backfill_audit::Column::BackfillId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_reconciliation_tenant_unresolved")
            .table(reconciliation_checks::Entity.table_ref())
            .col(reconciliation_checks::Column::TenantId)
            .col(reconciliation_checks::Column::Resolved)
            .if_not_exists()
            .to_owned(),
    ]
}

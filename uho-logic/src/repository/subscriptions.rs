use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};
use serde_json::Value;
use uho_entity::{
    program_subscriptions::{ActiveModel, Column, Entity, Model},
    sea_orm_active_enums::SubscriptionStatus,
};
use uuid::Uuid;

#[allow(clippy::too_many_arguments)]
pub async fn create<C>(
    db: &C,
    tenant_id: Uuid,
    program_id: &str,
    name: &str,
    idl: Value,
    chain: &str,
    status: SubscriptionStatus,
    config: Option<Value>,
) -> Result<Model, DbErr>
where
    C: ConnectionTrait,
{
    let now = Utc::now().into();
    let model = ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        program_id: Set(program_id.to_string()),
        name: Set(name.to_string()),
        idl: Set(idl),
        chain: Set(chain.to_string()),
        status: Set(status),
        config: Set(config),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Entity::insert(model).exec_with_returning(db).await
}

pub async fn get<C>(db: &C, id: Uuid) -> Result<Option<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find_by_id(id).one(db).await
}

pub async fn list_running<C>(db: &C) -> Result<Vec<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find()
        .filter(Column::Status.eq(SubscriptionStatus::Running))
        .all(db)
        .await
}

pub async fn find_by_tenant_and_name<C>(
    db: &C,
    tenant_id: Uuid,
    program_name: &str,
) -> Result<Option<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find()
        .filter(Column::TenantId.eq(tenant_id))
        .filter(Column::Name.eq(program_name))
        .one(db)
        .await
}

pub async fn list_by_program<C>(db: &C, program_id: &str) -> Result<Vec<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find()
        .filter(Column::ProgramId.eq(program_id))
        .all(db)
        .await
}

pub async fn set_status<C>(
    db: &C,
    id: Uuid,
    status: SubscriptionStatus,
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(id),
        status: Set(status),
        updated_at: Set(Utc::now().into()),
        ..Default::default()
    };
    Entity::update(model).exec(db).await?;
    Ok(())
}

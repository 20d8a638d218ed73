use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};
use serde_json::Value;
use uho_entity::webhooks::{ActiveModel, Column, Entity, Model};
use uuid::Uuid;

#[allow(clippy::too_many_arguments)]
pub async fn create<C>(
    db: &C,
    tenant_id: Uuid,
    subscription_id: Uuid,
    url: &str,
    secret: &str,
    event_filter: Vec<String>,
    field_filter: Option<Value>,
) -> Result<Model, DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        subscription_id: Set(subscription_id),
        url: Set(url.to_string()),
        secret: Set(secret.to_string()),
        event_filter: Set(event_filter),
        field_filter: Set(field_filter),
        active: Set(true),
        failure_count: Set(0),
        last_triggered_at: Set(None),
        created_at: Set(Utc::now().into()),
    };
    Entity::insert(model).exec_with_returning(db).await
}

pub async fn get<C>(db: &C, id: Uuid) -> Result<Option<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find_by_id(id).one(db).await
}

/// Active webhooks attached to any of the given subscriptions whose tenant
/// is among the message's subscribers.
pub async fn find_active<C>(
    db: &C,
    subscription_ids: &[Uuid],
    tenant_ids: &[Uuid],
) -> Result<Vec<Model>, DbErr>
where
    C: ConnectionTrait,
{
    if subscription_ids.is_empty() || tenant_ids.is_empty() {
        return Ok(Vec::new());
    }
    Entity::find()
        .filter(Column::SubscriptionId.is_in(subscription_ids.iter().copied()))
        .filter(Column::TenantId.is_in(tenant_ids.iter().copied()))
        .filter(Column::Active.eq(true))
        .all(db)
        .await
}

pub async fn record_success<C>(db: &C, id: Uuid) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(id),
        failure_count: Set(0),
        last_triggered_at: Set(Some(Utc::now().into())),
        ..Default::default()
    };
    Entity::update(model).exec(db).await?;
    Ok(())
}

/// Increments the consecutive-failure counter; past the threshold the
/// webhook is disabled.
pub async fn record_failure<C>(
    db: &C,
    id: Uuid,
    disable_threshold: i32,
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let Some(current) = Entity::find_by_id(id).one(db).await? else {
        return Ok(());
    };
    let failure_count = current.failure_count + 1;
    let model = ActiveModel {
        id: Set(id),
        failure_count: Set(failure_count),
        active: Set(current.active && failure_count < disable_threshold),
        ..Default::default()
    };
    Entity::update(model).exec(db).await?;
    Ok(())
}

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder,
};
use uho_entity::{
    backfill_jobs::{ActiveModel, Column, Entity, Model},
    sea_orm_active_enums::BackfillStatus,
};
use uuid::Uuid;

pub struct NewJob {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub start_slot: i64,
    pub end_slot: i64,
    pub events_found: i64,
    pub events_skipped: i64,
}

pub async fn create<C>(db: &C, job: NewJob) -> Result<Model, DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(Uuid::new_v4()),
        subscription_id: Set(job.subscription_id),
        tenant_id: Set(job.tenant_id),
        status: Set(BackfillStatus::Pending),
        start_slot: Set(job.start_slot),
        end_slot: Set(job.end_slot),
        current_slot: Set(None),
        progress: Set(0.0),
        events_found: Set(job.events_found),
        events_skipped: Set(job.events_skipped),
        error: Set(None),
        created_at: Set(Utc::now().into()),
        started_at: Set(None),
        completed_at: Set(None),
    };
    Entity::insert(model).exec_with_returning(db).await
}

pub async fn get<C>(db: &C, id: Uuid) -> Result<Option<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find_by_id(id).one(db).await
}

pub async fn list_for_subscription<C>(
    db: &C,
    subscription_id: Uuid,
) -> Result<Vec<Model>, DbErr>
where
    C: ConnectionTrait,
{
    Entity::find()
        .filter(Column::SubscriptionId.eq(subscription_id))
        .order_by_desc(Column::CreatedAt)
        .all(db)
        .await
}

pub async fn mark_running<C>(db: &C, id: Uuid) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(id),
        status: Set(BackfillStatus::Running),
        started_at: Set(Some(Utc::now().into())),
        ..Default::default()
    };
    Entity::update(model).exec(db).await?;
    Ok(())
}

pub async fn update_progress<C>(
    db: &C,
    id: Uuid,
    current_slot: i64,
    progress: f64,
    events_found: i64,
    events_skipped: i64,
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let model = ActiveModel {
        id: Set(id),
        current_slot: Set(Some(current_slot)),
        progress: Set(progress.clamp(0.0, 1.0)),
        events_found: Set(events_found),
        events_skipped: Set(events_skipped),
        ..Default::default()
    };
    Entity::update(model).exec(db).await?;
    Ok(())
}

pub async fn finish<C>(
    db: &C,
    id: Uuid,
    status: BackfillStatus,
    error: Option<String>,
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let progress = match status {
        BackfillStatus::Completed => Some(1.0),
        _ => None,
    };
    let mut model = ActiveModel {
        id: Set(id),
        status: Set(status),
        error: Set(error),
        completed_at: Set(Some(Utc::now().into())),
        ..Default::default()
    };
    if let Some(progress) = progress {
        model.progress = Set(progress);
    }
    Entity::update(model).exec(db).await?;
    Ok(())
}

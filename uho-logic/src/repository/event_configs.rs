use crate::schema::ddl::EnabledSet;
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait,
    QueryFilter,
};
use uho_entity::{
    program_event_configs::{ActiveModel, Column, Entity},
    sea_orm_active_enums::EventConfigKind,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnablementEntry {
    pub name: String,
    pub kind: EventConfigKind,
    pub enabled: bool,
}

pub async fn upsert_many<C>(
    db: &C,
    subscription_id: Uuid,
    entries: &[EnablementEntry],
) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    if entries.is_empty() {
        return Ok(());
    }
    let models = entries.iter().map(|entry| ActiveModel {
        subscription_id: Set(subscription_id),
        name: Set(entry.name.clone()),
        kind: Set(entry.kind.clone()),
        enabled: Set(entry.enabled),
        ..Default::default()
    });
    Entity::insert_many(models)
        .on_conflict(
            OnConflict::columns([Column::SubscriptionId, Column::Name, Column::Kind])
                .update_column(Column::Enabled)
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// The names with tables and decoders, as a compiler/decoder input.
pub async fn enabled_set<C>(db: &C, subscription_id: Uuid) -> Result<EnabledSet, DbErr>
where
    C: ConnectionTrait,
{
    let configs = Entity::find()
        .filter(Column::SubscriptionId.eq(subscription_id))
        .filter(Column::Enabled.eq(true))
        .all(db)
        .await?;
    let mut set = EnabledSet::default();
    for config in configs {
        match config.kind {
            EventConfigKind::Event => {
                set.events.insert(config.name);
            }
            EventConfigKind::Instruction => {
                set.instructions.insert(config.name);
            }
        }
    }
    Ok(set)
}

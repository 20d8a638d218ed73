pub mod backfill_jobs;
pub mod program_event_configs;
pub mod program_subscriptions;
pub mod sea_orm_active_enums;
pub mod webhooks;

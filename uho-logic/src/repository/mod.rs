//! Control-plane repositories over the shared-namespace tables.

pub mod backfill_jobs;
pub mod event_configs;
pub mod subscriptions;
pub mod webhooks;

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            CREATE TYPE "subscription_status" AS ENUM ('running', 'paused', 'error', 'archived');

            CREATE TYPE "backfill_status" AS ENUM ('pending', 'running', 'completed', 'failed', 'cancelled');

            CREATE TYPE "event_config_kind" AS ENUM ('event', 'instruction');

            CREATE TABLE "program_subscriptions" (
                "id" uuid PRIMARY KEY,
                "tenant_id" uuid NOT NULL,
                "program_id" varchar NOT NULL,
                "name" varchar NOT NULL,
                "idl" jsonb NOT NULL,
                "chain" varchar NOT NULL DEFAULT 'solana',
                "status" subscription_status NOT NULL DEFAULT 'paused',
                "config" jsonb,
                "created_at" timestamptz NOT NULL DEFAULT now(),
                "updated_at" timestamptz NOT NULL DEFAULT now()
            );

            CREATE UNIQUE INDEX "program_subscriptions_tenant_program_index"
                ON "program_subscriptions" ("tenant_id", "program_id");

            CREATE INDEX "program_subscriptions_status_index"
                ON "program_subscriptions" ("status");

            CREATE TABLE "program_event_configs" (
                "id" bigserial PRIMARY KEY,
                "subscription_id" uuid NOT NULL REFERENCES "program_subscriptions" ("id") ON DELETE CASCADE,
                "name" varchar NOT NULL,
                "kind" event_config_kind NOT NULL,
                "enabled" boolean NOT NULL DEFAULT true,
                "field_config" jsonb
            );

            CREATE UNIQUE INDEX "program_event_configs_subscription_name_kind_index"
                ON "program_event_configs" ("subscription_id", "name", "kind");

            CREATE TABLE "backfill_jobs" (
                "id" uuid PRIMARY KEY,
                "subscription_id" uuid NOT NULL REFERENCES "program_subscriptions" ("id") ON DELETE CASCADE,
                "tenant_id" uuid NOT NULL,
                "status" backfill_status NOT NULL DEFAULT 'pending',
                "start_slot" bigint NOT NULL,
                "end_slot" bigint NOT NULL,
                "current_slot" bigint,
                "progress" double precision NOT NULL DEFAULT 0,
                "events_found" bigint NOT NULL DEFAULT 0,
                "events_skipped" bigint NOT NULL DEFAULT 0,
                "error" varchar,
                "created_at" timestamptz NOT NULL DEFAULT now(),
                "started_at" timestamptz,
                "completed_at" timestamptz
            );

            CREATE INDEX "backfill_jobs_subscription_index"
                ON "backfill_jobs" ("subscription_id");

            CREATE INDEX "backfill_jobs_status_index"
                ON "backfill_jobs" ("status");

            CREATE TABLE "webhooks" (
                "id" uuid PRIMARY KEY,
                "tenant_id" uuid NOT NULL,
                "subscription_id" uuid NOT NULL REFERENCES "program_subscriptions" ("id") ON DELETE CASCADE,
                "url" varchar NOT NULL,
                "secret" varchar NOT NULL,
                "event_filter" varchar[] NOT NULL DEFAULT '{}',
                "field_filter" jsonb,
                "active" boolean NOT NULL DEFAULT true,
                "failure_count" integer NOT NULL DEFAULT 0,
                "last_triggered_at" timestamptz,
                "created_at" timestamptz NOT NULL DEFAULT now()
            );

            CREATE INDEX "webhooks_subscription_index"
                ON "webhooks" ("subscription_id");

            COMMENT ON TABLE "program_subscriptions" IS 'Control plane: one row per (tenant, program) indexing subscription';

            COMMENT ON TABLE "program_event_configs" IS 'Per-subscription enablement of events and instructions';

            COMMENT ON TABLE "backfill_jobs" IS 'Bounded slot-range historical crawl jobs';

            COMMENT ON TABLE "webhooks" IS 'Outbound webhook endpoints with HMAC secrets'
        "#;
        crate::from_sql(manager, sql).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            DROP TABLE "webhooks";
            DROP TABLE "backfill_jobs";
            DROP TABLE "program_event_configs";
            DROP TABLE "program_subscriptions";
            DROP TYPE "event_config_kind";
            DROP TYPE "backfill_status";
            DROP TYPE "subscription_status"
        "#;
        crate::from_sql(manager, sql).await
    }
}

//! Inbound control-plane operations: program registration, lifecycle,
//! enablement, backfills, webhooks, and views. The HTTP layer in front of
//! these calls is an external collaborator.

use crate::{
    backfill::{BackfillContext, BackfillManager, RequestedRange},
    error::ServiceError,
    idl,
    repository::{self, event_configs::EnablementEntry},
    schema::{
        ddl::{self, EnabledSet, FeatureFlags},
        views::{self, ViewDefinition},
    },
    supervisor::Supervisor,
    tenant, webhooks,
};
use sea_orm::{ConnectionTrait, DbBackend, SqlErr, Statement};
use serde_json::Value;
use std::sync::Arc;
use uho_entity::sea_orm_active_enums::{EventConfigKind, SubscriptionStatus};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RegisterProgram {
    pub tenant_id: Uuid,
    pub idl: Value,
    /// Required for dialects whose documents omit the address.
    pub program_id: Option<String>,
    pub chain: String,
    /// `None` enables every declared event and instruction.
    pub enablement: Option<Vec<EnablementEntry>>,
    pub features: FeatureFlags,
    pub autostart: bool,
}

pub struct ControlPlane {
    supervisor: Arc<Supervisor>,
    backfills: Arc<BackfillManager>,
    webhook_settings: webhooks::WebhookSettings,
}

impl ControlPlane {
    pub fn new(
        supervisor: Arc<Supervisor>,
        backfills: Arc<BackfillManager>,
        webhook_settings: webhooks::WebhookSettings,
    ) -> Self {
        Self {
            supervisor,
            backfills,
            webhook_settings,
        }
    }

    /// Parses the IDL, provisions the tenant schema, stores the
    /// subscription, and starts the pipeline when `autostart` is set.
    pub async fn register_program(
        &self,
        request: RegisterProgram,
    ) -> Result<Uuid, ServiceError> {
        let descriptor = idl::parse(&request.idl, request.program_id.as_deref())?;
        let entries = match request.enablement {
            Some(entries) => entries,
            None => descriptor
                .events
                .iter()
                .map(|event| EnablementEntry {
                    name: event.name.clone(),
                    kind: EventConfigKind::Event,
                    enabled: true,
                })
                .chain(descriptor.instructions.iter().map(|instruction| {
                    EnablementEntry {
                        name: instruction.name.clone(),
                        kind: EventConfigKind::Instruction,
                        enabled: true,
                    }
                }))
                .collect(),
        };
        let enabled = enabled_set(&entries);
        let statements = ddl::ddl_statements(&descriptor, &enabled, request.features)?;

        let db = self.supervisor.db();
        let namespace = tenant::namespace_for_tenant(&request.tenant_id);
        tenant::ensure_namespace(db, &namespace).await?;
        tenant::with_namespace(db, &namespace, |txn| {
            Box::pin(async move {
                for sql in &statements {
                    txn.execute(Statement::from_string(DbBackend::Postgres, sql.clone()))
                        .await?;
                }
                Ok(())
            })
        })
        .await?;

        let status = if request.autostart {
            SubscriptionStatus::Running
        } else {
            SubscriptionStatus::Paused
        };
        let config = serde_json::to_value(request.features)
            .map_err(|err| ServiceError::Internal(err.into()))?;
        let subscription = repository::subscriptions::create(
            db.as_ref(),
            request.tenant_id,
            &descriptor.program_id,
            &descriptor.program_name,
            request.idl,
            &request.chain,
            status,
            Some(config),
        )
        .await
        .map_err(|err| match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => ServiceError::Conflict(format!(
                "program {} is already registered for this tenant",
                descriptor.program_id
            )),
            _ => ServiceError::Db(err),
        })?;
        repository::event_configs::upsert_many(db.as_ref(), subscription.id, &entries).await?;

        self.supervisor.reconcile().await?;
        tracing::info!(
            subscription_id = %subscription.id,
            program_id = %descriptor.program_id,
            "program registered"
        );
        Ok(subscription.id)
    }

    /// `running` resumes from the checkpoint; `paused` quiesces the
    /// pipeline but keeps the checkpoint; `archived` tears it down for good
    /// while the tenant tables are retained.
    pub async fn set_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), ServiceError> {
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;
        if subscription.status == SubscriptionStatus::Archived {
            return Err(ServiceError::Validation(
                "archived subscriptions cannot change status".into(),
            ));
        }

        repository::subscriptions::set_status(db.as_ref(), subscription_id, status.clone())
            .await?;
        self.supervisor.reconcile().await?;

        let checkpoint_status = match status {
            SubscriptionStatus::Paused => Some("paused"),
            SubscriptionStatus::Archived => Some("stopped"),
            _ => None,
        };
        if let Some(checkpoint_status) = checkpoint_status {
            self.supervisor
                .mark_checkpoint(&subscription, checkpoint_status)
                .await?;
        }
        Ok(())
    }

    /// Upserts enablement rows, provisions tables for newly enabled names,
    /// and restarts the pipeline so the decoder set matches.
    pub async fn set_enablement(
        &self,
        subscription_id: Uuid,
        entries: Vec<EnablementEntry>,
    ) -> Result<(), ServiceError> {
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;

        repository::event_configs::upsert_many(db.as_ref(), subscription_id, &entries).await?;

        let descriptor = idl::parse(&subscription.idl, Some(&subscription.program_id))?;
        let enabled =
            repository::event_configs::enabled_set(db.as_ref(), subscription_id).await?;
        let features = subscription
            .config
            .as_ref()
            .and_then(|config| serde_json::from_value(config.clone()).ok())
            .unwrap_or_default();
        let statements = ddl::ddl_statements(&descriptor, &enabled, features)?;
        let namespace = tenant::namespace_for_tenant(&subscription.tenant_id);
        tenant::with_namespace(db, &namespace, |txn| {
            Box::pin(async move {
                for sql in &statements {
                    txn.execute(Statement::from_string(DbBackend::Postgres, sql.clone()))
                        .await?;
                }
                Ok(())
            })
        })
        .await?;

        self.supervisor.restart(subscription_id).await
    }

    pub async fn create_backfill(
        &self,
        subscription_id: Uuid,
        range: RequestedRange,
    ) -> Result<Uuid, ServiceError> {
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;
        let job = self.backfills.create(&subscription, range).await?;
        let (writer, decoders) = self.supervisor.build_pipeline_parts(&subscription).await?;
        self.backfills.start(
            job.clone(),
            BackfillContext { writer, decoders },
            self.supervisor.root_token(),
        );
        Ok(job.id)
    }

    pub async fn cancel_backfill(&self, job_id: Uuid) -> Result<(), ServiceError> {
        self.backfills.cancel(job_id).await
    }

    /// Starts a fresh job resuming from the cancelled/failed one's cursor.
    pub async fn retry_backfill(&self, job_id: Uuid) -> Result<Uuid, ServiceError> {
        let job = self.backfills.retry(job_id).await?;
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), job.subscription_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("subscription {}", job.subscription_id))
            })?;
        let (writer, decoders) = self.supervisor.build_pipeline_parts(&subscription).await?;
        self.backfills.start(
            job.clone(),
            BackfillContext { writer, decoders },
            self.supervisor.root_token(),
        );
        Ok(job.id)
    }

    /// The secret is returned exactly once and stored only for signing.
    pub async fn create_webhook(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        url: &str,
        events: Vec<String>,
        field_filter: Option<Value>,
    ) -> Result<(Uuid, String), ServiceError> {
        webhooks::validate_url(url, self.webhook_settings.allow_insecure_urls)?;
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), subscription_id)
            .await?
            .filter(|sub| sub.tenant_id == tenant_id)
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;

        let secret = generate_secret();
        let model = repository::webhooks::create(
            db.as_ref(),
            tenant_id,
            subscription.id,
            url,
            &secret,
            events,
            field_filter,
        )
        .await?;
        Ok((model.id, secret))
    }

    /// Compiles and materializes a declarative view in the tenant's
    /// namespace, then keeps it refreshed on its interval until shutdown.
    pub async fn create_view(
        &self,
        subscription_id: Uuid,
        view: ViewDefinition,
    ) -> Result<(), ServiceError> {
        let db = self.supervisor.db();
        let subscription = repository::subscriptions::get(db.as_ref(), subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {subscription_id}")))?;
        let descriptor = idl::parse(&subscription.idl, Some(&subscription.program_id))?;
        let create = views::compile_view(&descriptor, &view)?;
        let refresh = views::refresh_statement(&view.name)?;
        let namespace = tenant::namespace_for_tenant(&subscription.tenant_id);

        tenant::with_namespace(db, &namespace, |txn| {
            Box::pin(async move {
                txn.execute(Statement::from_string(DbBackend::Postgres, create))
                    .await?;
                Ok(())
            })
        })
        .await?;

        let db = db.clone();
        let cancel = self.supervisor.root_token().child_token();
        let interval = view.refresh_interval();
        let view_name = view.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let refresh = refresh.clone();
                let result = tenant::with_namespace(&db, &namespace, |txn| {
                    Box::pin(async move {
                        txn.execute(Statement::from_string(DbBackend::Postgres, refresh))
                            .await?;
                        Ok(())
                    })
                })
                .await;
                if let Err(err) = result {
                    tracing::error!(view = %view_name, error = %err, "view refresh failed");
                }
            }
        });
        Ok(())
    }
}

/// Read surface handed to the REST/WebSocket collaborators.
impl ControlPlane {
    async fn resolve(
        &self,
        tenant_id: Uuid,
        program_name: &str,
    ) -> Result<(String, crate::idl::descriptor::ProgramDescriptor), ServiceError> {
        let db = self.supervisor.db();
        let subscription =
            repository::subscriptions::find_by_tenant_and_name(db.as_ref(), tenant_id, program_name)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("program {program_name:?} for this tenant"))
                })?;
        let descriptor = idl::parse(&subscription.idl, Some(&subscription.program_id))?;
        Ok((tenant::namespace_for_tenant(&tenant_id), descriptor))
    }

    pub async fn list_events(
        &self,
        tenant_id: Uuid,
        program_name: &str,
        event_name: &str,
        filters: &crate::query::EventFilters,
        order: crate::query::OrderColumn,
        direction: crate::query::OrderDirection,
        paging: crate::query::Paging,
    ) -> Result<Vec<Value>, ServiceError> {
        let (namespace, descriptor) = self.resolve(tenant_id, program_name).await?;
        crate::query::list_events(
            self.supervisor.db(),
            &namespace,
            &descriptor,
            event_name,
            filters,
            order,
            direction,
            paging,
        )
        .await
    }

    pub async fn get_event_by_tx(
        &self,
        tenant_id: Uuid,
        program_name: &str,
        event_name: &str,
        tx_signature: &str,
    ) -> Result<Vec<Value>, ServiceError> {
        let (namespace, descriptor) = self.resolve(tenant_id, program_name).await?;
        crate::query::get_event_by_tx(
            self.supervisor.db(),
            &namespace,
            &descriptor,
            event_name,
            tx_signature,
        )
        .await
    }

    pub async fn count_events(
        &self,
        tenant_id: Uuid,
        program_name: &str,
        event_name: &str,
    ) -> Result<u64, ServiceError> {
        let (namespace, descriptor) = self.resolve(tenant_id, program_name).await?;
        crate::query::count_events(self.supervisor.db(), &namespace, &descriptor, event_name)
            .await
    }

    /// Typed subscription stream in delivery order; a lagging consumer
    /// loses messages past its backlog instead of stalling the pipeline.
    pub fn subscribe_stream(
        &self,
        tenant_id: Uuid,
        filter: crate::fanout::StreamFilter,
    ) -> tokio::sync::mpsc::Receiver<crate::fanout::SubscriptionUpdate> {
        self.supervisor.bus().subscribe_stream(tenant_id, filter)
    }
}

fn enabled_set(entries: &[EnablementEntry]) -> EnabledSet {
    let mut set = EnabledSet::default();
    for entry in entries.iter().filter(|entry| entry.enabled) {
        match entry.kind {
            EventConfigKind::Event => {
                set.events.insert(entry.name.clone());
            }
            EventConfigKind::Instruction => {
                set.instructions.insert(entry.name.clone());
            }
        }
    }
    set
}

fn generate_secret() -> String {
    format!(
        "whsec_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_set_splits_events_and_instructions() {
        let entries = vec![
            EnablementEntry {
                name: "swap_event".into(),
                kind: EventConfigKind::Event,
                enabled: true,
            },
            EnablementEntry {
                name: "swap".into(),
                kind: EventConfigKind::Instruction,
                enabled: true,
            },
            EnablementEntry {
                name: "fee_event".into(),
                kind: EventConfigKind::Event,
                enabled: false,
            },
        ];
        let set = enabled_set(&entries);
        assert!(set.event_enabled("swap_event"));
        assert!(set.instruction_enabled("swap"));
        assert!(!set.event_enabled("fee_event"));
    }

    #[test]
    fn secrets_are_long_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with("whsec_"));
        assert_eq!(a.len(), "whsec_".len() + 64);
        assert_ne!(a, b);
    }
}

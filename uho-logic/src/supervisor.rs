//! Pipeline supervisor: owns one live poller per running subscription and
//! reconciles the running set against the control plane. Shutdown cancels
//! every child, waits up to a deadline, then force-terminates.

use crate::{
    decode::{
        events::EventDecoder, instructions::InstructionDecoder, tokens::TokenDecoder,
        TransactionDecoder,
    },
    error::ServiceError,
    fanout::FanoutBus,
    idl,
    pipeline::{Poller, PollerSettings, Writer},
    repository,
    rpc::SolanaRpcClient,
    schema::ddl::{EnabledSet, FeatureFlags},
    tenant,
};
use sea_orm::DatabaseConnection;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uho_entity::{
    program_subscriptions::Model as Subscription, sea_orm_active_enums::SubscriptionStatus,
};
use uuid::Uuid;

pub struct PipelineHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    db: Arc<DatabaseConnection>,
    rpc: Arc<SolanaRpcClient>,
    bus: Arc<FanoutBus>,
    poller_settings: PollerSettings,
    root: CancellationToken,
    pipelines: Mutex<HashMap<Uuid, PipelineHandle>>,
}

impl Supervisor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        rpc: Arc<SolanaRpcClient>,
        bus: Arc<FanoutBus>,
        poller_settings: PollerSettings,
    ) -> Self {
        Self {
            db,
            rpc,
            bus,
            poller_settings,
            root: CancellationToken::new(),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    pub fn rpc(&self) -> &Arc<SolanaRpcClient> {
        &self.rpc
    }

    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Aligns the live pipelines with the set of `running` subscriptions:
    /// stale handles are cancelled, missing ones started from their stored
    /// checkpoints. Called at startup and after every control-plane
    /// mutation.
    pub async fn reconcile(&self) -> Result<(), ServiceError> {
        let desired: HashMap<Uuid, Subscription> =
            repository::subscriptions::list_running(self.db.as_ref())
                .await?
                .into_iter()
                .map(|sub| (sub.id, sub))
                .collect();

        let mut pipelines = self.pipelines.lock().await;

        let stale: Vec<Uuid> = pipelines
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(handle) = pipelines.remove(&id) {
                tracing::info!(subscription_id = %id, "stopping pipeline");
                handle.cancel.cancel();
            }
        }

        for (id, subscription) in desired {
            if pipelines.contains_key(&id) {
                continue;
            }
            match self.spawn_pipeline(&subscription).await {
                Ok(handle) => {
                    tracing::info!(
                        subscription_id = %id,
                        program_id = %subscription.program_id,
                        "pipeline started"
                    );
                    pipelines.insert(id, handle);
                }
                Err(err) => {
                    tracing::error!(subscription_id = %id, error = %err, "failed to start pipeline");
                    repository::subscriptions::set_status(
                        self.db.as_ref(),
                        id,
                        SubscriptionStatus::Error,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Stops a pipeline if present and restarts it on the next reconcile;
    /// used when enablement changes invalidate the decoder set.
    pub async fn restart(&self, subscription_id: Uuid) -> Result<(), ServiceError> {
        if let Some(handle) = self.pipelines.lock().await.remove(&subscription_id) {
            handle.cancel.cancel();
        }
        self.reconcile().await
    }

    /// Writer and decoder set for a subscription; shared between the live
    /// pipeline and backfill jobs so both take the same write path.
    pub async fn build_pipeline_parts(
        &self,
        subscription: &Subscription,
    ) -> Result<(Writer, Vec<Box<dyn TransactionDecoder>>), ServiceError> {
        let descriptor = Arc::new(idl::parse(
            &subscription.idl,
            Some(&subscription.program_id),
        )?);
        let enabled =
            repository::event_configs::enabled_set(self.db.as_ref(), subscription.id).await?;
        let features = subscription
            .config
            .as_ref()
            .and_then(|config| serde_json::from_value(config.clone()).ok())
            .unwrap_or_default();
        let namespace = tenant::namespace_for_tenant(&subscription.tenant_id);
        let writer = Writer::new(
            self.db.clone(),
            namespace,
            descriptor,
            self.bus.clone(),
            vec![subscription.tenant_id],
        );
        Ok((writer, build_decoders(&enabled, features)))
    }

    async fn spawn_pipeline(
        &self,
        subscription: &Subscription,
    ) -> Result<PipelineHandle, ServiceError> {
        let (writer, decoders) = self.build_pipeline_parts(subscription).await?;
        writer.set_status("running", None).await?;
        let checkpoint = writer.get_checkpoint().await?;
        let poller = Poller::new(
            self.rpc.clone(),
            writer,
            decoders,
            self.poller_settings.clone(),
            checkpoint.as_ref(),
        );
        let cancel = self.root.child_token();
        let task = tokio::spawn(poller.run(cancel.clone()));
        Ok(PipelineHandle { cancel, task })
    }

    /// Records the checkpoint status after a lifecycle transition (`paused`
    /// on pause, `stopped` on archive).
    pub async fn mark_checkpoint(
        &self,
        subscription: &Subscription,
        status: &str,
    ) -> Result<(), ServiceError> {
        let (writer, _) = self.build_pipeline_parts(subscription).await?;
        writer.set_status(status, None).await
    }

    pub async fn shutdown(&self, deadline: Duration) {
        self.root.cancel();
        let mut pipelines = self.pipelines.lock().await;
        for (id, handle) in pipelines.drain() {
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(deadline, handle.task).await.is_err() {
                tracing::warn!(subscription_id = %id, "pipeline did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Composes the decoder set by variance: events and instructions always,
/// the token decoder only when one of its feature flags is on.
pub fn build_decoders(
    enabled: &EnabledSet,
    features: FeatureFlags,
) -> Vec<Box<dyn TransactionDecoder>> {
    let mut decoders: Vec<Box<dyn TransactionDecoder>> = vec![
        Box::new(EventDecoder::new(enabled.events.clone())),
        Box::new(InstructionDecoder::new(enabled.instructions.clone())),
    ];
    if features.cpi_transfers || features.balance_deltas {
        decoders.push(Box::new(TokenDecoder {
            cpi_transfers: features.cpi_transfers,
            balance_deltas: features.balance_deltas,
        }));
    }
    decoders
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_decoder_is_gated_by_feature_flags() {
        let enabled = EnabledSet::default();
        assert_eq!(build_decoders(&enabled, FeatureFlags::default()).len(), 2);
        assert_eq!(
            build_decoders(
                &enabled,
                FeatureFlags {
                    cpi_transfers: true,
                    balance_deltas: false,
                }
            )
            .len(),
            3
        );
    }
}

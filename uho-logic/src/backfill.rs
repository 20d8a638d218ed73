//! Bounded slot-range backfill jobs. A job walks signatures backwards from
//! the chain head, replays the window oldest-first through the same decode
//! and write path as the live pipeline, and reports progress while staying
//! cancellable between transactions.

use crate::{
    decode::{self, TransactionDecoder},
    error::ServiceError,
    metrics,
    pipeline::writer::{TxLogRow, Writer},
    repository::{self, backfill_jobs::NewJob},
    rpc::{types::SignatureInfo, SignaturesRequest, SolanaRpcClient, MAX_SIGNATURE_PAGE_LIMIT},
};
use parking_lot::Mutex;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_with::serde_as;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uho_entity::{
    backfill_jobs::Model as Job, program_subscriptions::Model as Subscription,
    sea_orm_active_enums::BackfillStatus,
};
use uuid::Uuid;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackfillSettings {
    /// Hard cap on how far behind the chain head a demo-tier range may start.
    #[serde(default = "default_demo_max_slots")]
    pub demo_max_slots: u64,
    /// Per-request throttle against rpc rate limits.
    #[serde(default = "default_request_delay")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub request_delay: Duration,
    #[serde(default = "default_progress_interval")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub progress_interval: Duration,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

fn default_demo_max_slots() -> u64 {
    10_000
}

fn default_request_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_page_limit() -> usize {
    MAX_SIGNATURE_PAGE_LIMIT
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            demo_max_slots: default_demo_max_slots(),
            request_delay: default_request_delay(),
            progress_interval: default_progress_interval(),
            page_limit: default_page_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestedRange {
    pub start_slot: Option<u64>,
    pub end_slot: Option<u64>,
}

/// Decode/write half of a job, built by the caller from the owning
/// subscription.
pub struct BackfillContext {
    pub writer: Writer,
    pub decoders: Vec<Box<dyn TransactionDecoder>>,
}

/// A requested start of 0 (or none) means "as far back as permitted" and
/// clamps to the demo floor; an explicit start below the floor is refused.
pub(crate) fn effective_range(
    settings: &BackfillSettings,
    chain_slot: u64,
    range: &RequestedRange,
) -> Result<(u64, u64), ServiceError> {
    let end = range.end_slot.unwrap_or(chain_slot).min(chain_slot);
    let floor = chain_slot.saturating_sub(settings.demo_max_slots);
    let start = match range.start_slot {
        None | Some(0) => floor,
        Some(start) if start < floor => {
            return Err(ServiceError::DemoLimit {
                max_slots: settings.demo_max_slots,
            })
        }
        Some(start) => start,
    };
    if start > end {
        return Err(ServiceError::Validation(format!(
            "backfill range is empty: start {start} > end {end}"
        )));
    }
    Ok((start, end))
}

pub struct BackfillManager {
    db: Arc<DatabaseConnection>,
    rpc: Arc<SolanaRpcClient>,
    settings: BackfillSettings,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl BackfillManager {
    pub fn new(
        db: Arc<DatabaseConnection>,
        rpc: Arc<SolanaRpcClient>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            db,
            rpc,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        subscription: &Subscription,
        range: RequestedRange,
    ) -> Result<Job, ServiceError> {
        let chain_slot = self.rpc.get_current_slot().await?;
        let (start_slot, end_slot) = effective_range(&self.settings, chain_slot, &range)?;
        let job = repository::backfill_jobs::create(
            self.db.as_ref(),
            NewJob {
                subscription_id: subscription.id,
                tenant_id: subscription.tenant_id,
                start_slot: start_slot as i64,
                end_slot: end_slot as i64,
                events_found: 0,
                events_skipped: 0,
            },
        )
        .await?;
        tracing::info!(job_id = %job.id, start_slot, end_slot, "backfill job created");
        Ok(job)
    }

    /// Spawns the runner for a pending job.
    pub fn start(
        self: &Arc<Self>,
        job: Job,
        context: BackfillContext,
        parent: &CancellationToken,
    ) -> CancellationToken {
        let cancel = parent.child_token();
        self.running.lock().insert(job.id, cancel.clone());
        let manager = self.clone();
        let runner_cancel = cancel.clone();
        tokio::spawn(async move {
            manager.run_job(job, context, runner_cancel).await;
        });
        cancel
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<(), ServiceError> {
        let job = self.status(job_id).await?;
        if let Some(token) = self.running.lock().get(&job_id) {
            token.cancel();
        }
        if matches!(job.status, BackfillStatus::Pending) {
            // never started, so the runner will not write the terminal state
            repository::backfill_jobs::finish(
                self.db.as_ref(),
                job_id,
                BackfillStatus::Cancelled,
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Creates a fresh job resuming from the prior run's cursor; counters
    /// carry over, progress restarts.
    pub async fn retry(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        let prior = self.status(job_id).await?;
        if !matches!(
            prior.status,
            BackfillStatus::Failed | BackfillStatus::Cancelled
        ) {
            return Err(ServiceError::Validation(format!(
                "backfill job {job_id} is not in a retryable state"
            )));
        }
        let job = repository::backfill_jobs::create(
            self.db.as_ref(),
            NewJob {
                subscription_id: prior.subscription_id,
                tenant_id: prior.tenant_id,
                start_slot: prior.current_slot.unwrap_or(prior.start_slot),
                end_slot: prior.end_slot,
                events_found: prior.events_found,
                events_skipped: prior.events_skipped,
            },
        )
        .await?;
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        repository::backfill_jobs::get(self.db.as_ref(), job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("backfill job {job_id}")))
    }

    #[tracing::instrument(name = "backfill", skip_all, fields(job_id = %job.id))]
    async fn run_job(&self, job: Job, context: BackfillContext, cancel: CancellationToken) {
        let job_id = job.id;
        let outcome = self.execute(&job, &context, &cancel).await;
        self.running.lock().remove(&job_id);

        let (status, error) = match outcome {
            Ok(JobOutcome::Completed) => (BackfillStatus::Completed, None),
            Ok(JobOutcome::Cancelled) => (BackfillStatus::Cancelled, None),
            Err(err) => {
                tracing::error!(error = %err, "backfill job failed");
                (BackfillStatus::Failed, Some(err.to_string()))
            }
        };
        let label = match status {
            BackfillStatus::Completed => "completed",
            BackfillStatus::Cancelled => "cancelled",
            _ => "failed",
        };
        metrics::BACKFILL_JOBS_TOTAL.with_label_values(&[label]).inc();
        if let Err(err) =
            repository::backfill_jobs::finish(self.db.as_ref(), job_id, status, error).await
        {
            tracing::error!(error = %err, "failed to record backfill terminal state");
        }
    }

    async fn execute(
        &self,
        job: &Job,
        context: &BackfillContext,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, ServiceError> {
        repository::backfill_jobs::mark_running(self.db.as_ref(), job.id).await?;

        let Some(signatures) = self.collect_window(job, context, cancel).await? else {
            return Ok(JobOutcome::Cancelled);
        };
        let total = signatures.len().max(1);
        tracing::info!(signatures = signatures.len(), "backfill window collected");

        let mut events_found = job.events_found;
        let mut events_skipped = job.events_skipped;
        let mut progress = 0f64;
        let mut last_report = Instant::now();

        for (position, info) in signatures.iter().enumerate() {
            if cancel.is_cancelled() {
                repository::backfill_jobs::update_progress(
                    self.db.as_ref(),
                    job.id,
                    info.slot as i64,
                    progress,
                    events_found,
                    events_skipped,
                )
                .await?;
                return Ok(JobOutcome::Cancelled);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(JobOutcome::Cancelled),
                _ = tokio::time::sleep(self.settings.request_delay) => {}
            }

            let Some(tx) = self.rpc.get_parsed_transaction(&info.signature).await? else {
                events_skipped += 1;
                continue;
            };
            let descriptor = context.writer.descriptor().clone();
            let batch = decode::decode_transaction(&context.decoders, &descriptor, &tx);
            events_found += batch.events.len() as i64;
            events_skipped += batch.skipped as i64;

            let raw_logs = if tx.log_messages().is_empty() {
                Vec::new()
            } else {
                vec![TxLogRow {
                    tx_signature: info.signature.clone(),
                    slot: info.slot,
                    log_messages: tx.log_messages().to_vec(),
                }]
            };
            // the live checkpoint is not advanced by historical replays
            context.writer.write_batch(&batch, &raw_logs, None).await?;

            progress = progress.max((position + 1) as f64 / total as f64);
            if last_report.elapsed() >= self.settings.progress_interval {
                repository::backfill_jobs::update_progress(
                    self.db.as_ref(),
                    job.id,
                    info.slot as i64,
                    progress,
                    events_found,
                    events_skipped,
                )
                .await?;
                last_report = Instant::now();
            }
        }

        repository::backfill_jobs::update_progress(
            self.db.as_ref(),
            job.id,
            job.end_slot,
            1.0,
            events_found,
            events_skipped,
        )
        .await?;
        Ok(JobOutcome::Completed)
    }

    /// Walks signatures backwards from the chain head with the `before`
    /// cursor, keeping successful transactions inside the slot window, and
    /// stops as soon as a page reaches below `start_slot`. Returns `None`
    /// on cancellation; the result is chronological.
    async fn collect_window(
        &self,
        job: &Job,
        context: &BackfillContext,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<SignatureInfo>>, ServiceError> {
        let program_id = &context.writer.descriptor().program_id;
        let start_slot = job.start_slot.max(0) as u64;
        let end_slot = job.end_slot.max(0) as u64;
        let limit = self.settings.page_limit.clamp(1, MAX_SIGNATURE_PAGE_LIMIT);

        let mut collected: Vec<SignatureInfo> = Vec::new();
        let mut before: Option<String> = None;
        'pages: loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .rpc
                .get_signatures_for_address(
                    program_id,
                    &SignaturesRequest {
                        limit,
                        before: before.clone(),
                        until: None,
                    },
                )
                .await?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() == limit;
            before = page.last().map(|info| info.signature.clone());
            for info in page {
                if info.slot < start_slot {
                    break 'pages;
                }
                if info.slot <= end_slot && info.err.is_none() {
                    collected.push(info);
                }
            }
            if !full_page {
                break;
            }
        }

        collected.reverse();
        Ok(Some(collected))
    }
}

enum JobOutcome {
    Completed,
    Cancelled,
}

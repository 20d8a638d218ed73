//! Per-program live loop: pages new signatures from the checkpoint cursor,
//! fetches and decodes the transactions, and hands the rows to the writer.
//! Cancellation is observed between every logical step.

use super::writer::{CheckpointAdvance, CheckpointState, TxLogRow, Writer};
use crate::{
    decode::{self, TransactionDecoder},
    error::ServiceError,
    metrics,
    rpc::{types::SignatureInfo, SignaturesRequest, SolanaRpcClient, MAX_SIGNATURE_PAGE_LIMIT},
};
use serde::Deserialize;
use serde_with::serde_as;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_batch_size() -> usize {
    MAX_SIGNATURE_PAGE_LIMIT
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

pub struct Poller {
    rpc: Arc<SolanaRpcClient>,
    writer: Writer,
    decoders: Vec<Box<dyn TransactionDecoder>>,
    settings: PollerSettings,
    last_signature: Option<String>,
    last_slot: u64,
}

impl Poller {
    pub fn new(
        rpc: Arc<SolanaRpcClient>,
        writer: Writer,
        decoders: Vec<Box<dyn TransactionDecoder>>,
        settings: PollerSettings,
        checkpoint: Option<&CheckpointState>,
    ) -> Self {
        Self {
            rpc,
            writer,
            decoders,
            settings,
            last_signature: checkpoint.and_then(|c| c.last_signature.clone()),
            last_slot: checkpoint.map(|c| c.last_slot.max(0) as u64).unwrap_or(0),
        }
    }

    pub fn last_slot(&self) -> u64 {
        self.last_slot
    }

    #[instrument(name = "poller", skip_all, fields(program_id = %self.writer.descriptor().program_id))]
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.poll_once(&cancel).await {
                Ok(()) => {}
                Err(ServiceError::Rpc(err)) if err.is_transient() => {
                    // checkpoint untouched; the same signatures come back
                    // on the next tick
                    tracing::warn!(error = %err, "transient rpc failure, retrying next tick");
                }
                Err(ServiceError::Db(err)) => {
                    tracing::error!(error = %err, "fatal write failure, stopping pipeline");
                    if let Err(err) = self
                        .writer
                        .set_status("error", Some(&err.to_string()))
                        .await
                    {
                        tracing::error!(error = %err, "failed to record pipeline error state");
                    }
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "poll iteration failed");
                }
            }
        }
        tracing::debug!("poller stopped");
    }

    /// One tick: collect the signatures newer than the checkpoint, oldest
    /// first, and run each matched transaction through decode and write.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let signatures = self.collect_new_signatures(cancel).await?;

        for info in signatures {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if info.err.is_some() {
                // failed transactions advance the cursor but write nothing
                self.advance(&info);
                continue;
            }
            let Some(tx) = self.rpc.get_parsed_transaction(&info.signature).await? else {
                // not yet visible at this commitment; stop here so the
                // checkpoint does not move past it
                break;
            };

            let descriptor = self.writer.descriptor().clone();
            let batch = decode::decode_transaction(&self.decoders, &descriptor, &tx);
            if batch.skipped > 0 {
                metrics::DECODE_SKIPS_TOTAL
                    .with_label_values(&[descriptor.program_name.as_str()])
                    .inc_by(batch.skipped);
            }
            let raw_logs = if tx.log_messages().is_empty() {
                Vec::new()
            } else {
                vec![TxLogRow {
                    tx_signature: info.signature.clone(),
                    slot: info.slot,
                    log_messages: tx.log_messages().to_vec(),
                }]
            };

            self.writer
                .write_batch(
                    &batch,
                    &raw_logs,
                    Some(CheckpointAdvance {
                        last_slot: info.slot as i64,
                        last_signature: info.signature.clone(),
                        events_delta: batch.events.len() as i64,
                    }),
                )
                .await?;
            self.advance(&info);
        }

        self.writer.touch_poll_time().await?;
        Ok(())
    }

    /// Pages `getSignaturesForAddress` newest-first until an empty or short
    /// page, then reverses so the result is chronological. A page of exactly
    /// `batch_size` triggers exactly one more fetch.
    async fn collect_new_signatures(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<SignatureInfo>, ServiceError> {
        let limit = self.settings.batch_size.clamp(1, MAX_SIGNATURE_PAGE_LIMIT);
        let mut collected: Vec<SignatureInfo> = Vec::new();
        let mut before: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let page = self
                .rpc
                .get_signatures_for_address(
                    &self.writer.descriptor().program_id,
                    &SignaturesRequest {
                        limit,
                        before: before.clone(),
                        until: self.last_signature.clone(),
                    },
                )
                .await?;
            let full_page = page.len() == limit;
            before = page.last().map(|info| info.signature.clone());
            collected.extend(page);
            if !full_page {
                break;
            }
        }

        collected.reverse();
        Ok(collected)
    }

    fn advance(&mut self, info: &SignatureInfo) {
        self.last_signature = Some(info.signature.clone());
        // monotone per poller
        self.last_slot = self.last_slot.max(info.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::events::EventDecoder,
        fanout::FanoutBus,
        idl::descriptor::ProgramDescriptor,
        pipeline::writer::Writer,
        rpc::RpcSettings,
    };
    use sea_orm::DatabaseConnection;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    fn descriptor() -> Arc<ProgramDescriptor> {
        Arc::new(ProgramDescriptor {
            program_id: "Prog11111111111111111111111111111111111111".into(),
            program_name: "p".into(),
            events: vec![],
            instructions: vec![],
            accounts: vec![],
            types: BTreeMap::new(),
        })
    }

    fn poller(server_uri: &str, last_signature: Option<&str>) -> Poller {
        let mut settings = RpcSettings::new(server_uri.parse().unwrap());
        settings.retry_base_delay = Duration::from_millis(1);
        let rpc = Arc::new(SolanaRpcClient::new(settings));
        let writer = Writer::new(
            Arc::new(DatabaseConnection::Disconnected),
            "u_abc00001".into(),
            descriptor(),
            Arc::new(FanoutBus::new(8)),
            vec![],
        );
        let mut poller = Poller::new(
            rpc,
            writer,
            vec![Box::new(EventDecoder::new(BTreeSet::new()))],
            PollerSettings {
                poll_interval: Duration::from_millis(10),
                batch_size: 2,
            },
            None,
        );
        poller.last_signature = last_signature.map(str::to_string);
        poller
    }

    #[tokio::test]
    async fn a_full_page_triggers_exactly_one_more_fetch() {
        let server = MockServer::start().await;
        // first page: exactly `limit` entries; second page: short
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "getSignaturesForAddress",
                "params": [
                    "Prog11111111111111111111111111111111111111",
                    { "limit": 2, "before": "sig3" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": [ { "signature": "sig2", "slot": 8, "err": null } ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getSignaturesForAddress" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": [
                    { "signature": "sig4", "slot": 10, "err": null },
                    { "signature": "sig3", "slot": 9, "err": null }
                ]
            })))
            .mount(&server)
            .await;

        let poller = poller(&server.uri(), Some("sig1"));
        let cancel = CancellationToken::new();
        let collected = poller.collect_new_signatures(&cancel).await.unwrap();

        // chronological after reversal
        let signatures: Vec<_> = collected.iter().map(|s| s.signature.as_str()).collect();
        assert_eq!(signatures, vec!["sig2", "sig3", "sig4"]);
    }

    #[tokio::test]
    async fn an_empty_result_collects_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let poller = poller(&server.uri(), None);
        let collected = poller
            .collect_new_signatures(&CancellationToken::new())
            .await
            .unwrap();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": []
            })))
            .expect(0)
            .mount(&server)
            .await;

        let poller = poller(&server.uri(), None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let collected = poller.collect_new_signatures(&cancel).await.unwrap();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn advance_keeps_last_slot_monotone() {
        let info_high = SignatureInfo {
            signature: "a".into(),
            slot: 100,
            err: None,
            block_time: None,
        };
        let info_low = SignatureInfo {
            signature: "b".into(),
            slot: 50,
            err: None,
            block_time: None,
        };
        let server = MockServer::start().await;
        let mut poller = poller(&server.uri(), None);
        poller.advance(&info_high);
        poller.advance(&info_low);
        assert_eq!(poller.last_slot(), 100);
        assert_eq!(poller.last_signature.as_deref(), Some("b"));
    }
}

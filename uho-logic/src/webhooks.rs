//! Webhook dispatcher: matches fanout messages to registered endpoints,
//! signs payloads with HMAC-SHA256, and delivers with an exponential retry
//! schedule. Persistent failure disables the endpoint.

use crate::{
    error::ServiceError,
    fanout::{FanoutBus, FanoutMessage},
    metrics, repository,
};
use hmac::{Hmac, Mac};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::serde_as;
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uho_entity::webhooks::Model as Webhook;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WebhookSettings {
    #[serde(default = "default_timeout")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Attempt offsets from the first try; the distance between entries is
    /// the sleep before the next attempt.
    #[serde(default = "default_retry_schedule")]
    #[serde_as(as = "Vec<serde_with::DurationMilliSeconds<u64>>")]
    pub retry_schedule: Vec<Duration>,
    #[serde(default = "default_disable_threshold")]
    pub disable_threshold: i32,
    /// Plain-http endpoints are only accepted outside production.
    #[serde(default)]
    pub allow_insecure_urls: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_schedule() -> Vec<Duration> {
    [0u64, 30, 120, 600, 3600]
        .into_iter()
        .map(Duration::from_secs)
        .collect()
}

fn default_disable_threshold() -> i32 {
    10
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            request_timeout: default_timeout(),
            retry_schedule: default_retry_schedule(),
            disable_threshold: default_disable_threshold(),
            allow_insecure_urls: false,
        }
    }
}

/// Wire payload; field names and the timestamp format are part of the
/// external contract.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub id: String,
    pub event: String,
    #[serde(rename = "programId")]
    pub program_id: String,
    pub data: Map<String, Value>,
    pub slot: u64,
    #[serde(rename = "txSignature")]
    pub tx_signature: String,
    pub timestamp: String,
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn validate_url(url: &str, allow_insecure: bool) -> Result<(), ServiceError> {
    let parsed = url::Url::parse(url)
        .map_err(|err| ServiceError::Validation(format!("invalid webhook url: {err}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if allow_insecure => Ok(()),
        scheme => Err(ServiceError::Validation(format!(
            "webhook url scheme {scheme:?} is not allowed"
        ))),
    }
}

pub struct WebhookDispatcher {
    db: Arc<DatabaseConnection>,
    http: reqwest::Client,
    settings: WebhookSettings,
}

impl WebhookDispatcher {
    pub fn new(db: Arc<DatabaseConnection>, settings: WebhookSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .expect("failed to initialize webhook http client");
        Self { db, http, settings }
    }

    /// Consumes the bus firehose until cancelled.
    pub fn spawn(self: Arc<Self>, bus: &FanoutBus, cancel: CancellationToken) -> JoinHandle<()> {
        let receiver = bus.subscribe_all();
        tokio::spawn(self.run(receiver, cancel))
    }

    async fn run(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<FanoutMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = receiver.recv() => message,
            };
            match message {
                Ok(message) => {
                    if let Err(err) = self.fan_out(message, &cancel).await {
                        tracing::error!(error = %err, "failed to match webhooks for message");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    metrics::FANOUT_DROPPED_TOTAL.inc_by(missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Finds the endpoints this message should reach and spawns one
    /// delivery task per endpoint; deliveries retry independently.
    async fn fan_out(
        self: &Arc<Self>,
        message: FanoutMessage,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let subscriptions =
            repository::subscriptions::list_by_program(self.db.as_ref(), &message.program_id)
                .await?;
        let subscription_ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
        let webhooks = repository::webhooks::find_active(
            self.db.as_ref(),
            &subscription_ids,
            &message.subscribers,
        )
        .await?;

        for webhook in webhooks {
            if !matches(&webhook, &message) {
                continue;
            }
            let dispatcher = self.clone();
            let message = message.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.dispatch_to(webhook, message, cancel).await;
            });
        }
        Ok(())
    }

    async fn dispatch_to(
        &self,
        webhook: Webhook,
        message: FanoutMessage,
        cancel: CancellationToken,
    ) {
        match self.deliver(&webhook, &message, &cancel).await {
            Some(true) => {
                metrics::WEBHOOK_DELIVERIES_TOTAL.inc();
                if let Err(err) =
                    repository::webhooks::record_success(self.db.as_ref(), webhook.id).await
                {
                    tracing::error!(error = %err, webhook_id = %webhook.id, "failed to record webhook success");
                }
            }
            Some(false) => {
                tracing::warn!(webhook_id = %webhook.id, url = %webhook.url, "webhook delivery gave up");
                if let Err(err) = repository::webhooks::record_failure(
                    self.db.as_ref(),
                    webhook.id,
                    self.settings.disable_threshold,
                )
                .await
                {
                    tracing::error!(error = %err, webhook_id = %webhook.id, "failed to record webhook failure");
                }
            }
            // cancelled mid-flight; neither success nor failure
            None => {}
        }
    }

    /// Runs the retry schedule against one endpoint. `Some(true)` on a 2xx,
    /// `Some(false)` when every attempt failed, `None` when cancelled.
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        message: &FanoutMessage,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let delivery_id = Uuid::new_v4();
        let payload = WebhookPayload {
            id: format!("del_{}", delivery_id.simple()),
            event: message.event_name.clone(),
            program_id: message.program_id.clone(),
            data: message.data.clone(),
            slot: message.slot,
            tx_signature: message.tx_signature.clone(),
            timestamp: message
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };
        let body = serde_json::to_vec(&payload).expect("payload serializes");
        let signature = sign(&webhook.secret, &body);
        let unix_timestamp = message.timestamp.timestamp();

        let mut previous_offset = Duration::ZERO;
        for (attempt, offset) in self.settings.retry_schedule.iter().enumerate() {
            let delay = offset.saturating_sub(previous_offset);
            previous_offset = *offset;
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .attempt(webhook, &body, &signature, &payload.event, delivery_id, unix_timestamp)
                .await
            {
                Ok(()) => return Some(true),
                Err(err) => {
                    metrics::WEBHOOK_FAILURES_TOTAL.inc();
                    tracing::debug!(
                        webhook_id = %webhook.id,
                        attempt,
                        error = %err,
                        "webhook delivery attempt failed"
                    );
                }
            }
        }
        Some(false)
    }

    async fn attempt(
        &self,
        webhook: &Webhook,
        body: &[u8],
        signature: &str,
        event: &str,
        delivery_id: Uuid,
        unix_timestamp: i64,
    ) -> Result<(), anyhow::Error> {
        let response = self
            .http
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Uho-Signature", signature)
            .header("X-Uho-Event", event)
            .header("X-Uho-Delivery-Id", delivery_id.to_string())
            .header("X-Uho-Timestamp", unix_timestamp.to_string())
            .body(body.to_vec())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            anyhow::bail!("endpoint answered {status}")
        }
    }
}

/// A non-empty event filter is an inclusion list; the field filter is
/// equality on top-level data fields.
pub fn matches(webhook: &Webhook, message: &FanoutMessage) -> bool {
    if !webhook.event_filter.is_empty()
        && !webhook.event_filter.contains(&message.event_name)
    {
        return false;
    }
    match &webhook.field_filter {
        Some(Value::Object(expected)) => expected
            .iter()
            .all(|(key, value)| message.data.get(key) == Some(value)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::{
        matchers::{header_exists, method, path},
        Mock, MockServer, Request, Respond, ResponseTemplate,
    };

    fn webhook(url: &str, events: Vec<String>, fields: Option<Value>) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            url: url.to_string(),
            secret: "whsec_test".to_string(),
            event_filter: events,
            field_filter: fields,
            active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at: Utc::now().into(),
        }
    }

    fn message(event: &str) -> FanoutMessage {
        let mut data = Map::new();
        data.insert("amount".to_string(), json!(1500));
        FanoutMessage {
            program_id: "Prog".to_string(),
            event_name: event.to_string(),
            slot: 200,
            tx_signature: "tx_S".to_string(),
            data,
            subscribers: vec![],
            timestamp: Utc::now(),
        }
    }

    fn dispatcher(schedule_ms: &[u64]) -> WebhookDispatcher {
        WebhookDispatcher::new(
            Arc::new(sea_orm::DatabaseConnection::Disconnected),
            WebhookSettings {
                request_timeout: Duration::from_secs(2),
                retry_schedule: schedule_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
                disable_threshold: 10,
                allow_insecure_urls: true,
            },
        )
    }

    #[test]
    fn signature_matches_the_reference_hmac_vector() {
        assert_eq!(
            sign("key", b"The quick brown fox jumps over the lazy dog"),
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn empty_event_filter_matches_everything() {
        let hook = webhook("https://example.com/hook", vec![], None);
        assert!(matches(&hook, &message("swap_event")));
        assert!(matches(&hook, &message("anything_else")));
    }

    #[test]
    fn named_event_filter_is_an_inclusion_list() {
        let hook = webhook(
            "https://example.com/hook",
            vec!["swap_event".to_string()],
            None,
        );
        assert!(matches(&hook, &message("swap_event")));
        assert!(!matches(&hook, &message("fee_event")));
    }

    #[test]
    fn field_filter_compares_top_level_data() {
        let hook = webhook(
            "https://example.com/hook",
            vec![],
            Some(json!({ "amount": 1500 })),
        );
        assert!(matches(&hook, &message("swap_event")));

        let other = webhook(
            "https://example.com/hook",
            vec![],
            Some(json!({ "amount": 9 })),
        );
        assert!(!matches(&other, &message("swap_event")));
    }

    #[test]
    fn production_mode_accepts_only_https() {
        validate_url("https://example.com/hook", false).unwrap();
        assert!(validate_url("http://example.com/hook", false).is_err());
        validate_url("http://localhost:9999/hook", true).unwrap();
        assert!(validate_url("ftp://example.com", true).is_err());
        assert!(validate_url("not a url", true).is_err());
    }

    #[tokio::test]
    async fn delivery_retries_until_the_endpoint_recovers() {
        struct FailTwice(AtomicU32);
        impl Respond for FailTwice {
            fn respond(&self, _: &Request) -> ResponseTemplate {
                if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(500)
                } else {
                    ResponseTemplate::new(200)
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Uho-Signature"))
            .and(header_exists("X-Uho-Event"))
            .and(header_exists("X-Uho-Delivery-Id"))
            .and(header_exists("X-Uho-Timestamp"))
            .respond_with(FailTwice(AtomicU32::new(0)))
            .expect(3)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&[0, 20, 40, 60, 80]);
        let hook = webhook(&format!("{}/hook", server.uri()), vec![], None);
        let outcome = dispatcher
            .deliver(&hook, &message("swap_event"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Some(true));
    }

    #[tokio::test]
    async fn delivery_gives_up_after_the_schedule_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&[0, 10, 20]);
        let hook = webhook(&server.uri(), vec![], None);
        let outcome = dispatcher
            .deliver(&hook, &message("swap_event"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Some(false));
    }

    #[tokio::test]
    async fn cancellation_stops_the_retry_loop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&[0, 60_000]);
        let hook = webhook(&server.uri(), vec![], None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = dispatcher.deliver(&hook, &message("swap_event"), &cancel).await;
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn payload_body_matches_the_wire_contract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&[0]);
        let hook = webhook(&server.uri(), vec![], None);
        let msg = message("swap_event");
        dispatcher
            .deliver(&hook, &msg, &CancellationToken::new())
            .await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["id"].as_str().unwrap().starts_with("del_"));
        assert_eq!(body["event"], "swap_event");
        assert_eq!(body["programId"], "Prog");
        assert_eq!(body["slot"], 200);
        assert_eq!(body["txSignature"], "tx_S");
        assert_eq!(body["data"]["amount"], 1500);
        // the signature covers the exact body bytes
        let signature = requests[0]
            .headers
            .get("X-Uho-Signature")
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(signature, sign("whsec_test", &requests[0].body));
    }
}

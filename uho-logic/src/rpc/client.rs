use super::{
    types::{ParsedTransaction, SignatureInfo},
    RpcError,
};
use crate::metrics;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use serde_with::serde_as;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

pub const MAX_SIGNATURE_PAGE_LIMIT: usize = 1000;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RpcSettings {
    pub url: Url,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(250)
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self::new(
            Url::parse("http://localhost:8899").expect("static url parses"),
        )
    }
}

impl RpcSettings {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            commitment: default_commitment(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignaturesRequest {
    /// Page size, clamped to [`MAX_SIGNATURE_PAGE_LIMIT`].
    pub limit: usize,
    /// Start paging backwards from this signature (exclusive).
    pub before: Option<String>,
    /// Stop at this signature (exclusive); used as the checkpoint cursor.
    pub until: Option<String>,
}

pub struct SolanaRpcClient {
    http: reqwest::Client,
    settings: RpcSettings,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

impl SolanaRpcClient {
    pub fn new(settings: RpcSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .expect("failed to initialize rpc http client");
        Self { http, settings }
    }

    pub fn commitment(&self) -> &str {
        &self.settings.commitment
    }

    pub async fn get_current_slot(&self) -> Result<u64, RpcError> {
        self.request(
            "getSlot",
            json!([{ "commitment": self.settings.commitment }]),
        )
        .await
    }

    /// Newest-first page of signatures touching `address`. Paginating with
    /// the `before` cursor is the caller's responsibility.
    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        request: &SignaturesRequest,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let mut config = serde_json::Map::new();
        config.insert(
            "limit".into(),
            json!(request.limit.clamp(1, MAX_SIGNATURE_PAGE_LIMIT)),
        );
        config.insert("commitment".into(), json!(self.settings.commitment));
        if let Some(before) = &request.before {
            config.insert("before".into(), json!(before));
        }
        if let Some(until) = &request.until {
            config.insert("until".into(), json!(until));
        }
        self.request("getSignaturesForAddress", json!([address, config]))
            .await
    }

    /// `None` means the transaction is not yet visible at the configured
    /// commitment; the caller re-tries it on the next poll.
    pub async fn get_parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ParsedTransaction>, RpcError> {
        self.request(
            "getTransaction",
            json!([signature, {
                "encoding": "jsonParsed",
                "maxSupportedTransactionVersion": 0,
                "commitment": self.settings.commitment,
            }]),
        )
        .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .http
                .post(self.settings.url.clone())
                .json(&body)
                .send()
                .await;
            let error = match result {
                Ok(response) if response.status().is_server_error() => {
                    RpcError::Status(response.status().as_u16())
                }
                Ok(response) => break response,
                Err(err) => RpcError::Transport(err),
            };
            if attempt >= self.settings.max_retries {
                return Err(error);
            }
            let delay = self.settings.retry_base_delay * 2u32.pow(attempt);
            tracing::debug!(method, attempt, ?delay, error = %error, "retrying rpc request");
            metrics::RPC_RETRIES_TOTAL.inc();
            sleep(delay).await;
            attempt += 1;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }
        let response: JsonRpcResponse = response.json().await?;
        if let Some(error) = response.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|err| RpcError::InvalidResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, Respond, ResponseTemplate,
    };

    fn client(server_url: &str, retry_delay_ms: u64) -> SolanaRpcClient {
        let mut settings = RpcSettings::new(server_url.parse().unwrap());
        settings.retry_base_delay = Duration::from_millis(retry_delay_ms);
        SolanaRpcClient::new(settings)
    }

    #[tokio::test]
    async fn fetches_current_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({ "method": "getSlot" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": 123_456_789u64
            })))
            .mount(&server)
            .await;

        let slot = client(&server.uri(), 1).get_current_slot().await.unwrap();
        assert_eq!(slot, 123_456_789);
    }

    #[tokio::test]
    async fn retries_server_errors_with_backoff() {
        struct FlakyResponder;
        impl Respond for FlakyResponder {
            fn respond(&self, _: &wiremock::Request) -> ResponseTemplate {
                use std::sync::atomic::{AtomicU32, Ordering};
                static CALLS: AtomicU32 = AtomicU32::new(0);
                if CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(502)
                } else {
                    ResponseTemplate::new(200).set_body_json(json!({
                        "jsonrpc": "2.0", "id": 1, "result": 42u64
                    }))
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(FlakyResponder)
            .expect(3)
            .mount(&server)
            .await;

        let slot = client(&server.uri(), 1).get_current_slot().await.unwrap();
        assert_eq!(slot, 42);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4) // initial attempt + 3 retries
            .mount(&server)
            .await;

        let err = client(&server.uri(), 1).get_current_slot().await.unwrap_err();
        assert!(matches!(err, RpcError::Status(503)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rpc_error_objects_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": { "code": -32602, "message": "invalid params" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server.uri(), 1).get_current_slot().await.unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: -32602, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn null_transaction_is_not_yet_visible() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getTransaction" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": null
            })))
            .mount(&server)
            .await;

        let tx = client(&server.uri(), 1)
            .get_parsed_transaction("sig")
            .await
            .unwrap();
        assert!(tx.is_none());
    }

    #[tokio::test]
    async fn signature_requests_carry_cursors_and_clamped_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "getSignaturesForAddress",
                "params": [
                    "Prog1111111111111111111111111111",
                    { "limit": 1000, "before": "sigB", "until": "sigU" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": [
                    { "signature": "sig1", "slot": 10, "err": null, "blockTime": 1700000000 }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let signatures = client(&server.uri(), 1)
            .get_signatures_for_address(
                "Prog1111111111111111111111111111",
                &SignaturesRequest {
                    limit: 5000,
                    before: Some("sigB".into()),
                    until: Some("sigU".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].signature, "sig1");
        assert_eq!(signatures[0].slot, 10);
    }
}

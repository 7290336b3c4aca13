use crate::chains::ChainEndpointTable;
use crate::errors::{Result, RpcProxyError, StartupError};
use crate::jsonrpc::RpcCallRequest;
use crate::metrics_defs::{BATCH_SIZE, UPSTREAM_CALLS, UPSTREAM_DURATION};
use http::header::{ACCEPT, HeaderValue};
use hyper::body::Bytes;
use serde::de::IgnoredAny;
use serde_json::Value;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Forwards validated JSON-RPC calls to the upstream provider of their chain.
///
/// Cheap to clone; clones share the connection pool and the chain table.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    chains: Arc<ChainEndpointTable>,
    timeout: Duration,
    batch_limit: usize,
}

impl Forwarder {
    pub fn new(
        chains: ChainEndpointTable,
        timeout: Duration,
        batch_limit: usize,
    ) -> Result<Self, StartupError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rpc-proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Forwarder {
            client,
            chains: Arc::new(chains),
            timeout,
            batch_limit,
        })
    }

    pub fn chains(&self) -> &ChainEndpointTable {
        &self.chains
    }

    /// Validates one call and forwards it, returning the upstream body
    /// verbatim. Validation and chain lookup failures never reach the
    /// network.
    pub async fn forward(&self, request: Value) -> Result<Bytes> {
        let call = RpcCallRequest::from_value(request)?;
        let chain_id = call.chain_id;

        let Some(url) = self.chains.resolve(chain_id) else {
            tracing::debug!(chain_id, "Rejecting call to unsupported chain");
            return Err(RpcProxyError::UnsupportedChain(chain_id));
        };

        let start = Instant::now();
        let result = self.send(url.clone(), &call).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(RpcProxyError::UpstreamTimeout(_)) => "timeout",
            Err(RpcProxyError::UpstreamStatus { .. }) => "upstream_status",
            Err(_) => "failed",
        };
        counter!(UPSTREAM_CALLS, "chain_id" => chain_id.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!(UPSTREAM_DURATION, "chain_id" => chain_id.to_string())
            .record(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            // The URL may embed the provider key, only the chain id is logged
            tracing::warn!(chain_id, method = %call.method, error = %e, "Upstream call failed");
        }

        result
    }

    async fn send(&self, url: url::Url, call: &RpcCallRequest) -> Result<Bytes> {
        let request = self
            .client
            .post(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(&call.envelope());

        // Dropping the future on timeout cancels the in-flight request
        let exchange = async {
            let response = request.send().await.map_err(upstream_failure)?;

            let status = response.status();
            if !status.is_success() {
                return Err(RpcProxyError::UpstreamStatus { status });
            }

            response.bytes().await.map_err(upstream_failure)
        };

        let body = timeout(self.timeout, exchange)
            .await
            .map_err(|_| RpcProxyError::UpstreamTimeout(self.timeout))??;

        serde_json::from_slice::<IgnoredAny>(&body)
            .map_err(|e| RpcProxyError::InvalidUpstreamResponse(e.to_string()))?;

        Ok(body)
    }

    /// Forwards every element concurrently and returns one outcome per
    /// element, in input order.
    ///
    /// Only an oversized batch fails as a whole, and it does so before any
    /// upstream call is made.
    pub async fn forward_batch(&self, requests: Vec<Value>) -> Result<Vec<Result<Bytes>>> {
        if requests.len() > self.batch_limit {
            return Err(RpcProxyError::BatchTooLarge {
                size: requests.len(),
                limit: self.batch_limit,
            });
        }
        histogram!(BATCH_SIZE).record(requests.len() as f64);

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let forwarder = self.clone();
                tokio::spawn(async move { forwarder.forward(request).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(index, error = %e, "Batch call task failed");
                    Err(RpcProxyError::InternalError(format!("batch task failed: {e}")))
                }
            };
            results.push(result);
        }

        Ok(results)
    }
}

/// Drops the request URL from the error, it carries the provider key.
fn upstream_failure(e: reqwest::Error) -> RpcProxyError {
    RpcProxyError::UpstreamRequestFailed(e.without_url().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockUpstream;
    use http::StatusCode;
    use serde_json::json;
    use url::Url;

    const BLOCK_NUMBER: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#;

    fn call(chain_id: u64, method: &str) -> Value {
        json!({"chainId": chain_id, "method": method, "params": []})
    }

    fn forwarder(chains: &[(u64, &MockUpstream)], timeout: Duration) -> Forwarder {
        let table = ChainEndpointTable::from_urls(
            chains
                .iter()
                .map(|(chain_id, upstream)| (*chain_id, upstream.url())),
        );
        Forwarder::new(table, timeout, 50).unwrap()
    }

    #[tokio::test]
    async fn test_forward_passes_body_through() {
        let upstream = MockUpstream::respond(StatusCode::OK, BLOCK_NUMBER).await;
        let forwarder = forwarder(&[(1, &upstream)], Duration::from_secs(5));

        let body = forwarder.forward(call(1, "eth_blockNumber")).await.unwrap();
        assert_eq!(body, Bytes::from_static(BLOCK_NUMBER.as_bytes()));

        let received = upstream.received();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0],
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []})
        );
    }

    #[tokio::test]
    async fn test_jsonrpc_error_is_not_interpreted() {
        let error_body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#;
        let upstream = MockUpstream::respond(StatusCode::OK, error_body).await;
        let forwarder = forwarder(&[(1, &upstream)], Duration::from_secs(5));

        let body = forwarder.forward(call(1, "eth_foo")).await.unwrap();
        assert_eq!(body, Bytes::from_static(error_body.as_bytes()));
    }

    #[tokio::test]
    async fn test_unsupported_chain_makes_no_call() {
        let upstream = MockUpstream::respond(StatusCode::OK, BLOCK_NUMBER).await;
        let forwarder = forwarder(&[(1, &upstream)], Duration::from_secs(5));

        let err = forwarder.forward(call(999999, "eth_blockNumber")).await.unwrap_err();
        assert!(matches!(err, RpcProxyError::UnsupportedChain(999999)));
        assert_eq!(upstream.hits(), 0);

        let err = forwarder.forward(json!({"chainId": 1})).await.unwrap_err();
        assert!(matches!(err, RpcProxyError::InvalidMethod));
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failures() {
        let unavailable = MockUpstream::respond(StatusCode::SERVICE_UNAVAILABLE, "down").await;
        let garbage = MockUpstream::respond(StatusCode::OK, "<html>").await;
        let forwarder = forwarder(&[(1, &unavailable), (10, &garbage)], Duration::from_secs(5));

        let err = forwarder.forward(call(1, "eth_blockNumber")).await.unwrap_err();
        assert!(matches!(
            err,
            RpcProxyError::UpstreamStatus {
                status: StatusCode::SERVICE_UNAVAILABLE
            }
        ));

        let err = forwarder.forward(call(10, "eth_blockNumber")).await.unwrap_err();
        assert!(matches!(err, RpcProxyError::InvalidUpstreamResponse(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_connection_failure_hides_url() {
        // Nothing listens on port 9 locally; the key must not leak into the error
        let table = ChainEndpointTable::from_urls([(
            1,
            Url::parse("http://127.0.0.1:9/v2/secret-key").unwrap(),
        )]);
        let forwarder = Forwarder::new(table, Duration::from_secs(5), 50).unwrap();

        let err = forwarder.forward(call(1, "eth_blockNumber")).await.unwrap_err();
        assert!(matches!(err, RpcProxyError::UpstreamRequestFailed(_)));
        assert!(!err.to_string().contains("secret-key"), "{err}");
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let echo = MockUpstream::echo_method().await;
        let forwarder = forwarder(&[(1, &echo), (10, &echo)], Duration::from_secs(5));

        let results = forwarder
            .forward_batch(vec![
                call(1, "first"),
                call(999999, "unsupported"),
                call(10, "third"),
                json!({"chainId": 1, "method": "broken"}),
                call(1, "fifth"),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        let method_of = |result: &Result<Bytes>| {
            let body: Value = serde_json::from_slice(result.as_ref().unwrap()).unwrap();
            body["result"].as_str().unwrap().to_string()
        };
        assert_eq!(method_of(&results[0]), "first");
        assert!(matches!(results[1], Err(RpcProxyError::UnsupportedChain(999999))));
        assert_eq!(method_of(&results[2]), "third");
        assert!(matches!(results[3], Err(RpcProxyError::InvalidParams)));
        assert_eq!(method_of(&results[4]), "fifth");
        assert_eq!(echo.hits(), 3);
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let upstream = MockUpstream::respond(StatusCode::OK, BLOCK_NUMBER).await;
        let forwarder = forwarder(&[(1, &upstream)], Duration::from_secs(5));

        let requests: Vec<Value> = (0..51).map(|_| call(1, "eth_blockNumber")).collect();
        let err = forwarder.forward_batch(requests).await.unwrap_err();
        assert!(matches!(
            err,
            RpcProxyError::BatchTooLarge {
                size: 51,
                limit: 50
            }
        ));
        assert_eq!(upstream.hits(), 0);

        let requests: Vec<Value> = (0..50).map(|_| call(1, "eth_blockNumber")).collect();
        let results = forwarder.forward_batch(requests).await.unwrap();
        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(upstream.hits(), 50);
    }

    #[tokio::test]
    async fn test_timeout_isolation() {
        let slow = MockUpstream::delayed(Duration::from_secs(5), BLOCK_NUMBER).await;
        let fast = MockUpstream::respond(StatusCode::OK, BLOCK_NUMBER).await;
        let forwarder = forwarder(&[(1, &slow), (10, &fast)], Duration::from_millis(200));

        let start = Instant::now();
        let results = forwarder
            .forward_batch(vec![call(1, "eth_blockNumber"), call(10, "eth_blockNumber")])
            .await
            .unwrap();

        // The batch finishes shortly after the per-call timeout, not the slow response
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(results[0], Err(RpcProxyError::UpstreamTimeout(_))));
        assert_eq!(
            results[0].as_ref().unwrap_err().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Bytes::from_static(BLOCK_NUMBER.as_bytes())
        );
    }

    #[tokio::test]
    async fn test_fast_call_does_not_wait_for_slow_siblings() {
        let slow = MockUpstream::delayed(Duration::from_secs(1), BLOCK_NUMBER).await;
        let fast = MockUpstream::respond(StatusCode::OK, BLOCK_NUMBER).await;
        let forwarder = forwarder(&[(1, &slow), (10, &fast)], Duration::from_secs(5));

        let start = Instant::now();
        let (batch, fast_elapsed) = tokio::join!(
            forwarder.forward_batch(vec![
                call(1, "eth_blockNumber"),
                call(1, "eth_blockNumber"),
                call(10, "eth_blockNumber"),
            ]),
            async {
                let result = forwarder.forward(call(10, "eth_blockNumber")).await;
                assert!(result.is_ok());
                start.elapsed()
            }
        );

        // The fast call completes while both slow calls are still pending
        assert!(fast_elapsed < Duration::from_millis(500), "{fast_elapsed:?}");
        let results = batch.unwrap();
        assert!(results.iter().all(Result::is_ok));
        // Slow calls overlap instead of running back to back
        assert!(start.elapsed() < Duration::from_millis(1_800));
        assert_eq!(slow.hits(), 2);
        assert_eq!(fast.hits(), 2);
    }
}

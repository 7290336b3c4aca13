use crate::chains::{ChainEndpointTable, default_chains};
use crate::config::Config;
use crate::csrf::{CsrfDecision, CsrfGuard};
use crate::errors::{Result, RpcProxyError, StartupError};
use crate::forwarder::Forwarder;
use crate::identity::resolve_identity;
use crate::jsonrpc::GatewayRequest;
use crate::metrics_defs::{RATE_LIMITED, REQUEST_DURATION, REQUESTS};
use crate::rate_limiter::{Admission, RateLimiter};
use http::header::{ALLOW, CONTENT_LENGTH, HeaderValue, RETRY_AFTER};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use shared::http::{add_no_cache_headers, json_response, raw_json_response};
use shared::{counter, histogram};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

pub const RPC_PROXY_PATH: &str = "/api/rpc-proxy";

pub type ProxyBody = BoxBody<Bytes, RpcProxyError>;

/// Serves `POST /api/rpc-proxy`.
///
/// Checks run in order: route, method, rate limit, CSRF, body size, body
/// shape. Each call of a valid request is then forwarded on its own.
pub struct Gateway {
    forwarder: Forwarder,
    limiter: Arc<RateLimiter>,
    csrf: CsrfGuard,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn new(
        forwarder: Forwarder,
        limiter: Arc<RateLimiter>,
        csrf: CsrfGuard,
        max_body_bytes: usize,
    ) -> Self {
        Gateway {
            forwarder,
            limiter,
            csrf,
            max_body_bytes,
        }
    }

    pub fn from_config(config: &Config, api_key: Option<&str>) -> Result<Self, StartupError> {
        let chains = config
            .upstream
            .chains
            .clone()
            .unwrap_or_else(default_chains);
        let table = ChainEndpointTable::build(&chains, api_key)?;
        tracing::info!(
            count = table.len(),
            chains = ?table.chain_ids(),
            "Chain endpoint table ready"
        );

        let forwarder = Forwarder::new(
            table,
            config.upstream.timeout(),
            config.upstream.batch_limit,
        )?;

        Ok(Gateway::new(
            forwarder,
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            CsrfGuard::from_config(&config.csrf),
            config.max_body_bytes,
        ))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
        peer: Option<SocketAddr>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let start = Instant::now();

        let response = match self.process(req, peer).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        };

        let status = response.status();
        counter!(REQUESTS, "status" => status.as_str().to_string()).increment(1);
        histogram!(REQUEST_DURATION).record(start.elapsed().as_secs_f64());

        response
    }

    async fn process<B>(
        &self,
        req: Request<B>,
        peer: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if req.uri().path() != RPC_PROXY_PATH {
            return Err(RpcProxyError::NotFound);
        }
        if req.method() != Method::POST {
            return Err(RpcProxyError::MethodNotAllowed);
        }

        let identity = resolve_identity(req.headers(), peer, SystemTime::now());
        if let Admission::Rejected { retry_after_secs } = self.limiter.admit(&identity) {
            tracing::debug!(%identity, retry_after_secs, "Rate limited");
            counter!(RATE_LIMITED).increment(1);
            return Err(RpcProxyError::RateLimited { retry_after_secs });
        }

        if self.csrf.check(req.headers()) == CsrfDecision::Reject {
            return Err(RpcProxyError::InvalidCsrfToken);
        }

        let body = self.read_body(req).await?;

        match GatewayRequest::parse(&body)? {
            GatewayRequest::Single(request) => {
                let body = self.forwarder.forward(request).await?;
                Ok(raw_json_response(StatusCode::OK, body))
            }
            GatewayRequest::Batch(requests) => {
                let results = self.forwarder.forward_batch(requests).await?;
                Ok(raw_json_response(StatusCode::OK, batch_body(&results)?))
            }
        }
    }

    async fn read_body<B>(&self, req: Request<B>) -> Result<Bytes>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let declared_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_length.is_some_and(|length| length > self.max_body_bytes) {
            return Err(RpcProxyError::PayloadTooLarge(self.max_body_bytes));
        }

        match Limited::new(req.into_body(), self.max_body_bytes).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(RpcProxyError::PayloadTooLarge(self.max_body_bytes))
            }
            Err(e) => Err(RpcProxyError::RequestBodyError(e.to_string())),
        }
    }
}

/// Builds `{"results": [...]}`. Upstream bodies are already valid JSON and
/// are spliced in without being re-encoded.
fn batch_body(results: &[Result<Bytes>]) -> Result<Bytes> {
    let mut body = Vec::from(&b"{\"results\":["[..]);
    for (index, result) in results.iter().enumerate() {
        if index > 0 {
            body.push(b',');
        }
        match result {
            Ok(upstream_body) => body.extend_from_slice(upstream_body),
            Err(e) => serde_json::to_writer(&mut body, &e.to_batch_entry())
                .map_err(|e| RpcProxyError::InternalError(e.to_string()))?,
        }
    }
    body.extend_from_slice(b"]}");
    Ok(Bytes::from(body))
}

fn error_response(e: &RpcProxyError) -> Response<ProxyBody> {
    let status = e.status();
    if e.is_client_error() {
        tracing::debug!(error = %e, status = status.as_u16(), "Request rejected");
    } else {
        tracing::warn!(error = %e, status = status.as_u16(), "Request failed");
    }

    let mut response = json_response(status, &e.to_body());
    let headers = response.headers_mut();
    add_no_cache_headers(headers);
    match e {
        RpcProxyError::RateLimited { retry_after_secs } => {
            headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        RpcProxyError::MethodNotAllowed => {
            headers.insert(ALLOW, HeaderValue::from_static("POST"));
        }
        _ => {}
    }
    response
}

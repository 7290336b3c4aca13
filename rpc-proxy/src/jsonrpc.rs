use crate::errors::{Result, RpcProxyError};
use serde::Serialize;
use serde_json::{Map, Value};

/// Request id sent upstream. Every call is forwarded on its own, so the value
/// carries no meaning for the caller.
pub const UPSTREAM_REQUEST_ID: u64 = 1;

/// A validated call to forward to one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCallRequest {
    pub chain_id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// JSON-RPC 2.0 envelope posted to the upstream provider.
#[derive(Debug, Serialize)]
pub struct JsonRpcEnvelope<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl RpcCallRequest {
    /// Validates `chainId`, then `method`, then `params`, reporting the first
    /// field that is missing or has the wrong shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(RpcProxyError::InvalidRequest);
        };

        let chain_id = fields
            .get("chainId")
            .and_then(Value::as_u64)
            .filter(|id| *id > 0)
            .ok_or(RpcProxyError::InvalidChainId)?;

        let method = match fields.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err(RpcProxyError::InvalidMethod),
        };

        let params = match fields.remove("params") {
            Some(Value::Array(params)) => params,
            _ => return Err(RpcProxyError::InvalidParams),
        };

        Ok(RpcCallRequest {
            chain_id,
            method,
            params,
        })
    }

    pub fn envelope(&self) -> JsonRpcEnvelope<'_> {
        JsonRpcEnvelope {
            jsonrpc: "2.0",
            id: UPSTREAM_REQUEST_ID,
            method: &self.method,
            params: &self.params,
        }
    }
}

/// Parsed body of a gateway request.
///
/// Elements are kept as raw JSON values and validated one by one while they
/// are forwarded, so a malformed element only fails its own position.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayRequest {
    Single(Value),
    Batch(Vec<Value>),
}

impl GatewayRequest {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| RpcProxyError::InvalidJson(e.to_string()))?;

        match value {
            Value::Object(mut fields) if is_batch(&fields) => match fields.remove("requests") {
                Some(Value::Array(requests)) => Ok(GatewayRequest::Batch(requests)),
                _ => Err(RpcProxyError::InvalidBatch),
            },
            value => Ok(GatewayRequest::Single(value)),
        }
    }
}

fn is_batch(fields: &Map<String, Value>) -> bool {
    fields.get("batch").and_then(Value::as_bool).unwrap_or(false)
}

//! Coin Node RPC collaborator: `getblocktemplate` plus network state.
//! Grounded on `blockchain/rpc_client.rs`'s `ZionRPCClient`: the same
//! `CircuitBreaker` shape, the same hyper legacy client, the same
//! JSON-RPC envelope — generalized to the generic coin-RPC contract
//! this spec names rather than ZION-specific method names.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Buf;
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= self.max_failures {
            self.is_open = true;
            tracing::error!("coin RPC circuit breaker tripped after {} failures", self.failures);
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("coin RPC circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("coin RPC circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

pub struct CoinRpcClient {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl CoinRpcClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Self {
            base_url,
            timeout,
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        crate::metrics::inc_rpc_requests();

        let res: Result<Value> = async {
            {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.check()?;
            }

            let payload = RpcRequest {
                jsonrpc: "2.0".to_string(),
                id: 1,
                method: method.to_string(),
                params,
            };

            let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));
            let req = Request::builder()
                .method(Method::POST)
                .uri(&self.base_url)
                .header("Content-Type", "application/json")
                .body(body)?;

            let response = tokio::time::timeout(self.timeout, self.client.request(req))
                .await
                .map_err(|_| anyhow!("coin RPC request timeout"))?
                .map_err(|e| anyhow!("coin RPC connection failed: {}", e))?;

            let status = response.status();
            if !status.is_success() {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.record_failure();
                return Err(anyhow!("coin RPC HTTP error: {}", status));
            }

            let body_bytes = response.into_body().collect().await?.to_bytes();
            let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())?;

            if let Some(error) = rpc_response.error {
                // Application-level RPC errors don't trip the breaker —
                // only connectivity failures do.
                return Err(anyhow!("coin RPC error: {:?}", error));
            }

            {
                let mut breaker = self.circuit_breaker.write().await;
                breaker.record_success();
            }

            Ok(rpc_response.result.unwrap_or(Value::Null))
        }
        .await;

        if res.is_err() {
            crate::metrics::inc_rpc_errors();
        }
        res
    }

    pub async fn get_block_template(&self) -> Result<Value> {
        self.call(
            "getblocktemplate",
            json!([{ "rules": ["segwit"] }]),
        )
        .await
    }

    pub async fn submit_block(&self, block_hex: &str) -> Result<Value> {
        self.call("submitblock", json!([block_hex])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_trips_after_max_failures() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.is_open);
        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }
        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn client_builds_expected_base_url() {
        let client = CoinRpcClient::new("http://127.0.0.1:8332/".to_string(), Duration::from_secs(10));
        assert_eq!(client.base_url, "http://127.0.0.1:8332/");
    }
}

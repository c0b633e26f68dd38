//! Ethereum JSON-RPC client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{B256, U64, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{CallRequest, LedgerNode};
use crate::address::Address;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// A [`LedgerNode`] over HTTP JSON-RPC.
#[derive(Debug)]
pub struct JsonRpcLedger {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    /// Creates a client for `url`; every call is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Node`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Node(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "ledger rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json::<RpcResponse<R>>()
            .await
            .map_err(transport_error)?;

        match (response.result, response.error) {
            (_, Some(err)) => Err(Error::Node(format!("{} (code {})", err.message, err.code))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(Error::Node(format!("{method} returned no result"))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout("ledger node response")
    } else {
        Error::Node(err.to_string())
    }
}

#[async_trait]
impl LedgerNode for JsonRpcLedger {
    async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.call("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.call("eth_getBalance", json!([address, "latest"])).await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        let count: U64 = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(count.to::<u64>())
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64> {
        let gas: U64 = self.call("eth_estimateGas", json!([call])).await?;
        Ok(gas.to::<u64>())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let raw = format!("0x{}", hex::encode(raw));
        self.call("eth_sendRawTransaction", json!([raw]))
            .await
            .map_err(|e| match e {
                Error::Node(msg) => Error::SubmissionError(msg),
                other => other,
            })
    }
}

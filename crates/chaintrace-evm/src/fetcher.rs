//! JSON-RPC ledger client.
//!
//! Implements [`Ledger`] over plain HTTP JSON-RPC:
//! `eth_blockNumber`, `eth_getBlockByNumber(h, true)` and
//! `eth_getTransactionReceipt`. Transport failures are retried with
//! exponential backoff; JSON-RPC error objects are not. New-block
//! notifications come from polling the head.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use chaintrace_core::error::IndexerError;
use chaintrace_core::ledger::{BlockSubscription, Ledger};
use chaintrace_core::types::{parse_hex_u64, LedgerBlock, LedgerTransaction, RawLog};

use crate::retry::RetryPolicy;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value; `Value::Null` when the node returned `null`.
    pub fn into_result(self) -> Result<Value, IndexerError> {
        match self.error {
            Some(e) => Err(IndexerError::Rpc(format!(
                "JSON-RPC error {}: {}",
                e.code, e.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

struct Failure {
    message: String,
    retryable: bool,
}

impl Failure {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// [`Ledger`] backed by an HTTP JSON-RPC endpoint.
#[derive(Clone)]
pub struct JsonRpcLedger {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    poll_interval: Duration,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcLedger {
    pub fn new(url: impl Into<String>) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Head polling interval for [`Ledger::subscribe_new_blocks`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request, retrying transient failures.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(value) => return Ok(value),
                Err(f) if f.retryable => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %f.message,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(method, attempt, error = %f.message, url = %self.url, "max retries exceeded");
                        return Err(IndexerError::Rpc(f.message));
                    }
                },
                Err(f) => return Err(IndexerError::Rpc(f.message)),
            }
        }
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<Value, Failure> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| Failure::transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Failure {
                message: format!("HTTP {}: {body}", status.as_u16()),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let body = resp
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| Failure::transient(e.to_string()))?;
        body.into_result().map_err(|e| Failure {
            message: e.to_string(),
            retryable: false,
        })
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    async fn chain_height(&self) -> Result<u64, IndexerError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        v.as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| IndexerError::Rpc(format!("malformed block number: {v}")))
    }

    async fn block(&self, height: u64) -> Result<Option<LedgerBlock>, IndexerError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{height:x}")), json!(true)])
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        block_from_json(&v)
            .map(Some)
            .ok_or_else(|| IndexerError::Rpc(format!("malformed block {height}")))
    }

    async fn transaction_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, IndexerError> {
        let v = self
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if v.is_null() {
            return Err(IndexerError::Rpc(format!("receipt for {tx_hash} not available")));
        }
        logs_from_receipt(&v)
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription, IndexerError> {
        let (tx, sub) = BlockSubscription::channel();
        let ledger = self.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<u64> = None;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match ledger.chain_height().await {
                    Ok(head) if last.map_or(true, |l| head > l) => {
                        last = Some(head);
                        if tx.send(head).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "head poll failed"),
                }
            }
            debug!("head poller stopped");
        });

        Ok(sub.on_cancel(move || handle.abort()))
    }
}

/// Convert an `eth_getBlockByNumber` result (full transactions) to a [`LedgerBlock`].
pub fn block_from_json(v: &Value) -> Option<LedgerBlock> {
    let transactions = v["transactions"]
        .as_array()?
        .iter()
        .map(|tx| {
            Some(LedgerTransaction {
                hash: tx["hash"].as_str()?.to_string(),
                to: tx["to"].as_str().map(str::to_string),
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(LedgerBlock {
        height: parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_string(),
        timestamp: parse_hex_u64(v["timestamp"].as_str()?)? as i64,
        transactions,
    })
}

/// Logs of an `eth_getTransactionReceipt` result.
pub fn logs_from_receipt(v: &Value) -> Result<Vec<RawLog>, IndexerError> {
    match v.get("logs") {
        None | Some(Value::Null) => Ok(vec![]),
        Some(logs) => serde_json::from_value(logs.clone())
            .map_err(|e| IndexerError::Rpc(format!("malformed receipt logs: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_with_full_transactions() {
        let v = json!({
            "number": "0xb",
            "hash": "0xblock",
            "timestamp": "0x65a0c400",
            "transactions": [
                { "hash": "0xt1", "to": "0x5FbDB2315678afecb367f032d93F642f64180aa3" },
                { "hash": "0xt2", "to": null }
            ]
        });
        let block = block_from_json(&v).unwrap();
        assert_eq!(block.height, 11);
        assert_eq!(block.timestamp, 0x65a0c400);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[1].to.is_none());
    }

    #[test]
    fn block_with_hash_only_transactions_is_rejected() {
        let v = json!({
            "number": "0x1", "hash": "0xb", "timestamp": "0x0",
            "transactions": ["0xt1"]
        });
        assert!(block_from_json(&v).is_none());
    }

    #[test]
    fn receipt_logs() {
        let v = json!({
            "transactionHash": "0xt1",
            "logs": [{
                "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
                "topics": ["0x01"],
                "data": "0x",
                "transactionHash": "0xt1",
                "blockHash": "0xb",
                "logIndex": "0x2"
            }]
        });
        let logs = logs_from_receipt(&v).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_index_u32(), Some(2));
        assert!(logs_from_receipt(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn rpc_error_object_maps_to_rpc_error() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32000, "message": "header not found" }
        }))
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, IndexerError::Rpc(ref m) if m.contains("header not found")));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_after_retries() {
        let ledger = JsonRpcLedger::new("http://127.0.0.1:1")
            .unwrap()
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)));
        let err = ledger.chain_height().await.unwrap_err();
        assert!(err.is_block_local());
    }
}

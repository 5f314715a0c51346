//! Solana JSON-RPC implementation of the ledger read API.
//!
//! Transfers and memos are read from top-level instructions and from
//! `meta.innerInstructions`, so payments routed through another program
//! (a wallet's batching program, for instance) are seen too. Only native SOL
//! transfers of the system program count as payments.

use crate::error::{Error, Result};
use crate::ledger::{LedgerClient, LedgerTransaction, SignatureEntry, Transfer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest page `getSignaturesForAddress` accepts.
const MAX_SIGNATURE_PAGE: usize = 1000;

/// Pages walked back looking for the cursor before giving up.
const MAX_SIGNATURE_PAGES: usize = 20;

/// Memo program ids (v1 and v2).
const MEMO_PROGRAM_IDS: &[&str] = &[
    "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr",
    "Memo1UhkJRfHyvLMcVucJwxXeuD728EqVDDwQDxFMNo",
];

/// System program id.
const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// Configuration for the Solana RPC client.
#[derive(Debug, Clone)]
pub struct SolanaRpcConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Commitment level for reads.
    pub commitment: String,
}

impl Default for SolanaRpcConfig {
    fn default() -> Self {
        Self {
            rpc_url: crate::config::DEFAULT_RPC_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            commitment: "confirmed".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcSignature {
    signature: String,
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    #[serde(default)]
    meta: Option<RpcMeta>,
    transaction: RpcInnerTransaction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    inner_instructions: Option<Vec<RpcInnerInstructions>>,
}

#[derive(Debug, Deserialize)]
struct RpcInnerInstructions {
    #[serde(default)]
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
struct RpcInnerTransaction {
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcInstruction {
    #[serde(default)]
    program_id: Option<String>,
    #[serde(default)]
    parsed: Option<Value>,
}

/// Ledger client speaking Solana JSON-RPC over HTTP.
pub struct SolanaRpcClient {
    http: reqwest::Client,
    config: SolanaRpcConfig,
    request_id: AtomicU64,
}

impl SolanaRpcClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: SolanaRpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build RPC client: {e}")))?;
        Ok(Self {
            http,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self
            .http
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("RPC {method} returned HTTP {status}");
            return Err(Error::Rpc(format!("{method}: HTTP {status}")));
        }

        let body: JsonRpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(Error::Rpc(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| Error::Rpc(format!("{method}: malformed result: {e}")))
    }
}

#[async_trait]
impl LedgerClient for SolanaRpcClient {
    async fn signatures_since(
        &self,
        address: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureEntry>> {
        let mut collected: Vec<RpcSignature> = Vec::new();
        let mut before: Option<String> = None;

        // The node returns newest first; page backwards to the cursor so the
        // oldest unseen signatures are not cut off.
        for page_number in 1.. {
            if page_number > MAX_SIGNATURE_PAGES {
                return Err(Error::Rpc(format!(
                    "cursor {} not reached within {} pages of {address}; \
                     the node may have pruned it",
                    cursor.unwrap_or_default(),
                    MAX_SIGNATURE_PAGES
                )));
            }

            let page_limit = if cursor.is_some() {
                MAX_SIGNATURE_PAGE
            } else {
                limit.min(MAX_SIGNATURE_PAGE)
            };
            let mut options = json!({
                "limit": page_limit,
                "commitment": self.config.commitment,
            });
            if let Some(until) = cursor {
                options["until"] = json!(until);
            }
            if let Some(before) = &before {
                options["before"] = json!(before);
            }

            let page: Vec<RpcSignature> = self
                .call("getSignaturesForAddress", json!([address, options]))
                .await?;
            let full = page.len() == page_limit;
            before = page.last().map(|s| s.signature.clone());
            collected.extend(page);

            if cursor.is_none() || !full {
                break;
            }
        }

        debug!(
            "getSignaturesForAddress({address}) since {:?}: {} signatures",
            cursor,
            collected.len()
        );

        collected.reverse();
        collected.truncate(limit);
        Ok(collected
            .into_iter()
            .map(|s| SignatureEntry {
                failed: s.err.is_some_and(|e| !e.is_null()),
                signature: s.signature,
                slot: s.slot,
            })
            .collect())
    }

    async fn fetch_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>> {
        let tx: Option<RpcTransaction> = self
            .call(
                "getTransaction",
                json!([signature, {
                    "encoding": "jsonParsed",
                    "commitment": self.config.commitment,
                    "maxSupportedTransactionVersion": 0,
                }]),
            )
            .await?;
        Ok(tx.map(|tx| parse_transaction(signature, tx)))
    }

    async fn tip_height(&self) -> Result<u64> {
        self.call("getSlot", json!([{ "commitment": self.config.commitment }]))
            .await
    }

    async fn block_time(&self, slot: u64) -> Result<Option<DateTime<Utc>>> {
        match self.call::<Option<i64>>("getBlockTime", json!([slot])).await {
            Ok(time) => Ok(time.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))),
            // -32004 block not available, -32007 slot skipped, -32009 missing in long-term storage
            Err(Error::Rpc(e))
                if ["-32004", "-32007", "-32009"]
                    .iter()
                    .any(|code| e.contains(&format!("(code {code})"))) =>
            {
                debug!("No block time for slot {slot}: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_transaction(signature: &str, tx: RpcTransaction) -> LedgerTransaction {
    let mut transfers = Vec::new();
    let mut memo = None;

    let inner = tx
        .meta
        .as_ref()
        .and_then(|m| m.inner_instructions.as_deref())
        .unwrap_or_default()
        .iter()
        .flat_map(|group| group.instructions.iter());

    for inst in tx.transaction.message.instructions.iter().chain(inner) {
        let (Some(program_id), Some(parsed)) = (inst.program_id.as_deref(), &inst.parsed) else {
            continue;
        };
        if MEMO_PROGRAM_IDS.contains(&program_id) {
            if memo.is_none() {
                memo = parsed.as_str().map(str::to_string);
            }
        } else if program_id == SYSTEM_PROGRAM_ID {
            if let Some(transfer) = parse_system_transfer(parsed) {
                transfers.push(transfer);
            }
        }
    }

    LedgerTransaction {
        signature: signature.to_string(),
        slot: tx.slot,
        block_time: tx
            .block_time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        failed: tx
            .meta
            .as_ref()
            .and_then(|m| m.err.as_ref())
            .is_some_and(|e| !e.is_null()),
        transfers,
        memo,
    }
}

fn parse_system_transfer(parsed: &Value) -> Option<Transfer> {
    let kind = parsed.get("type")?.as_str()?;
    if kind != "transfer" && kind != "transferWithSeed" {
        return None;
    }
    let info = parsed.get("info")?;
    Some(Transfer {
        source: info.get("source")?.as_str()?.to_string(),
        destination: info.get("destination")?.as_str()?.to_string(),
        lamports: info.get("lamports")?.as_u64()?,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const GATE: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
    const PAYER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    fn client(server: &mockito::ServerGuard) -> SolanaRpcClient {
        SolanaRpcClient::new(SolanaRpcConfig {
            rpc_url: server.url(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn test_get_transaction_parses_transfer_and_memo() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "slot": 250,
                "blockTime": 1_700_000_000,
                "meta": { "err": null },
                "transaction": {
                    "message": {
                        "instructions": [
                            {
                                "program": "system",
                                "programId": SYSTEM_PROGRAM_ID,
                                "parsed": {
                                    "type": "transfer",
                                    "info": { "source": PAYER, "destination": GATE, "lamports": 10_000_000 }
                                }
                            },
                            {
                                "program": "spl-memo",
                                "programId": MEMO_PROGRAM_IDS[0],
                                "parsed": "ABC123"
                            }
                        ]
                    }
                }
            }
        });
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": "getTransaction" })))
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let tx = client(&server)
            .fetch_transaction("S1")
            .await
            .expect("fetch")
            .expect("present");
        mock.assert_async().await;

        assert_eq!(tx.slot, 250);
        assert!(!tx.failed);
        assert_eq!(tx.memo.as_deref(), Some("ABC123"));
        assert_eq!(tx.transfers.len(), 1);
        let candidate = tx.into_candidate(GATE).expect("candidate");
        assert_eq!(candidate.amount, 10_000_000);
        assert_eq!(candidate.sender, PAYER);
    }

    #[tokio::test]
    async fn test_missing_transaction_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":null}"#)
            .create_async()
            .await;

        let tx = client(&server).fetch_transaction("S1").await.expect("fetch");
        assert!(tx.is_none());
    }

    #[tokio::test]
    async fn test_signatures_are_returned_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "getSignaturesForAddress",
                "params": [GATE, { "until": "S0" }]
            })))
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": [
                        { "signature": "S3", "slot": 30, "err": null },
                        { "signature": "S2", "slot": 20, "err": { "InstructionError": [0, "Custom"] } },
                        { "signature": "S1", "slot": 10, "err": null }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let entries = client(&server)
            .signatures_since(GATE, Some("S0"), 2)
            .await
            .expect("signatures");
        let sigs: Vec<_> = entries.iter().map(|e| e.signature.as_str()).collect();
        assert_eq!(sigs, ["S1", "S2"]);
        assert!(!entries[0].failed);
        assert!(entries[1].failed);
    }

    #[tokio::test]
    async fn test_rpc_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": "getSlot" })))
            .with_status(429)
            .create_async()
            .await;
        let err = client(&server).tip_height().await.expect_err("rate limited");
        assert!(err.is_transient());

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"Node is behind"}}"#)
            .create_async()
            .await;
        let err = client(&server).tip_height().await.expect_err("node behind");
        assert!(err.is_transient());
        assert!(err.to_string().contains("Node is behind"));
    }

    #[tokio::test]
    async fn test_inner_instruction_transfer_is_seen() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "slot": 251,
                "blockTime": 1_700_000_100,
                "meta": {
                    "err": null,
                    "innerInstructions": [{
                        "index": 0,
                        "instructions": [{
                            "program": "system",
                            "programId": SYSTEM_PROGRAM_ID,
                            "parsed": {
                                "type": "transfer",
                                "info": { "source": PAYER, "destination": GATE, "lamports": 7 }
                            }
                        }]
                    }]
                },
                "transaction": {
                    "message": {
                        "instructions": [
                            { "programId": "Batch1111111111111111111111111111111111111", "data": "3Bxs" },
                            { "programId": MEMO_PROGRAM_IDS[1], "parsed": "ref:abc123" }
                        ]
                    }
                }
            }
        });
        server
            .mock("POST", "/")
            .with_body(body.to_string())
            .create_async()
            .await;

        let tx = client(&server)
            .fetch_transaction("S9")
            .await
            .expect("fetch")
            .expect("present");
        let candidate = tx.into_candidate(GATE).expect("candidate");
        assert_eq!(candidate.amount, 7);
        assert_eq!(candidate.memo.as_deref(), Some("ref:abc123"));
        assert_eq!(
            candidate.block_time,
            DateTime::<Utc>::from_timestamp(1_700_000_100, 0)
        );
    }

    #[tokio::test]
    async fn test_unreachable_cursor_stops_paging() {
        let mut server = mockito::Server::new_async().await;
        let page: Vec<Value> = (0..MAX_SIGNATURE_PAGE)
            .map(|i| json!({ "signature": format!("X{i}"), "slot": 5, "err": null }))
            .collect();
        let mock = server
            .mock("POST", "/")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": page }).to_string())
            .expect(MAX_SIGNATURE_PAGES)
            .create_async()
            .await;

        let err = client(&server)
            .signatures_since(GATE, Some("pruned"), 10)
            .await
            .expect_err("cursor never reached");
        mock.assert_async().await;
        assert!(err.is_transient());
        assert!(err.to_string().contains("pruned"));
    }

    #[tokio::test]
    async fn test_block_time_of_skipped_slot_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": "getBlockTime", "params": [300] })))
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":1700000000}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": "getBlockTime", "params": [301] })))
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32007,"message":"Slot 301 was skipped"}}"#,
            )
            .create_async()
            .await;

        let rpc = client(&server);
        assert_eq!(
            rpc.block_time(300).await.expect("time"),
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(rpc.block_time(301).await.expect("skipped"), None);
    }
}

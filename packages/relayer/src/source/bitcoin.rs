//! Bitcoin Core JSON-RPC adapter

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BlockRef, RawTxLookup, SourceChainAdapter, TxInclusion, TxList};
use crate::error::{ChainError, ChainResult};
use crate::hash::{bytes32_to_hex, double_sha256, parse_bytes32, reverse32};
use crate::types::SourceBlockHeader;

/// bitcoind: "No such mempool or blockchain transaction" / unknown block
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// bitcoind: block height out of range
const RPC_INVALID_PARAMETER: i64 = -8;

/// Serialized size of a Bitcoin block header
pub const HEADER_LEN: usize = 80;

/// Fields of an 80-byte header, hashes in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub hash: [u8; 32],
    pub parent_hash: [u8; 32],
    pub merkle_root: [u8; 32],
}

/// Parse a serialized header:
/// version(4) | prev_block(32) | merkle_root(32) | time(4) | bits(4) | nonce(4)
pub fn parse_header(raw: &[u8]) -> Option<HeaderFields> {
    if raw.len() != HEADER_LEN {
        return None;
    }
    let mut parent = [0u8; 32];
    parent.copy_from_slice(&raw[4..36]);
    let mut root = [0u8; 32];
    root.copy_from_slice(&raw[36..68]);

    Some(HeaderFields {
        hash: reverse32(&double_sha256(raw)),
        parent_hash: reverse32(&parent),
        merkle_root: reverse32(&root),
    })
}

/// Which Bitcoin network the node serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceNetwork {
    Mainnet,
    /// Local test network; blocks are mined on demand while waiting
    Regtest,
}

impl SourceNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceNetwork::Mainnet => "mainnet",
            SourceNetwork::Regtest => "regtest",
        }
    }

    /// Height the shadow ledger starts from: the last difficulty epoch
    /// boundary on mainnet, block 0 on regtest
    pub fn genesis_height(&self, top: u64) -> u64 {
        match self {
            SourceNetwork::Mainnet => top - top % 2016,
            SourceNetwork::Regtest => 0,
        }
    }
}

impl FromStr for SourceNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(SourceNetwork::Mainnet),
            "regtest" => Ok(SourceNetwork::Regtest),
            other => Err(format!("unknown source network: {}", other)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct VerboseHeader {
    height: u64,
    previousblockhash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseBlock {
    merkleroot: String,
    tx: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseTx {
    blockhash: Option<String>,
    confirmations: Option<u64>,
}

/// Bitcoin Core RPC client
pub struct BitcoinRpcAdapter {
    client: Client,
    rpc_url: String,
    user: Option<String>,
    password: Option<String>,
    network: SourceNetwork,
    poll_interval: Duration,
    name: String,
}

impl BitcoinRpcAdapter {
    pub fn new(
        rpc_url: String,
        user: Option<String>,
        password: Option<String>,
        network: SourceNetwork,
        poll_interval: Duration,
    ) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            rpc_url,
            user,
            password,
            network,
            poll_interval,
            name: format!("bitcoin-{}", network.as_str()),
        })
    }

    pub fn network(&self) -> SourceNetwork {
        self.network
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<T> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "relayer",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.rpc_url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ChainError::Rpc {
                code: 401,
                message: "unauthorized: check source RPC credentials".to_string(),
            });
        }

        // bitcoind reports RPC errors with HTTP 500 and a JSON body
        let response = response.json::<RpcResponse<T>>().await?;
        if let Some(error) = response.error {
            return Err(match error.code {
                RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER => {
                    ChainError::NotFound(format!("{}: {}", method, error.message))
                }
                code => ChainError::Rpc {
                    code,
                    message: error.message,
                },
            });
        }

        response
            .result
            .ok_or_else(|| ChainError::Decode(format!("{} returned no result", method)))
    }

    async fn block_hash_at(&self, height: u64) -> ChainResult<[u8; 32]> {
        let hash: String = self.call("getblockhash", json!([height])).await?;
        parse_hash(&hash)
    }

    /// Mine one block to a fresh wallet address (regtest only)
    async fn mine_block(&self) -> ChainResult<()> {
        let address: String = self.call("getnewaddress", json!([])).await?;
        let _: Vec<String> = self
            .call("generatetoaddress", json!([1, address]))
            .await?;
        debug!("Mined one regtest block");
        Ok(())
    }

    /// Let the chain advance: mine on regtest, sleep on mainnet
    async fn advance(&self) -> ChainResult<()> {
        match self.network {
            SourceNetwork::Regtest => self.mine_block().await,
            SourceNetwork::Mainnet => {
                tokio::time::sleep(self.poll_interval).await;
                Ok(())
            }
        }
    }
}

fn parse_hash(s: &str) -> ChainResult<[u8; 32]> {
    parse_bytes32(s).map_err(ChainError::Decode)
}

fn hex_id(hash: &[u8; 32]) -> String {
    // bitcoind expects ids without the 0x prefix
    hex::encode(hash)
}

#[async_trait]
impl SourceChainAdapter for BitcoinRpcAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn top_height(&self) -> ChainResult<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_header(&self, at: BlockRef) -> ChainResult<SourceBlockHeader> {
        let hash = match at {
            BlockRef::Height(h) => self.block_hash_at(h).await?,
            BlockRef::Hash(h) => h,
        };
        let id = hex_id(&hash);

        let verbose: VerboseHeader = self.call("getblockheader", json!([id, true])).await?;
        let raw_hex: String = self.call("getblockheader", json!([id, false])).await?;
        let raw = hex::decode(raw_hex)?;

        let fields = parse_header(&raw)
            .ok_or_else(|| ChainError::Decode(format!("header {} is not {} bytes", id, HEADER_LEN)))?;
        if fields.hash != hash {
            return Err(ChainError::Decode(format!(
                "header bytes for {} hash to {}",
                id,
                hex::encode(fields.hash)
            )));
        }
        // Genesis reports no previousblockhash; the header field is then all zeros
        if let Some(p) = verbose.previousblockhash {
            if parse_hash(&p)? != fields.parent_hash {
                return Err(ChainError::Decode(format!("parent mismatch in header {}", id)));
            }
        }

        Ok(SourceBlockHeader {
            height: verbose.height,
            hash,
            parent_hash: fields.parent_hash,
            raw,
        })
    }

    async fn tx_list(&self, block_hash: &[u8; 32]) -> ChainResult<TxList> {
        let block: VerboseBlock = self
            .call("getblock", json!([hex_id(block_hash), 1]))
            .await?;
        let txids = block
            .tx
            .iter()
            .map(|t| parse_hash(t))
            .collect::<ChainResult<Vec<_>>>()?;

        Ok(TxList {
            root: parse_hash(&block.merkleroot)?,
            txids,
        })
    }

    async fn raw_tx(&self, txid: &[u8; 32]) -> ChainResult<RawTxLookup> {
        match self
            .call::<String>("getrawtransaction", json!([hex_id(txid), false]))
            .await
        {
            Ok(raw_hex) => Ok(RawTxLookup::Found(hex::decode(raw_hex)?)),
            Err(ChainError::NotFound(reason)) => Ok(RawTxLookup::Missing(reason)),
            Err(e) => Err(e),
        }
    }

    async fn send_raw_tx(&self, txid: &[u8; 32], raw: &[u8]) -> ChainResult<bool> {
        match self
            .call::<String>("sendrawtransaction", json!([hex::encode(raw)]))
            .await
        {
            Ok(returned) => Ok(parse_hash(&returned)? == *txid),
            // Node evaluated and refused the transaction
            Err(ChainError::Rpc { code, message }) => {
                info!(
                    txid = %bytes32_to_hex(txid),
                    code,
                    reason = %message,
                    "Source node rejected raw transaction"
                );
                Ok(false)
            }
            Err(ChainError::NotFound(message)) => {
                info!(txid = %bytes32_to_hex(txid), reason = %message, "Source node rejected raw transaction");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_tx_recorded(&self, txid: &[u8; 32]) -> ChainResult<Option<TxInclusion>> {
        loop {
            let tx: VerboseTx = match self
                .call("getrawtransaction", json!([hex_id(txid), true]))
                .await
            {
                Ok(tx) => tx,
                Err(ChainError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };

            if let (Some(block_hash), Some(confirmations)) = (tx.blockhash, tx.confirmations) {
                if confirmations > 0 {
                    return Ok(Some(TxInclusion {
                        block_hash: parse_hash(&block_hash)?,
                        confirmations,
                    }));
                }
            }

            debug!(txid = %bytes32_to_hex(txid), "Transaction still in mempool");
            self.advance().await?;
        }
    }

    async fn wait_new_blocks(&self, count: u64) -> ChainResult<bool> {
        let target = self.top_height().await?.saturating_add(count);
        while self.top_height().await? < target {
            self.advance().await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bitcoin mainnet block 100000
    const BLOCK_100000_HEADER: &str = "0100000050120119172a610421a6c3011dd330d9df07b63616c2cc1f1cd00200000000006657a9252aacd5c0b2940996ecff952228c3067cc38d4885efb5a4ac4247e9f337221b4d4c86041b0f2b5710";

    #[test]
    fn test_parse_mainnet_header() {
        let raw = hex::decode(BLOCK_100000_HEADER).unwrap();
        let fields = parse_header(&raw).unwrap();
        assert_eq!(
            hex::encode(fields.hash),
            "000000000003ba27aa200b1cecaad478d2b00432346c3f1f3986da1afd33e506"
        );
        assert_eq!(
            hex::encode(fields.parent_hash),
            "000000000002d01c1fccc21636b607dfd930d31d01c3a62104612a1719011250"
        );
        assert_eq!(
            hex::encode(fields.merkle_root),
            "f3e94742aca4b5ef85488dc37c06c3282295ffec960994b2c0d5ac2a25a95766"
        );
        assert!(parse_header(&raw[..79]).is_none());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("mainnet".parse::<SourceNetwork>(), Ok(SourceNetwork::Mainnet));
        assert_eq!("REGTEST".parse::<SourceNetwork>(), Ok(SourceNetwork::Regtest));
        assert!("testnet4".parse::<SourceNetwork>().is_err());
    }

    #[test]
    fn test_genesis_height() {
        assert_eq!(SourceNetwork::Mainnet.genesis_height(850_000), 848_736);
        assert_eq!(SourceNetwork::Mainnet.genesis_height(4032), 4032);
        assert_eq!(SourceNetwork::Regtest.genesis_height(850_000), 0);
    }

    #[test]
    fn test_rpc_response_decoding() {
        let ok: RpcResponse<u64> =
            serde_json::from_str(r#"{"result":812345,"error":null,"id":"relayer"}"#).unwrap();
        assert_eq!(ok.result, Some(812345));

        let err: RpcResponse<String> = serde_json::from_str(
            r#"{"result":null,"error":{"code":-5,"message":"No such mempool or blockchain transaction"},"id":"relayer"}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, RPC_INVALID_ADDRESS_OR_KEY);
    }

    #[test]
    fn test_verbose_header_genesis_has_no_parent() {
        let h: VerboseHeader = serde_json::from_str(r#"{"height":0,"hash":"00"}"#).unwrap();
        assert_eq!(h.height, 0);
        assert!(h.previousblockhash.is_none());
    }
}

//! Upstream coin-daemon RPC surface.
//!
//! The registry only needs two calls out of the full bitcoin-core RPC
//! surface: `getblocktemplate` to fetch new work and `submitblock` to
//! hand back a solved block. Both are expressed as an async trait so the
//! registry and its tests can be driven against an in-memory fake
//! without a live daemon, while the production binary wires in the
//! `bitcoincore-rpc`-backed implementation.

use async_trait::async_trait;
use bitcoin::Transaction;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use bitcoincore_rpc_json::{
    GetBlockTemplateResult as RpcGetBlockTemplateResult, GetBlockTemplateResultTransaction,
};
use log::{debug, warn};
use std::fmt;

/// The subset of a `getblocktemplate` response the registry consumes.
/// Field names mirror `bitcoincore-rpc-json`'s own result type; this is a
/// thinner, owned copy so the rest of the crate does not depend on the
/// RPC crate's exact shape.
#[derive(Debug, Clone)]
pub struct GetBlockTemplateResult {
    pub height: u64,
    pub previous_block_hash: [u8; 32],
    pub transactions: Vec<Transaction>,
    pub coinbase_value: u64,
    pub target: [u8; 32],
    pub bits: Vec<u8>,
    pub cur_time: u32,
    pub version: i32,
    pub witness_commitment: Option<Vec<u8>>,
}

impl From<RpcGetBlockTemplateResult> for GetBlockTemplateResult {
    fn from(r: RpcGetBlockTemplateResult) -> Self {
        let transactions = r
            .transactions
            .iter()
            .filter_map(|t: &GetBlockTemplateResultTransaction| {
                bitcoin::consensus::deserialize(&t.raw_tx).ok()
            })
            .collect();
        let mut target = [0u8; 32];
        let target_bytes = r.target.to_be_bytes();
        let len = target_bytes.len().min(32);
        target[32 - len..].copy_from_slice(&target_bytes[target_bytes.len() - len..]);
        GetBlockTemplateResult {
            height: r.height as u64,
            previous_block_hash: r.previous_block_hash.to_byte_array(),
            transactions,
            coinbase_value: r.coinbase_value.to_sat(),
            target,
            bits: r.bits,
            cur_time: r.cur_time as u32,
            version: r.version.to_consensus(),
            witness_commitment: r.default_witness_commitment,
        }
    }
}

/// A submitted, solved block. `submit_block` returns `Ok(None)` on
/// acceptance and `Ok(Some(reason))` on rejection, matching bitcoin-core
/// RPC convention (empty result means accepted).
#[async_trait]
pub trait UpstreamRpc: Send + Sync {
    async fn get_block_template(&self) -> Result<GetBlockTemplateResult, RpcError>;
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError>;
}

#[derive(Debug)]
pub enum RpcError {
    Connection(String),
    Call(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Connection(e) => write!(f, "rpc connection error: {e}"),
            RpcError::Call(e) => write!(f, "rpc call error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// `bitcoincore-rpc`-backed implementation, used in production against a
/// Bitcoin-family daemon reachable by cookie file or user/pass.
pub struct BitcoinCoreRpc {
    client: Client,
}

impl BitcoinCoreRpc {
    pub fn new_with_userpass(url: &str, user: String, pass: String) -> Result<Self, RpcError> {
        let client =
            Client::new(url, Auth::UserPass(user, pass)).map_err(|e| RpcError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn new_with_cookie(url: &str, cookie_path: std::path::PathBuf) -> Result<Self, RpcError> {
        let client =
            Client::new(url, Auth::CookieFile(cookie_path)).map_err(|e| RpcError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamRpc for BitcoinCoreRpc {
    async fn get_block_template(&self) -> Result<GetBlockTemplateResult, RpcError> {
        use bitcoincore_rpc_json::GetBlockTemplateRules;
        let result = self
            .client
            .get_block_template(GetBlockTemplateRules::default())
            .map_err(|e| RpcError::Call(e.to_string()))?;
        debug!("getblocktemplate returned height={}", result.height);
        Ok(result.into())
    }

    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError> {
        let block_bytes =
            hex::decode(block_hex).map_err(|e| RpcError::Call(format!("invalid block hex: {e}")))?;
        let block: bitcoin::Block =
            bitcoin::consensus::deserialize(&block_bytes).map_err(|e| RpcError::Call(e.to_string()))?;
        match self.client.submit_block(&block) {
            Ok(()) => Ok(None),
            Err(e) => {
                warn!("submitblock rejected: {e}");
                Ok(Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use futures::lock::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory stand-in for a coin daemon, used by registry and
    /// stratum server tests. Each call to `get_block_template` returns
    /// the next queued template in order; `submit_block` records every
    /// call it receives.
    pub struct FakeUpstreamRpc {
        pub templates: Mutex<Vec<GetBlockTemplateResult>>,
        pub submitted: Mutex<Vec<String>>,
        pub next_height: AtomicU64,
        pub reject_submissions: bool,
    }

    impl FakeUpstreamRpc {
        pub fn new(templates: Vec<GetBlockTemplateResult>) -> Self {
            Self {
                templates: Mutex::new(templates),
                submitted: Mutex::new(Vec::new()),
                next_height: AtomicU64::new(0),
                reject_submissions: false,
            }
        }
    }

    #[async_trait]
    impl UpstreamRpc for FakeUpstreamRpc {
        async fn get_block_template(&self) -> Result<GetBlockTemplateResult, RpcError> {
            let mut templates = self.templates.lock().await;
            if templates.is_empty() {
                return Err(RpcError::Call("no more fake templates queued".into()));
            }
            Ok(templates.remove(0))
        }

        async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError> {
            self.submitted.lock().await.push(block_hex.to_string());
            if self.reject_submissions {
                Ok(Some("fake-rejected".to_string()))
            } else {
                Ok(None)
            }
        }
    }

    pub fn minimal_template(prevhash: [u8; 32], height: u64, target: [u8; 32]) -> GetBlockTemplateResult {
        GetBlockTemplateResult {
            height,
            previous_block_hash: prevhash,
            transactions: Vec::new(),
            coinbase_value: 5_000_000_000,
            target,
            bits: vec![0x1d, 0x00, 0xff, 0xff],
            cur_time: 1_700_000_000,
            version: 0x20000000,
            witness_commitment: None,
        }
    }
}

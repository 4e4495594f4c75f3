//! Process-wide configuration, assembled from [`crate::cli::Cli`].
//!
//! Kept as its own small struct (rather than passing `Cli` around
//! everywhere) so call sites depend only on the handful of fields they
//! actually need and so tests can build a config without going through
//! `clap::Parser`.

use crate::hash::Algorithm;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub bitcoin_rpc_host: String,
    pub bitcoin_rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_pass: Option<String>,
    pub rpc_cookie: Option<PathBuf>,
    pub network: bitcoin::Network,
    pub algorithm: Algorithm,
    pub solution_block_hash: bool,
    pub bind: String,
    pub instance_id: u8,
    pub payout_address: Option<String>,
}

impl RegistryConfig {
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.bitcoin_rpc_host, self.bitcoin_rpc_port)
    }
}

impl From<&crate::cli::Cli> for RegistryConfig {
    fn from(cli: &crate::cli::Cli) -> Self {
        let network = match cli.network.as_deref() {
            Some("test") | Some("testnet") => bitcoin::Network::Testnet,
            Some("regtest") => bitcoin::Network::Regtest,
            Some("signet") => bitcoin::Network::Signet,
            _ => bitcoin::Network::Bitcoin,
        };
        let algorithm = cli
            .algo
            .parse()
            .unwrap_or_else(|_| {
                log::warn!("unrecognized --algo '{}', defaulting to sha256d", cli.algo);
                Algorithm::Sha256d
            });
        RegistryConfig {
            bitcoin_rpc_host: cli.bitcoin.clone(),
            bitcoin_rpc_port: cli.rpcport,
            rpc_user: cli.rpcuser.clone(),
            rpc_pass: cli.rpcpass.clone(),
            rpc_cookie: cli.rpccookie.as_ref().map(|p| {
                PathBuf::from(
                    shellexpand::tilde(p).into_owned(),
                )
            }),
            network,
            algorithm,
            solution_block_hash: cli.solution_block_hash,
            bind: cli.bind.clone(),
            instance_id: cli.instance_id,
            payout_address: cli.payout_address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_url_formats_host_and_port() {
        let cfg = RegistryConfig {
            bitcoin_rpc_host: "127.0.0.1".into(),
            bitcoin_rpc_port: 8332,
            rpc_user: None,
            rpc_pass: None,
            rpc_cookie: None,
            network: bitcoin::Network::Bitcoin,
            algorithm: Algorithm::Sha256d,
            solution_block_hash: false,
            bind: "0.0.0.0:3333".into(),
            instance_id: 0,
            payout_address: None,
        };
        assert_eq!(cfg.rpc_url(), "http://127.0.0.1:8332");
    }
}

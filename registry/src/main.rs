use clap::Parser;
use registry::callbacks::{OnBlockCallback, OnTemplateCallback};
use registry::cli::Cli;
use registry::config::RegistryConfig;
use registry::registry::TemplateRegistry;
use registry::rpc::{BitcoinCoreRpc, RpcError};
use registry::stratum::{ConnectionMapping, NotifyBridge, NotifyCmd, Notifier, Server, StratumServerConfig};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the registry polls upstream for a fresh template even when no
/// `submitblock` has triggered an eager refresh.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    registry::setup_logging();

    let cli = Cli::parse();
    let config = RegistryConfig::from(&cli);
    log::info!("starting registry with config: {config:?}");

    let upstream = Arc::new(build_upstream(&config)?);
    let payout_script = payout_script(&config)?;

    let (notification_tx, notification_rx) = mpsc::channel::<NotifyCmd>(1024);
    let bridge = Arc::new(NotifyBridge::new(notification_tx.clone()));
    let on_block: Arc<dyn OnBlockCallback> = bridge.clone();
    let on_template: Arc<dyn OnTemplateCallback> = bridge;

    let registry = Arc::new(TemplateRegistry::new(
        upstream,
        on_block,
        on_template,
        config.algorithm,
        config.solution_block_hash,
        config.instance_id,
        payout_script,
    ));

    registry.update_block().await;

    let connections = Arc::new(futures::lock::Mutex::new(ConnectionMapping::new()));
    let mut notifier = Notifier::new(notification_rx, registry.clone(), connections.clone());
    tokio::spawn(async move {
        notifier.run().await;
    });

    let refresh_registry = registry.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            refresh_registry.update_block().await;
        }
    });

    let stratum_config = StratumServerConfig {
        hostname: config.bind.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
        port: config.bind.rsplit_once(':').and_then(|(_, p)| p.parse().ok()).unwrap_or(3333),
        start_difficulty: 1.0,
    };
    let server = Server::new(stratum_config, connections);

    tokio::select! {
        result = server.run(registry, notification_tx) => {
            if let Err(e) = result {
                log::error!("stratum server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}

/// Connects to the upstream daemon, preferring a cookie file (the
/// default bitcoind auth method) and falling back to user/pass if one
/// was supplied.
fn build_upstream(config: &RegistryConfig) -> Result<BitcoinCoreRpc, RpcError> {
    let url = config.rpc_url();
    match (&config.rpc_user, &config.rpc_cookie) {
        (Some(user), _) => {
            BitcoinCoreRpc::new_with_userpass(&url, user.clone(), config.rpc_pass.clone().unwrap_or_default())
        }
        (None, Some(cookie)) => BitcoinCoreRpc::new_with_cookie(&url, cookie.clone()),
        (None, None) => Err(RpcError::Connection(
            "no --rpcuser/--rpcpass or --rpccookie configured".to_string(),
        )),
    }
}

/// Builds the coinbase payout script. For now this is a single
/// pay-to-address output derived from `--payout-address`; absent that,
/// a placeholder script is used so the registry can still be exercised
/// without a configured payout destination.
fn payout_script(config: &RegistryConfig) -> Result<bitcoin::ScriptBuf, Box<dyn std::error::Error>> {
    match &config.payout_address {
        Some(addr) => {
            let address = bitcoin::Address::from_str(addr)?.require_network(config.network)?;
            Ok(address.script_pubkey())
        }
        None => {
            log::warn!("no --payout-address configured, mined blocks will pay a placeholder script");
            Ok(bitcoin::ScriptBuf::from_hex(
                "76a914000000000000000000000000000000000000000088ac",
            )?)
        }
    }
}

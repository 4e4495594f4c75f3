use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "registry", about = "Stratum template registry / pool server")]
pub struct Cli {
    /// Stratum server bind address
    #[arg(long, default_value = "0.0.0.0:3333")]
    pub bind: String,

    /// Connect to this bitcoin node
    #[arg(long, default_value = "0.0.0.0")]
    pub bitcoin: String,

    /// Use this port for bitcoin RPC
    #[arg(long, default_value = "8332")]
    pub rpcport: u16,

    /// Use this username for bitcoin RPC
    #[arg(long)]
    pub rpcuser: Option<String>,

    /// Use this password for bitcoin RPC
    #[arg(long, default_value = "")]
    pub rpcpass: Option<String>,

    /// Which network to use. Valid options are main, test, regtest, signet
    #[arg(long, default_value = "main")]
    pub network: Option<String>,

    /// Use this cookie file for bitcoin RPC
    #[arg(long, default_value = "~/.bitcoin/.cookie")]
    pub rpccookie: Option<String>,

    /// Hash backend: sha256d, scrypt, scrypt-jane, quark, skeinhash, riecoin
    #[arg(long, default_value = "sha256d")]
    pub algo: String,

    /// Record the canonical block hash instead of the PoW hash on
    /// block-candidate shares
    #[arg(long, default_value_t = false)]
    pub solution_block_hash: bool,

    /// Pool instance id in [0,255], seeds the extranonce1 counter
    #[arg(long, default_value = "0")]
    pub instance_id: u8,

    /// Address credited with the coinbase payout of mined blocks. If
    /// unset, mined blocks pay an unspendable placeholder script.
    #[arg(long)]
    pub payout_address: Option<String>,
}

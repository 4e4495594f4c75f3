pub mod callbacks;
pub mod cli;
pub mod config;
pub mod error;
pub mod extranonce;
pub mod hash;
pub mod jobid;
pub mod registry;
pub mod rpc;
pub mod stratum;
pub mod template;
pub mod template_creator;

/// **Length of the extranonce prefix (in bytes).**
///
/// In Stratum mining, the extranonce is split into two parts:
/// `EXTRANONCE1` (prefix) and `EXTRANONCE2` (suffix).
///
/// This constant defines the size of `EXTRANONCE1`. Assigned by the
/// pool to uniquely identify a connection's nonce search space; handed
/// out by [`extranonce::ExtranonceCounter`].
pub const EXTRANONCE1_SIZE: usize = 4;

/// **Length of the extranonce suffix (in bytes).**
///
/// These are the rollable bits the miner fills in itself, alongside
/// nonce and version, to produce a valid share submitted via
/// `mining.submit`.
pub const EXTRANONCE2_SIZE: usize = 4;

/// **Placeholder between `EXTRANONCE1` and `EXTRANONCE2`.**
///
/// Written into the coinbase script_sig when a template is first built,
/// then located and split back out into `coinb1`/`coinb2` around the
/// combined extranonce window. Length equals
/// `EXTRANONCE1_SIZE + EXTRANONCE2_SIZE`.
pub const EXTRANONCE_SEPARATOR: [u8; EXTRANONCE1_SIZE + EXTRANONCE2_SIZE] =
    [1u8; EXTRANONCE1_SIZE + EXTRANONCE2_SIZE];

/// Initializes the logger via `env_logger`, defaulting to `info` level
/// when `RUST_LOG` is unset.
pub fn setup_logging() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
}

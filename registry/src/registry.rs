//! `TemplateRegistry`: the authoritative in-memory store of active block
//! work, and the share-validation hot path.

use crate::callbacks::{OnBlockCallback, OnTemplateCallback};
use crate::error::SubmitError;
use crate::extranonce::ExtranonceCounter;
use crate::hash::{self, riecoin_chain_length, Algorithm};
use crate::jobid::JobIdGenerator;
use crate::rpc::UpstreamRpc;
use crate::template::BlockTemplate;
use crate::{EXTRANONCE1_SIZE, EXTRANONCE2_SIZE};
use bitcoin::ScriptBuf;
use futures::lock::Mutex;
use log::{debug, error, info, warn};
use primitive_types::U256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct RegistryState {
    prevhashes: HashMap<String, Vec<Arc<BlockTemplate>>>,
    jobs: HashMap<String, Arc<BlockTemplate>>,
    last_block: Option<Arc<BlockTemplate>>,
    last_update: Option<Instant>,
}

impl RegistryState {
    fn new() -> Self {
        RegistryState {
            prevhashes: HashMap::new(),
            jobs: HashMap::new(),
            last_block: None,
            last_update: None,
        }
    }
}

/// Outcome of a successfully accepted share (block candidate or not).
#[derive(Debug, Clone)]
pub struct AcceptedShare {
    pub header_hex: String,
    pub primary_hash_hex: String,
    pub share_diff: f64,
    pub submit_result: Option<String>,
}

pub struct TemplateRegistry {
    state: Mutex<RegistryState>,
    update_in_progress: AtomicBool,

    upstream: Arc<dyn UpstreamRpc>,
    on_block: Arc<dyn OnBlockCallback>,
    on_template: Arc<dyn OnTemplateCallback>,

    job_ids: JobIdGenerator,
    extranonce_counter: ExtranonceCounter,
    pub extranonce2_size: usize,

    algorithm: Algorithm,
    solution_block_hash: bool,
    payout_script: ScriptBuf,
}

impl TemplateRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<dyn UpstreamRpc>,
        on_block: Arc<dyn OnBlockCallback>,
        on_template: Arc<dyn OnTemplateCallback>,
        algorithm: Algorithm,
        solution_block_hash: bool,
        instance_id: u8,
        payout_script: ScriptBuf,
    ) -> Self {
        TemplateRegistry {
            state: Mutex::new(RegistryState::new()),
            update_in_progress: AtomicBool::new(false),
            upstream,
            on_block,
            on_template,
            job_ids: JobIdGenerator::new(),
            extranonce_counter: ExtranonceCounter::new(instance_id),
            extranonce2_size: EXTRANONCE2_SIZE,
            algorithm,
            solution_block_hash,
            payout_script,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn allocate_extranonce1(&self) -> Vec<u8> {
        self.extranonce_counter.allocate()
    }

    /// Installs `block` as the current template. Purges every other
    /// prevhash bucket, then invokes `on_block` (if the chain tip
    /// advanced) followed by `on_template`. Both callbacks run while the
    /// state lock is held, preserving the spec's observable ordering
    /// guarantee relative to concurrent `get_job`/`submit_share` calls.
    async fn add_template(&self, block: Arc<BlockTemplate>, height: u64) {
        let mut state = self.state.lock().await;
        let prevhash = block.prevhash_hex.clone();
        let new_block = !state.prevhashes.contains_key(&prevhash);

        state
            .prevhashes
            .entry(prevhash.clone())
            .or_default()
            .push(block.clone());
        state.jobs.insert(block.job_id.clone(), block.clone());
        state.last_block = Some(block);

        state.prevhashes.retain(|k, _| k == &prevhash);

        if new_block {
            self.on_block.on_block(&prevhash, height);
        }
        self.on_template.on_template(new_block);
    }

    /// Fetches a fresh template from upstream and installs it. A no-op
    /// if a refresh is already in flight. A failed refresh is logged and
    /// leaves existing templates untouched.
    pub async fn update_block(&self) {
        if self
            .update_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("update_block already in progress, skipping");
            return;
        }
        {
            let mut state = self.state.lock().await;
            state.last_update = Some(Instant::now());
        }

        let start = Instant::now();
        match self.upstream.get_block_template().await {
            Ok(data) => {
                let job_id = self.job_ids.next();
                let height = data.height;
                let tpl = Arc::new(BlockTemplate::fill_from_rpc(
                    &data,
                    job_id,
                    self.algorithm,
                    self.payout_script.clone(),
                    EXTRANONCE1_SIZE,
                    self.extranonce2_size,
                ));
                info!(
                    "update_block: installed job {} at height {} in {:?}",
                    tpl.job_id, height, start.elapsed()
                );
                self.add_template(tpl, height).await;
            }
            Err(e) => {
                error!("update_block: getblocktemplate failed: {e}");
            }
        }
        self.update_in_progress.store(false, Ordering::SeqCst);
    }

    /// Returns the template for `job_id` iff it is present in `jobs`,
    /// its prevhash bucket still exists, and it is still a member of
    /// that bucket -- the triple check that defends against the
    /// weak-reference eviction race.
    pub async fn get_job(&self, job_id: &str) -> Option<Arc<BlockTemplate>> {
        let state = self.state.lock().await;
        let job = state.jobs.get(job_id)?;
        let bucket = state.prevhashes.get(&job.prevhash_hex)?;
        if bucket.iter().any(|t| Arc::ptr_eq(t, job)) {
            Some(job.clone())
        } else {
            None
        }
    }

    pub async fn last_block(&self) -> Option<Arc<BlockTemplate>> {
        self.state.lock().await.last_block.clone()
    }

    pub fn diff_to_target(&self, difficulty: f64) -> U256 {
        hash::diff_to_target(self.algorithm, difficulty)
    }

    /// The share-validation hot path. See module docs for the full
    /// sequence; each fallible step returns the corresponding
    /// `SubmitError` variant and the share is rejected.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_share(
        &self,
        job_id: &str,
        extranonce1: &[u8],
        extranonce2_hex: &str,
        ntime_hex: &str,
        nonce_hex: &str,
        difficulty: f64,
    ) -> Result<AcceptedShare, SubmitError> {
        let riecoin = self.algorithm == Algorithm::Riecoin;

        let expected_e2 = self.extranonce2_size * 2;
        if extranonce2_hex.len() != expected_e2 {
            return Err(SubmitError::BadExtranonce2Size {
                expected: expected_e2,
                got: extranonce2_hex.len(),
            });
        }

        let job = self
            .get_job(job_id)
            .await
            .ok_or_else(|| SubmitError::JobNotFound { job_id: job_id.to_string() })?;

        let expected_ntime_len = if riecoin { 16 } else { 8 };
        if ntime_hex.len() != expected_ntime_len {
            return Err(SubmitError::BadNtimeSize {
                expected: expected_ntime_len,
                got: ntime_hex.len(),
            });
        }
        // The representative timestamp for check_ntime is always the
        // leading 4 bytes of the (big-endian, as sent) ntime field, even
        // for riecoin's wider 8-byte field.
        let ntime = u32::from_str_radix(&ntime_hex[..8], 16).map_err(|_| SubmitError::NtimeOutOfRange)?;
        if !job.check_ntime(ntime) {
            return Err(SubmitError::NtimeOutOfRange);
        }

        let expected_nonce_len = if riecoin { 64 } else { 8 };
        if nonce_hex.len() != expected_nonce_len {
            return Err(SubmitError::BadNonceSize {
                expected: expected_nonce_len,
                got: nonce_hex.len(),
            });
        }

        let extranonce2 = hex::decode(extranonce2_hex).map_err(|_| SubmitError::DuplicateShare)?;
        if !job.register_submit(extranonce1, &extranonce2, ntime_hex.as_bytes(), nonce_hex.as_bytes()) {
            warn!("duplicate share for job {job_id}: e2={extranonce2_hex} ntime={ntime_hex} nonce={nonce_hex}");
            return Err(SubmitError::DuplicateShare);
        }

        // Both fields arrive as big-endian hex; the header wants each
        // 4-byte word byte-swapped, which for the standard 4-byte ntime
        // and 4-byte nonce is an ordinary BE->LE flip, and for riecoin's
        // 8-byte ntime / 32-byte nonce is the same flip applied
        // independently to each word.
        let ntime_bin_raw = hex::decode(ntime_hex).map_err(|_| SubmitError::NtimeOutOfRange)?;
        let nonce_bin_raw = hex::decode(nonce_hex).map_err(|_| SubmitError::BadNonceSize {
            expected: expected_nonce_len,
            got: nonce_hex.len(),
        })?;
        let ntime_bin = reverse_four_byte_chunks(&ntime_bin_raw);
        let nonce_bin = reverse_four_byte_chunks(&nonce_bin_raw);

        let coinbase_bin = job.serialize_coinbase(extranonce1, &extranonce2);
        let coinbase_hash = crate::template_creator::double_sha256(&coinbase_bin);
        let merkle_root_bin = job.merkle_root_with_coinbase(coinbase_hash);
        let merkle_root_int = U256::from_little_endian(&merkle_root_bin);

        let header_bin = job.serialize_header(merkle_root_int, &ntime_bin, &nonce_bin);
        let word_reversed_header = reverse_four_byte_chunks(&header_bin[..80.min(header_bin.len())].to_vec());

        let target_user = self.diff_to_target(difficulty);

        let (hash_int, pow_hash_hex, is_block_candidate) = if riecoin {
            let nonce_u64 = u64::from_be_bytes(
                nonce_bin_raw
                    .get(nonce_bin_raw.len().saturating_sub(8)..)
                    .unwrap_or(&[0u8; 8])
                    .try_into()
                    .unwrap_or([0u8; 8]),
            );
            let chain_length = riecoin_chain_length(&word_reversed_header, nonce_u64, 64);
            // `target_user` already holds the minimum chain length as a
            // `U256` (diff_to_target's riecoin branch goes through
            // `riecoin_target_chain_length`), so no f64 round-trip is
            // needed here.
            let target_len = target_user.low_u32();
            if chain_length < target_len {
                return Err(SubmitError::RiecoinBelowTarget);
            }
            let candidate = chain_length == 6;
            (U256::from(chain_length), format!("{chain_length:064x}"), candidate)
        } else {
            let hash_int = hash::pow_hash(self.algorithm, &word_reversed_header);
            if hash_int > target_user {
                return Err(SubmitError::AboveTarget);
            }
            let mut be = [0u8; 32];
            hash_int.to_big_endian(&mut be);
            let candidate = hash_int <= job.target;
            (hash_int, hex::encode(be), candidate)
        };

        let share_diff = hash::target_to_diff(self.algorithm, hash_int);
        debug!("share for job {job_id} accepted at difficulty {share_diff:.2}");

        let mut submit_result = None;
        let mut primary_hash_hex = pow_hash_hex.clone();

        if is_block_candidate {
            let block_hash_hex = {
                let word_reversed_full = reverse_four_byte_chunks(&header_bin);
                let digest = crate::template_creator::double_sha256(&word_reversed_full);
                let mut reversed = digest.to_vec();
                reversed.reverse();
                hex::encode(reversed)
            };
            if self.solution_block_hash {
                primary_hash_hex = block_hash_hex.clone();
            }

            job.finalize(merkle_root_int, extranonce1, &extranonce2, &ntime_bin, &nonce_bin);
            if !job.is_valid() {
                error!("job {job_id} failed is_valid() self-check after finalize");
            }

            if let Some(block_bytes) = job.serialize() {
                let block_hex = hex::encode(&block_bytes);
                match self.upstream.submit_block(&block_hex).await {
                    Ok(result) => {
                        if result.is_some() {
                            warn!("submitblock rejected for job {job_id}: {result:?}");
                        } else {
                            info!("submitblock accepted for job {job_id}, triggering refresh");
                        }
                        submit_result = result.or_else(|| Some(String::new()));
                        self.update_block().await;
                    }
                    Err(e) => {
                        error!("submitblock call failed for job {job_id}: {e}");
                    }
                }
            }
        }

        let header_hex_with_padding = {
            let mut h = header_bin.clone();
            h.extend(header_padding(self.algorithm));
            hex::encode(h)
        };

        Ok(AcceptedShare {
            header_hex: header_hex_with_padding,
            primary_hash_hex,
            share_diff,
            submit_result,
        })
    }
}

/// Reverses the byte order of each 4-byte word in `data`, used by both
/// the header's word-reversed form fed to the PoW hasher and riecoin's
/// ntime/nonce field byte-swapping.
fn reverse_four_byte_chunks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(4) {
        let mut c = chunk.to_vec();
        c.reverse();
        out.extend(c);
    }
    out
}

/// Opaque record-keeping padding appended to `header_hex` for
/// consistency with external share-database tooling; never part of the
/// bytes that are hashed or submitted upstream.
fn header_padding(algo: Algorithm) -> Vec<u8> {
    match algo {
        Algorithm::Sha256d | Algorithm::Skeinhash => Vec::new(),
        Algorithm::Scrypt | Algorithm::ScryptJane | Algorithm::Quark => vec![0u8; 47],
        Algorithm::Riecoin => vec![0u8; 15],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::RecordingCallback;
    use crate::rpc::test_support::{minimal_template, FakeUpstreamRpc};
    use bitcoin::ScriptBuf;

    fn payout_script() -> ScriptBuf {
        ScriptBuf::from_hex("76a914000000000000000000000000000000000000000088ac").unwrap()
    }

    fn make_registry(templates: Vec<crate::rpc::GetBlockTemplateResult>) -> (Arc<TemplateRegistry>, Arc<RecordingCallback>) {
        let upstream = Arc::new(FakeUpstreamRpc::new(templates));
        let cb = Arc::new(RecordingCallback::default());
        let registry = Arc::new(TemplateRegistry::new(
            upstream,
            cb.clone(),
            cb.clone(),
            Algorithm::Sha256d,
            false,
            0,
            payout_script(),
        ));
        (registry, cb)
    }

    #[tokio::test]
    async fn s3_unknown_job_is_rejected() {
        let (registry, _cb) = make_registry(vec![]);
        let e1 = registry.allocate_extranonce1();
        let result = registry
            .submit_share("ffff", &e1, "00000000", "00000000", "00000000", 1.0)
            .await;
        assert!(matches!(result, Err(SubmitError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn s4_chain_advance_evicts_old_jobs() {
        let t1 = minimal_template([0xaa; 32], 100, [0xff; 32]);
        let t2 = minimal_template([0xbb; 32], 101, [0xff; 32]);
        let (registry, cb) = make_registry(vec![t1, t2]);

        registry.update_block().await;
        let job1_id = registry.last_block().await.unwrap().job_id.clone();

        registry.update_block().await;
        let job2 = registry.last_block().await.unwrap();

        assert!(registry.get_job(&job1_id).await.is_none());
        assert!(registry.get_job(&job2.job_id).await.is_some());

        let block_events = cb.block_events.lock().unwrap();
        let template_events = cb.template_events.lock().unwrap();
        assert_eq!(block_events.len(), 2);
        assert_eq!(template_events, &vec![true, true]);
    }

    #[tokio::test]
    async fn s6_ntime_out_of_range_is_rejected() {
        let t1 = minimal_template([0xaa; 32], 100, [0xff; 32]);
        let (registry, _cb) = make_registry(vec![t1]);
        registry.update_block().await;
        let job = registry.last_block().await.unwrap();
        let e1 = registry.allocate_extranonce1();
        let result = registry
            .submit_share(&job.job_id, &e1, "00000000", "ffffffff", "00000000", 1.0)
            .await;
        assert!(matches!(result, Err(SubmitError::NtimeOutOfRange)));
    }

    #[tokio::test]
    async fn s1_block_candidate_is_finalized_and_submitted_upstream() {
        // target [0xff; 32] is exactly `U256::MAX`, and a minuscule
        // difficulty clamps `diff_to_target`'s float division to
        // `U256::MAX` as well, so every share is deterministically both
        // within the user target and a block candidate against the job's
        // own target -- no probabilistic "is_ok() || AboveTarget" needed.
        let t1 = minimal_template([0xaa; 32], 100, [0xff; 32]);
        let upstream = Arc::new(FakeUpstreamRpc::new(vec![t1]));
        let cb = Arc::new(RecordingCallback::default());
        let registry = Arc::new(TemplateRegistry::new(
            upstream.clone(),
            cb.clone(),
            cb.clone(),
            Algorithm::Sha256d,
            false,
            0,
            payout_script(),
        ));
        registry.update_block().await;
        let job = registry.last_block().await.unwrap();
        let e1 = registry.allocate_extranonce1();
        let ntime = format!("{:08x}", 1_700_000_000u32);

        let accepted = registry
            .submit_share(&job.job_id, &e1, "00000000", &ntime, "00000000", 1e-30)
            .await
            .expect("a maximal job target must always accept the share");

        // submitblock was actually called with a block this registry
        // assembled, and the fake upstream's success (`Ok(None)`) surfaces
        // as `Some(String::new())` on the accepted share.
        assert_eq!(accepted.submit_result, Some(String::new()));
        assert_eq!(upstream.submitted.lock().await.len(), 1);

        // the job was finalized and passed its own post-finalize
        // consistency check before being submitted.
        assert!(job.is_valid());
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected_second_time() {
        let t1 = minimal_template([0xaa; 32], 100, [0xff; 32]);
        let (registry, _cb) = make_registry(vec![t1]);
        registry.update_block().await;
        let job = registry.last_block().await.unwrap();
        let e1 = registry.allocate_extranonce1();
        let ntime = format!("{:08x}", 1_700_000_000u32);

        let first = registry
            .submit_share(&job.job_id, &e1, "00000000", &ntime, "00000000", 0.0000001)
            .await;
        assert!(first.is_ok() || matches!(first, Err(SubmitError::AboveTarget)));

        let second = registry
            .submit_share(&job.job_id, &e1, "00000000", &ntime, "00000000", 0.0000001)
            .await;
        assert!(matches!(second, Err(SubmitError::DuplicateShare)));
    }
}

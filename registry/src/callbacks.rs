//! Broadcast sinks: the registry's only outward-facing hooks.
//!
//! `add_template` invokes these synchronously while holding the registry
//! lock (see `registry.rs`), so implementations must not block or await
//! anything that depends on taking that same lock again.

/// Invoked once per chain-tip advance, after the new template has been
/// installed but before downstream miners are notified.
pub trait OnBlockCallback: Send + Sync {
    fn on_block(&self, prevhash_hex: &str, height: u64);
}

/// Invoked on every new template. `clean_jobs` is `true` for chain-tip
/// advances (miners must discard all prior work) and `false` for
/// transaction-set refreshes on the same tip.
pub trait OnTemplateCallback: Send + Sync {
    fn on_template(&self, clean_jobs: bool);
}

/// A callback that does nothing; useful as a default or in tests that
/// only exercise the registry's data structures.
pub struct NoopCallback;

impl OnBlockCallback for NoopCallback {
    fn on_block(&self, _prevhash_hex: &str, _height: u64) {}
}

impl OnTemplateCallback for NoopCallback {
    fn on_template(&self, _clean_jobs: bool) {}
}

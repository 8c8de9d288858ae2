//! Runtime configuration.
//!
//! Provides typed configuration with a bon builder and environment variable
//! fallbacks.

use bon::bon;

/// Default resource name of the compilation cache.
pub const DEFAULT_CACHE_NAME: &str = "jit_cache";

/// Default base of the rng-seed sequence handed to executables.
pub const DEFAULT_RNG_SEED: u64 = 0x5eed;

/// Configuration of a [`JitRuntime`](crate::JitRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Name under which the compilation cache lives in a device's default container.
    pub cache_name: String,
    /// Base of the per-launch rng seeds (`base + 2 * n` for the n-th launch).
    pub rng_seed: u64,
    /// Log closures still stored when the runtime shuts down.
    pub warn_on_leaked_closures: bool,
}

#[bon]
impl JitConfig {
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CACHE_NAME.to_string(), into)] cache_name: String,
        #[builder(default = DEFAULT_RNG_SEED)] rng_seed: u64,
        #[builder(default = true)] warn_on_leaked_closures: bool,
    ) -> Self {
        Self { cache_name, rng_seed, warn_on_leaked_closures }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_JIT_CACHE_NAME` - Resource name of the compilation cache
    /// * `KILN_RNG_SEED` - Base rng seed (decimal)
    /// * `KILN_QUIET_CLOSURE_LEAKS=1` - Do not warn about leaked closures
    pub fn from_env() -> Self {
        let cache_name = std::env::var("KILN_JIT_CACHE_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CACHE_NAME.to_string());
        let rng_seed = std::env::var("KILN_RNG_SEED").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_RNG_SEED);
        let warn_on_leaked_closures = std::env::var("KILN_QUIET_CLOSURE_LEAKS").is_err();

        Self { cache_name, rng_seed, warn_on_leaked_closures }
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

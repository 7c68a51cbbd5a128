use clap::Parser;

/// Tuning knobs for the runtime. Parse from the command line with
/// [`Options::parse`] or construct programmatically; every [`Runtime`](crate::Runtime)
/// carries its own copy so independent instances can be tuned separately.
#[derive(Parser, Clone, Debug)]
pub struct Options {
    /// Maximum total wait in milliseconds for a synchronous handshake.
    /// A thread that fails to reach a safe state within the bound is a
    /// runtime bug; on expiry the process logs the stuck threads and aborts.
    /// Zero or negative disables the check.
    #[clap(long, default_value_t = 0)]
    pub handshake_timeout_ms: i64,

    /// Per-processor spin budget in microseconds. A requester waiting for a
    /// handshake spins for this long (scaled by the processor count, capped)
    /// without observing progress before it starts sleeping.
    #[clap(long, default_value_t = 100)]
    pub handshake_spin_budget_us: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 0,
            handshake_spin_budget_us: 100,
        }
    }
}

//! Tunables. The original C implementation hard-codes most of these as
//! `#define`s (`examples/original_source/main/swap.h`); we collect them here
//! so tests can shrink them down to exercise edge cases (e.g. a 2-slot swap
//! file) without touching call sites.

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of swap files. The wire format caps this at 16 (4-bit
    /// file index), two of which are reserved (§3.1); we default to the
    /// spec's stated practical ceiling.
    pub max_swap_files: u8,

    /// Slots per bitmap block (§3.6). One bit per slot; 32K slots/block
    /// matches a 4 KiB bitmap block.
    pub slots_per_block: u32,

    /// Initial requested cluster size for a swap-out batch (§4.3 step 4).
    pub max_swap_cluster: u32,

    /// Maximum candidate PPNs the monitor returns per swap-out round
    /// (§4.3 step 2).
    pub max_swap_batch: usize,

    /// Global cap on concurrently in-flight async swap I/Os.
    pub max_async_io_tokens: usize,

    /// Number of scratch MPNs in the checkpoint buffer pool (§4.1 case 8,
    /// §4.4).
    pub checkpoint_buffer_pages: usize,

    /// Width, in pages, of the current checkpoint write window (§4.1 tie-break).
    pub checkpoint_window_pages: u32,

    /// Retry/backoff schedule for an async swap-in read that failed
    /// transiently (§4.3 "In-path", async). Modeled on the original's
    /// `SWAP_MIN_RETRY_SLEEP_TIME` / `SWAP_MAX_RETRY_SLEEP_TIME`.
    pub swap_retry_backoff: RetryBackoff,

    /// Depth of the P2M update ring and the per-VM hint ring (§3.7, §4.2).
    pub ring_capacity: usize,

    /// Size of the PPN->MPN fast-path cache (§3.5), in entries.
    pub fast_path_cache_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    /// Initial delay before the first retry.
    pub base: std::time::Duration,
    /// Ceiling the exponential backoff saturates at.
    pub cap: std::time::Duration,
    /// Number of retries before escalating to `Error::Fatal`.
    pub max_retries: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            base: std::time::Duration::from_millis(50),
            cap: std::time::Duration::from_millis(1000),
            max_retries: 8,
        }
    }
}

impl RetryBackoff {
    /// Delay before the `attempt`'th retry (0-indexed), doubling each time
    /// up to `cap`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.min(31);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_swap_files: 8,
            slots_per_block: 32 * 1024,
            max_swap_cluster: 16,
            max_swap_batch: 64,
            max_async_io_tokens: 32,
            checkpoint_buffer_pages: 4,
            checkpoint_window_pages: 256,
            swap_retry_backoff: RetryBackoff::default(),
            ring_capacity: 256,
            fast_path_cache_size: 16,
        }
    }
}

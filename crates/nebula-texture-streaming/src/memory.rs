//! Streaming pool occupancy, budget, and slack.

/// Soft limit in percent of the physical pool.
pub const MEM_LIMIT_PERCENT: i64 = 95;

/// Slack kept free in percent of the physical pool.
pub const MEM_SLACK_PERCENT: i64 = 5;

/// External counters the memory state is derived from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Bytes reserved in the pool by textures and loads.
    pub streamed_bytes: u64,
    /// Bytes of persistent tails bound in the pool.
    pub bound_persistent_bytes: u64,
    /// Physical pool capacity.
    pub physical_limit: u64,
    /// Projected resident size computed by the previous plan.
    pub prev_list_size: u64,
}

/// Budget snapshot for one planning cycle. Signed so deficits stay visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub mem_streamed: i64,
    pub mem_bound_persistent: i64,
    pub physical_limit: i64,
    /// Soft limit, 95% of the physical pool.
    pub mem_limit: i64,
    /// 5% of the physical pool.
    pub mem_free_slack: i64,
    pub free_lower: i64,
    pub free_upper: i64,
    /// Bytes available to streamed (non-persistent) mips.
    pub stream_limit: i64,
    pub stream_mid: i64,
    /// How far the previous plan overshot the mid-point.
    pub stream_delta: i64,
}

impl MemoryState {
    /// Derive the memory state from the pool counters.
    #[must_use]
    pub fn from_counters(counters: &PoolCounters) -> Self {
        let physical_limit = to_signed(counters.physical_limit);
        let mem_streamed = to_signed(counters.streamed_bytes);
        let mem_bound_persistent = to_signed(counters.bound_persistent_bytes);
        let mem_limit = percent_of(physical_limit, MEM_LIMIT_PERCENT);
        let mem_free_slack = percent_of(physical_limit, MEM_SLACK_PERCENT);
        let stream_limit = mem_limit - mem_bound_persistent;
        let stream_mid = stream_limit + mem_free_slack / 2;

        Self {
            mem_streamed,
            mem_bound_persistent,
            physical_limit,
            mem_limit,
            mem_free_slack,
            free_lower: mem_limit - mem_streamed,
            free_upper: physical_limit - mem_streamed,
            stream_limit,
            stream_mid,
            stream_delta: to_signed(counters.prev_list_size) - stream_mid,
        }
    }

    /// Whether the pool holds more than the soft limit.
    #[must_use]
    pub fn is_over_limit(&self) -> bool {
        self.free_lower < 0
    }
}

/// Soft limit for a pool of `capacity` bytes.
#[must_use]
pub fn mem_limit_for(capacity: u64) -> i64 {
    percent_of(to_signed(capacity), MEM_LIMIT_PERCENT)
}

fn percent_of(bytes: i64, percent: i64) -> i64 {
    (i128::from(bytes) * i128::from(percent) / 100) as i64
}

fn to_signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

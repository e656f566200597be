//! Global mip bias search.
//!
//! The bias is added to every precached texture's desired mip. A larger bias
//! means coarser mips and fewer bytes, so the projected size is monotonically
//! non-increasing in the bias and a bisection finds the smallest bias whose
//! projection fits the streaming limit.

use crate::order_key::OrderKey;
use crate::texture::MIP_FP_ONE;

/// One mip sharper than desired.
pub const MIN_BIAS: i32 = -MIP_FP_ONE;

/// Seven mips coarser than desired.
pub const MAX_BIAS: i32 = 7 * MIP_FP_ONE;

/// Bisection steps; `(MAX_BIAS - MIN_BIAS) >> BIAS_STEPS` is the resolution.
pub const BIAS_STEPS: u32 = 8;

/// A new bias is only adopted when it moves by more than this.
pub const BIAS_HYSTERESIS: i32 = 8;

/// Smallest bias in `[MIN_BIAS, MAX_BIAS]` whose projected size fits
/// `stream_limit`, or `MAX_BIAS` when nothing fits.
#[must_use]
pub fn solve_bias(keys: &[OrderKey], stream_limit: i64, min_mip_fp: i32) -> i32 {
    if stream_limit <= 0 {
        return MAX_BIAS;
    }
    if fits(keys, MIN_BIAS, stream_limit, min_mip_fp) {
        return MIN_BIAS;
    }

    let mut lo = MIN_BIAS;
    let mut hi = MAX_BIAS;
    for _ in 0..BIAS_STEPS {
        let mid = lo + (hi - lo) / 2;
        if fits(keys, mid, stream_limit, min_mip_fp) {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

/// Keep `prev` unless `solved` moved by more than [`BIAS_HYSTERESIS`].
#[must_use]
pub fn apply_hysteresis(prev: i32, solved: i32) -> i32 {
    if (solved - prev).abs() > BIAS_HYSTERESIS {
        solved
    } else {
        prev
    }
}

/// Whether `keys` projected at `bias` fit `limit`.
#[must_use]
pub fn fits(keys: &[OrderKey], bias: i32, limit: i64, min_mip_fp: i32) -> bool {
    if limit < 0 {
        return false;
    }
    let mut total = 0u64;
    let limit = limit as u64;
    for key in keys {
        total += key.required_bytes(key.cache_mip_fp(bias, min_mip_fp));
        if total > limit {
            return false;
        }
    }
    true
}

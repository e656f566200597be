//! Partitions the keyed texture list into precached, budget-feasible and
//! on-screen ranges.

use rand::Rng;

use crate::bias::{apply_hysteresis, fits, solve_bias};
use crate::order_key::OrderKey;
use crate::select::{partition_stable, partition_unstable, select_by_weight};

/// Inputs of one sort pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortParams {
    /// Bytes available to streamed mips.
    pub stream_limit: i64,
    /// Minimum streamable mip in fixed point.
    pub min_mip_fp: i32,
    /// Bias adopted by the previous cycle.
    pub prev_bias: i32,
}

/// Split points of the sorted key array.
///
/// `keys[..num_precached]` are precached, `keys[..balance_point]` fit the
/// budget and `keys[..on_screen_point]` are additionally visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortResult {
    pub num_precached: usize,
    pub balance_point: usize,
    pub on_screen_point: usize,
    pub bias: i32,
}

impl SortResult {
    /// Whether some precached textures did not fit the budget.
    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        self.balance_point < self.num_precached
    }
}

/// Partition `keys` in place and pick the bias and balance point.
pub fn sort_keys<R: Rng>(keys: &mut [OrderKey], params: &SortParams, rng: &mut R) -> SortResult {
    let num_precached = partition_unstable(keys, OrderKey::is_precached);
    let precached = &mut keys[..num_precached];

    let solved = solve_bias(precached, params.stream_limit, params.min_mip_fp);
    let mut bias = apply_hysteresis(params.prev_bias, solved);
    // A kept bias must still fit, otherwise a negative one skips selection.
    if bias != solved && !fits(precached, bias, params.stream_limit, params.min_mip_fp) {
        bias = solved;
    }

    let balance_point = if bias < 0 {
        num_precached
    } else {
        let min_mip_fp = params.min_mip_fp;
        select_by_weight(
            precached,
            params.stream_limit,
            rng,
            OrderKey::compare,
            |key| key.required_bytes(key.cache_mip_fp(bias, min_mip_fp)) as i64,
        )
    };

    let on_screen_point = partition_stable(&mut keys[..balance_point], OrderKey::is_visible);

    SortResult {
        num_precached,
        balance_point,
        on_screen_point,
        bias,
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::bias::{BIAS_HYSTERESIS, MAX_BIAS, MIN_BIAS};
    use crate::texture::{
        FrameInfo, MipRequest, StreamedTexture, TextureArena, TextureDesc, TextureFormat,
        TextureHandle, Zone, MIP_FP_ONE,
    };

    const FRAME: FrameInfo = FrameInfo {
        frame_id: 20,
        visibility_frame: 19,
        zone_round_ids: [5, 3],
    };

    /// R8 1000x300 with a single streamed mip: 300,000 bytes at mip 0.
    fn scenario_desc() -> TextureDesc {
        TextureDesc::new(1000, 300, TextureFormat::R8, 9).unwrap()
    }

    fn build(arena: &TextureArena) -> Vec<OrderKey> {
        arena
            .iter()
            .enumerate()
            .map(|(slot, (handle, texture))| {
                OrderKey::build(&texture.snapshot(handle), slot as u32, &FRAME)
            })
            .collect()
    }

    fn near(arena: &mut TextureArena, desc: TextureDesc, mip: f32) -> TextureHandle {
        let handle = arena.insert(StreamedTexture::new(desc));
        let request = MipRequest::predicted(handle, mip, Zone::Near, 5);
        arena.get_mut(handle).unwrap().apply_mip_request(&request);
        handle
    }

    #[test]
    fn test_precached_textures_come_first() {
        let mut arena = TextureArena::new();
        let desc = TextureDesc::new(64, 64, TextureFormat::Rgba8, 1).unwrap();
        arena.insert(StreamedTexture::new(desc));
        near(&mut arena, desc, 0.0);
        arena.insert(StreamedTexture::new(desc));
        near(&mut arena, desc, 0.0);

        let mut keys = build(&arena);
        let params = SortParams {
            stream_limit: i64::MAX,
            min_mip_fp: 0,
            prev_bias: 0,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(0));
        assert_eq!(result.num_precached, 2);
        assert!(keys[..2].iter().all(OrderKey::is_precached));
        assert!(!keys[2..].iter().any(OrderKey::is_precached));
    }

    #[test]
    fn test_five_textures_balance_at_three() {
        let mut arena = TextureArena::new();
        for _ in 0..5 {
            near(&mut arena, scenario_desc(), 0.0);
        }
        let mut keys = build(&arena);
        assert!(keys.iter().all(|key| key.required_bytes(0) == 300_000));

        // At bias 0 the budget holds three of the five.
        let mut fixed = build(&arena);
        let num_precached = partition_unstable(&mut fixed, OrderKey::is_precached);
        let balance = select_by_weight(
            &mut fixed[..num_precached],
            1_000_000,
            &mut ChaCha8Rng::seed_from_u64(7),
            OrderKey::compare,
            |key| key.required_bytes(key.cache_mip_fp(0, 0)) as i64,
        );
        assert_eq!(balance, 3);
        let kept: u64 = fixed[..balance].iter().map(|key| key.required_bytes(0)).sum();
        assert_eq!(kept, 900_000);

        // The solver instead coarsens everyone by one mip so all five fit.
        let params = SortParams {
            stream_limit: 1_000_000,
            min_mip_fp: 0,
            prev_bias: 0,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(result.num_precached, 5);
        assert_eq!(result.bias, MIP_FP_ONE);
        assert_eq!(result.balance_point, 5);
    }

    #[test]
    fn test_negative_bias_skips_selection() {
        let mut arena = TextureArena::new();
        for _ in 0..5 {
            near(&mut arena, scenario_desc(), 0.0);
        }
        let mut keys = build(&arena);
        let params = SortParams {
            stream_limit: 100_000_000,
            min_mip_fp: 0,
            prev_bias: 0,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(1));
        assert!(result.bias < 0);
        assert_eq!(result.balance_point, result.num_precached);
        assert!(!result.is_over_budget());
    }

    #[test]
    fn test_degenerate_budget_selects_nothing() {
        let mut arena = TextureArena::new();
        for _ in 0..3 {
            near(&mut arena, scenario_desc(), 0.0);
        }
        let mut keys = build(&arena);
        let params = SortParams {
            stream_limit: -5,
            min_mip_fp: 0,
            prev_bias: -256,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(result.bias, MAX_BIAS);
        assert_eq!(result.balance_point, 0);
        assert!(result.is_over_budget());
    }

    #[test]
    fn test_on_screen_partition_is_stable() {
        let mut arena = TextureArena::new();
        let desc = TextureDesc::new(64, 64, TextureFormat::Rgba8, 1).unwrap();
        for i in 0..6 {
            let handle = near(&mut arena, desc, 0.0);
            if i % 2 == 0 {
                let request = MipRequest::visible(handle, 0.0, &FRAME);
                arena.get_mut(handle).unwrap().apply_mip_request(&request);
            }
        }
        let mut keys = build(&arena);
        let params = SortParams {
            stream_limit: i64::MAX,
            min_mip_fp: 0,
            prev_bias: -256,
        };
        let before = keys.clone();
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(result.balance_point, 6);
        assert_eq!(result.on_screen_point, 3);
        assert!(keys[..3].iter().all(OrderKey::is_visible));
        let visible_before: Vec<_> = before.iter().filter(|k| k.is_visible()).collect();
        let visible_after: Vec<_> = keys[..3].iter().collect();
        assert_eq!(visible_before, visible_after);
    }

    #[test]
    fn test_same_input_same_order() {
        let mut arena = TextureArena::new();
        let desc = TextureDesc::new(512, 512, TextureFormat::Bc1, 4).unwrap();
        for i in 0..40 {
            near(&mut arena, desc, (i % 4) as f32);
        }
        let params = SortParams {
            stream_limit: 400_000,
            min_mip_fp: 0,
            prev_bias: 0,
        };
        let mut a = build(&arena);
        let mut b = build(&arena);
        let ra = sort_keys(&mut a, &params, &mut ChaCha8Rng::seed_from_u64(11));
        let rb = sort_keys(&mut b, &params, &mut ChaCha8Rng::seed_from_u64(11));
        assert_eq!(ra, rb);
        assert_eq!(a, b);
    }

    /// Bytes of `keys` at `bias`, and the largest single entry.
    fn kept_bytes(keys: &[OrderKey], bias: i32, min_mip_fp: i32) -> (i64, i64) {
        keys.iter()
            .map(|key| key.required_bytes(key.cache_mip_fp(bias, min_mip_fp)) as i64)
            .fold((0, 0), |(sum, max), bytes| (sum + bytes, max.max(bytes)))
    }

    #[test]
    fn test_hysteresis_drops_bias_that_no_longer_fits() {
        // Desired mip just under 2.0: at bias -256 everyone resolves to mip 0,
        // at -248 to mip 1.
        let mut arena = TextureArena::new();
        let desc = TextureDesc::new(256, 256, TextureFormat::Rgba8, 3).unwrap();
        for _ in 0..8 {
            near(&mut arena, desc, 504.0 / MIP_FP_ONE as f32);
        }
        let mut keys = build(&arena);
        assert!(keys.iter().all(|key| key.desired_mip_fp() == 504));
        let limit: i64 = keys
            .iter()
            .map(|key| key.required_bytes(MIP_FP_ONE) as i64)
            .sum();

        let params = SortParams {
            stream_limit: limit,
            min_mip_fp: 0,
            prev_bias: MIN_BIAS,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(5));

        assert_eq!(result.bias, MIN_BIAS + BIAS_HYSTERESIS);
        assert_eq!(result.balance_point, 8);
        let (kept, _) = kept_bytes(&keys[..result.balance_point], result.bias, 0);
        assert_eq!(kept, limit);
    }

    #[test]
    fn test_hysteresis_keeps_bias_that_still_fits() {
        let mut arena = TextureArena::new();
        for _ in 0..5 {
            near(&mut arena, scenario_desc(), 0.0);
        }
        let mut keys = build(&arena);
        // Solves to one mip; a slightly coarser previous bias still fits.
        let params = SortParams {
            stream_limit: 1_000_000,
            min_mip_fp: 0,
            prev_bias: MIP_FP_ONE + BIAS_HYSTERESIS,
        };
        let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(result.bias, MIP_FP_ONE + BIAS_HYSTERESIS);
        assert_eq!(result.balance_point, 5);
    }

    #[test]
    fn test_kept_prefix_fits_budget_for_random_inputs() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        for round in 0..200 {
            let mut arena = TextureArena::new();
            let count = rng.random_range(1..=32);
            for _ in 0..count {
                let size = 1u32 << rng.random_range(4..=9u32);
                let format = if rng.random_bool(0.5) {
                    TextureFormat::Rgba8
                } else {
                    TextureFormat::Bc1
                };
                let desc = TextureDesc::new(size, size, format, rng.random_range(1..=4)).unwrap();
                let mip = rng.random_range(0.0..6.0);
                if rng.random_bool(0.8) {
                    near(&mut arena, desc, mip);
                } else {
                    let mut texture = StreamedTexture::new(desc);
                    texture.set_desired_mip(mip);
                    arena.insert(texture);
                }
            }

            let mut keys = build(&arena);
            let full = kept_bytes(&keys, MIN_BIAS, 0).0;
            let min_mip_fp = rng.random_range(0..=MIP_FP_ONE);
            let params = SortParams {
                stream_limit: rng.random_range(-1_000..=full + 1_000),
                min_mip_fp,
                prev_bias: rng.random_range(MIN_BIAS..=MAX_BIAS),
            };
            let result = sort_keys(&mut keys, &params, &mut ChaCha8Rng::seed_from_u64(round));

            assert!(result.balance_point <= result.num_precached);
            assert!(result.on_screen_point <= result.balance_point);
            assert!((MIN_BIAS..=MAX_BIAS).contains(&result.bias));
            let (kept, largest) =
                kept_bytes(&keys[..result.balance_point], result.bias, min_mip_fp);
            assert!(
                kept <= params.stream_limit.max(0) + largest,
                "round {round}: kept {kept} over limit {} at bias {}",
                params.stream_limit,
                result.bias
            );
        }
    }
}

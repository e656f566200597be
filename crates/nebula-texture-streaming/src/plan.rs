//! Turns the partitioned key array into trim, unlink, request and abort lists.

use crate::memory::MemoryState;
use crate::order_key::{MIP_KEY_BIAS, OrderKey};
use crate::sorter::SortResult;
use crate::texture::{MIP_FP_SHIFT, TextureHandle, TextureSnapshot, fp_to_mip};

/// Set for composite textures.
pub const REQ_COMPOSITE: u32 = 1 << 31;
/// Set unless the texture is resident below its own desired mip.
pub const REQ_NOT_BELOW_DESIRED: u32 = 1 << 30;
/// Set unless the texture is high priority.
pub const REQ_NOT_HIGH_PRIORITY: u32 = 1 << 29;
/// Set when the load only adds mip 0 on top of a resident mip 1.
pub const REQ_TOP_MIP_ONLY: u32 = 1 << 28;
/// Set unless the texture is visible.
pub const REQ_NOT_VISIBLE: u32 = 1 << 27;
/// Shift of the 3-bit stream priority class.
pub const REQ_PRIORITY_SHIFT: u32 = 24;
/// Set unless the texture is in the near zone.
pub const REQ_NOT_NEAR: u32 = 1 << 23;
/// Set unless the texture is in the far zone.
pub const REQ_NOT_FAR: u32 = 1 << 22;

/// Shrink a resident texture to `target_mip`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimEntry {
    pub handle: TextureHandle,
    pub target_mip: u8,
}

/// Load a texture up to `target_mip`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub handle: TextureHandle,
    pub target_mip: u8,
    /// Ascending sort key, lower is more urgent.
    pub key: u32,
}

/// Side effects on in-flight loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleAction {
    /// The load overshoots what is now needed.
    Abort(TextureHandle),
}

/// Output of one planning cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schedule {
    pub trim: Vec<TrimEntry>,
    pub unlink: Vec<TextureHandle>,
    /// Sorted by urgency.
    pub requests: Vec<LoadRequest>,
    pub actions: Vec<ScheduleAction>,
    pub bias: i32,
    pub num_precached: usize,
    pub balance_point: usize,
    pub on_screen_point: usize,
    pub frame_id: u64,
    pub memory: MemoryState,
    /// Projected streamed bytes if the plan is fully applied.
    pub list_size: u64,
}

impl Schedule {
    /// Drop all lists, keeping their allocations.
    pub fn clear(&mut self) {
        self.trim.clear();
        self.unlink.clear();
        self.requests.clear();
        self.actions.clear();
    }

    /// Whether applying the schedule would do nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trim.is_empty()
            && self.unlink.is_empty()
            && self.requests.is_empty()
            && self.actions.is_empty()
    }

    /// Whether any list refers to `handle`.
    #[must_use]
    pub fn references(&self, handle: TextureHandle) -> bool {
        self.trim.iter().any(|entry| entry.handle == handle)
            || self.unlink.contains(&handle)
            || self.requests.iter().any(|request| request.handle == handle)
            || self
                .actions
                .iter()
                .any(|ScheduleAction::Abort(h)| *h == handle)
    }
}

/// Secondary key ordering load requests; ascending is more urgent.
#[must_use]
pub fn request_sort_key(snapshot: &TextureSnapshot, key: &OrderKey, target_mip: u8) -> u32 {
    let mut bits = 0;
    if snapshot.composite {
        bits |= REQ_COMPOSITE;
    }
    let desired = fp_to_mip(snapshot.desired_mip_fp).max(0);
    if i32::from(snapshot.resident_mip) <= desired {
        bits |= REQ_NOT_BELOW_DESIRED;
    }
    if !snapshot.high_priority {
        bits |= REQ_NOT_HIGH_PRIORITY;
    }
    if target_mip == 0 && snapshot.resident_mip == 1 {
        bits |= REQ_TOP_MIP_ONLY;
    }
    if !key.is_visible() {
        bits |= REQ_NOT_VISIBLE;
    }
    bits |= u32::from(snapshot.priority_class & 0x7) << REQ_PRIORITY_SHIFT;
    if !key.is_near() {
        bits |= REQ_NOT_NEAR;
    }
    if !key.is_far() {
        bits |= REQ_NOT_FAR;
    }
    bits | (key.bits() & 0xffff)
}

/// Build the schedule from keys partitioned by [`sort_keys`](crate::sort_keys).
///
/// `snapshots` is indexed by [`OrderKey::slot`].
#[must_use]
pub fn build_plan(
    snapshots: &[TextureSnapshot],
    keys: &[OrderKey],
    sort: &SortResult,
    min_mip_fp: i32,
) -> Schedule {
    let mut schedule = Schedule {
        bias: sort.bias,
        num_precached: sort.num_precached,
        balance_point: sort.balance_point,
        on_screen_point: sort.on_screen_point,
        ..Schedule::default()
    };

    for (i, key) in keys.iter().enumerate() {
        let Some(snapshot) = snapshots.get(key.slot()) else {
            continue;
        };
        let persistent = snapshot.desc.persistent_mip();
        let cache_fp = if i < sort.balance_point {
            key.cache_mip_fp(sort.bias, min_mip_fp)
        } else {
            key.persistent_mip_fp()
        };
        let cache_mip = (cache_fp >> MIP_FP_SHIFT).clamp(0, i32::from(persistent)) as u8;
        schedule.list_size += key.required_bytes(cache_fp);

        if let Some(target) = snapshot.streaming_target {
            if cache_mip > target {
                schedule.actions.push(ScheduleAction::Abort(snapshot.handle));
            }
        } else if snapshot.resident_mip > cache_mip {
            schedule.requests.push(LoadRequest {
                handle: snapshot.handle,
                target_mip: cache_mip,
                key: request_sort_key(snapshot, key, cache_mip),
            });
        } else if snapshot.resident_mip < cache_mip {
            schedule.trim.push(TrimEntry {
                handle: snapshot.handle,
                target_mip: cache_mip,
            });
        } else if i >= sort.num_precached && snapshot.resident_mip == persistent {
            schedule.unlink.push(snapshot.handle);
        }
    }

    schedule
        .requests
        .sort_unstable_by_key(|request| (request.key, request.handle));
    schedule
}

/// Biased mip stored in the low bits of a request key.
#[must_use]
pub fn request_key_mip_fp(key: u32) -> i32 {
    (key & 0xffff) as i32 - MIP_KEY_BIAS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::{
        FrameInfo, MipRequest, StreamedTexture, TextureArena, TextureDesc, TextureFormat, Zone,
        mip_to_fp,
    };

    const FRAME: FrameInfo = FrameInfo {
        frame_id: 30,
        visibility_frame: 29,
        zone_round_ids: [2, 1],
    };

    fn desc() -> TextureDesc {
        // 1024x1024, persistent from mip 5.
        TextureDesc::new(1024, 1024, TextureFormat::Bc1, 6).unwrap()
    }

    struct Fixture {
        arena: TextureArena,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: TextureArena::new(),
            }
        }

        fn add(&mut self, edit: impl FnOnce(&mut StreamedTexture, TextureHandle)) -> TextureHandle {
            let handle = self.arena.insert(StreamedTexture::new(desc()));
            edit(self.arena.get_mut(handle).unwrap(), handle);
            handle
        }

        fn snapshots(&self) -> Vec<TextureSnapshot> {
            self.arena.iter().map(|(h, t)| t.snapshot(h)).collect()
        }

        /// Keys with everything precached treated as budget-feasible.
        fn plan(&self, bias: i32, balance: usize, precached: usize) -> Schedule {
            let snapshots = self.snapshots();
            let keys: Vec<OrderKey> = snapshots
                .iter()
                .enumerate()
                .map(|(slot, s)| OrderKey::build(s, slot as u32, &FRAME))
                .collect();
            let sort = SortResult {
                num_precached: precached,
                balance_point: balance,
                on_screen_point: 0,
                bias,
            };
            build_plan(&snapshots, &keys, &sort, 0)
        }
    }

    fn loaded_at(texture: &mut StreamedTexture, mip: u8) {
        let layout = crate::pool::PoolLayout::for_chain(texture.desc(), mip);
        let size = texture.desc().size_from_mip(mip);
        texture.attach(crate::pool::PoolItem::new(u64::from(mip) + 100, layout, size), mip);
    }

    fn request(texture: &mut StreamedTexture, handle: TextureHandle, mip: f32, visible: bool) {
        let request = if visible {
            MipRequest::visible(handle, mip, &FRAME)
        } else {
            MipRequest::predicted(handle, mip, Zone::Near, 2)
        };
        texture.apply_mip_request(&request);
    }

    #[test]
    fn test_request_ordering_a_c_b() {
        let mut fixture = Fixture::new();
        let a = fixture.add(|t, h| {
            loaded_at(t, 3);
            t.high_priority = true;
            request(t, h, 0.0, true);
        });
        let b = fixture.add(|t, h| {
            loaded_at(t, 1);
            request(t, h, 0.0, false);
        });
        let c = fixture.add(|t, h| {
            loaded_at(t, 2);
            request(t, h, 0.0, true);
        });

        let schedule = fixture.plan(0, 3, 3);
        let order: Vec<TextureHandle> = schedule.requests.iter().map(|r| r.handle).collect();
        assert_eq!(order, vec![a, c, b]);
        assert!(schedule.requests.iter().all(|r| r.target_mip == 0));
    }

    #[test]
    fn test_precedence_of_request_bits() {
        let mut fixture = Fixture::new();
        let composite = fixture.add(|t, h| {
            loaded_at(t, 3);
            t.high_priority = true;
            t.composite_sources.push(h);
            request(t, h, 0.0, true);
        });
        let at_desired = fixture.add(|t, h| {
            loaded_at(t, 3);
            t.high_priority = true;
            // Desired mip 3 is already resident; a negative bias asks for more.
            request(t, h, 3.0, true);
        });
        let low_class = fixture.add(|t, h| {
            loaded_at(t, 3);
            t.priority_class = 5;
            request(t, h, 0.0, true);
        });
        let high_class = fixture.add(|t, h| {
            loaded_at(t, 3);
            t.priority_class = 1;
            request(t, h, 0.0, true);
        });

        let schedule = fixture.plan(-256, 4, 4);
        let order: Vec<TextureHandle> = schedule.requests.iter().map(|r| r.handle).collect();
        assert_eq!(order, vec![high_class, low_class, at_desired, composite]);
    }

    #[test]
    fn test_past_balance_point_keeps_only_persistent() {
        let mut fixture = Fixture::new();
        let kept = fixture.add(|t, h| {
            loaded_at(t, 2);
            request(t, h, 2.0, true);
        });
        let trimmed = fixture.add(|t, h| {
            loaded_at(t, 2);
            request(t, h, 2.0, true);
        });

        let schedule = fixture.plan(0, 1, 2);
        let first_slot = fixture.snapshots()[0].handle;
        assert_eq!(first_slot, kept);
        assert_eq!(
            schedule.trim,
            vec![TrimEntry {
                handle: trimmed,
                target_mip: desc().persistent_mip(),
            }]
        );
        assert!(schedule.requests.is_empty());
        assert!(schedule.unlink.is_empty());
    }

    #[test]
    fn test_unprecached_persistent_textures_unlink() {
        let mut fixture = Fixture::new();
        let idle = fixture.add(|t, _| loaded_at(t, 5));
        let schedule = fixture.plan(0, 0, 0);
        assert_eq!(schedule.unlink, vec![idle]);
        assert_eq!(schedule.list_size, 0);
    }

    #[test]
    fn test_streaming_overshoot_aborts() {
        let mut fixture = Fixture::new();
        let handle = fixture.add(|t, h| {
            loaded_at(t, 4);
            request(t, h, 3.0, true);
        });
        let mut snapshots = fixture.snapshots();
        snapshots[0].streaming_target = Some(1);
        let keys = vec![OrderKey::build(&snapshots[0], 0, &FRAME)];
        let sort = SortResult {
            num_precached: 1,
            balance_point: 1,
            on_screen_point: 1,
            bias: 0,
        };
        let schedule = build_plan(&snapshots, &keys, &sort, 0);
        assert_eq!(schedule.actions, vec![ScheduleAction::Abort(handle)]);
        assert!(schedule.references(handle));

        // A load that is still needed is left alone.
        snapshots[0].streaming_target = Some(3);
        let schedule = build_plan(&snapshots, &keys, &sort, 0);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_cache_mip_stays_within_floor_and_persistent() {
        let mut fixture = Fixture::new();
        for mip in [-3.0, 0.0, 1.5, 4.0, 9.0] {
            fixture.add(|t, h| request(t, h, mip, true));
        }
        let snapshots = fixture.snapshots();
        let keys: Vec<OrderKey> = snapshots
            .iter()
            .enumerate()
            .map(|(slot, s)| OrderKey::build(s, slot as u32, &FRAME))
            .collect();
        let min_mip_fp = mip_to_fp(1.0);
        for bias in [-256, 0, 300, 1792] {
            let sort = SortResult {
                num_precached: keys.len(),
                balance_point: keys.len(),
                on_screen_point: 0,
                bias,
            };
            let schedule = build_plan(&snapshots, &keys, &sort, min_mip_fp);
            // Unloaded textures request exactly their cache mip.
            assert_eq!(schedule.requests.len(), keys.len());
            for request in &schedule.requests {
                assert!(request.target_mip >= 1);
                assert!(request.target_mip <= desc().persistent_mip());
            }
        }
    }

    #[test]
    fn test_list_size_sums_required_bytes() {
        let mut fixture = Fixture::new();
        fixture.add(|t, h| request(t, h, 0.0, true));
        fixture.add(|t, h| request(t, h, 2.0, true));
        let schedule = fixture.plan(0, 2, 2);
        let d = desc();
        let expected = (d.size_from_mip(0) - d.persistent_size())
            + (d.size_from_mip(2) - d.persistent_size());
        assert_eq!(schedule.list_size, expected);
        assert_eq!(request_key_mip_fp(schedule.requests[0].key), 0);
    }
}

//! Packed per-cycle priority keys.
//!
//! Every "good" condition clears its bit, so an ascending compare of the
//! packed `u32` orders textures from most to least deserving of high
//! resolution residency. The low 16 bits hold the desired mip in 8.8 fixed
//! point offset by [`MIP_KEY_BIAS`] so negative values still compare as
//! unsigned.

use std::cmp::Ordering;

use crate::texture::{
    FrameInfo, MIP_FP_SHIFT, TextureDesc, TextureHandle, TextureSnapshot, Zone,
};

/// Set unless the texture forces full resolution.
pub const NOT_FORCE_HIGH_RES: u32 = 1 << 31;
/// Set unless the texture is high priority.
pub const NOT_HIGH_PRIORITY: u32 = 1 << 30;
/// Set unless the texture was accessed at or after the visibility frame.
pub const NOT_VISIBLE: u32 = 1 << 29;
/// Set unless the texture belongs to the current near-zone round.
pub const NOT_NEAR_ZONE: u32 = 1 << 28;
/// Set unless the texture belongs to the current far-zone round.
pub const NOT_FAR_ZONE: u32 = 1 << 27;

/// Offset applied to the fixed-point desired mip in the low 16 bits.
pub const MIP_KEY_BIAS: i32 = 0x7f00;

const MIP_MASK: u32 = 0xffff;
const MIP_KEY_MIN: i32 = -MIP_KEY_BIAS;
const MIP_KEY_MAX: i32 = MIP_MASK as i32 - MIP_KEY_BIAS;

/// Sortable priority record for one texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderKey {
    bits: u32,
    handle: TextureHandle,
    /// Index of the texture's snapshot in the planning job.
    slot: u32,
    desc: TextureDesc,
    persistent_size: u64,
}

impl OrderKey {
    /// Build the key for a snapshot at `slot`.
    #[must_use]
    pub fn build(snapshot: &TextureSnapshot, slot: u32, frame: &FrameInfo) -> Self {
        let mut bits = 0;
        if !snapshot.force_high_res {
            bits |= NOT_FORCE_HIGH_RES;
        }
        if !snapshot.high_priority {
            bits |= NOT_HIGH_PRIORITY;
        }
        // Frame and round 0 mean "never".
        let visible = snapshot.last_access_frame != 0
            && snapshot.last_access_frame >= frame.visibility_frame;
        if !visible {
            bits |= NOT_VISIBLE;
        }
        for (zone, flag) in [(Zone::Near, NOT_NEAR_ZONE), (Zone::Far, NOT_FAR_ZONE)] {
            let round = snapshot.round_ids[zone as usize];
            if round == 0 || round < frame.zone_round_ids[zone as usize] {
                bits |= flag;
            }
        }
        let mip = snapshot.desired_mip_fp.clamp(MIP_KEY_MIN, MIP_KEY_MAX) + MIP_KEY_BIAS;
        bits |= mip as u32 & MIP_MASK;

        Self {
            bits,
            handle: snapshot.handle,
            slot,
            desc: snapshot.desc,
            persistent_size: snapshot.desc.persistent_size(),
        }
    }

    /// The packed key.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    #[must_use]
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    #[must_use]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[must_use]
    pub fn is_force_high_res(&self) -> bool {
        self.bits & NOT_FORCE_HIGH_RES == 0
    }

    #[must_use]
    pub fn is_high_priority(&self) -> bool {
        self.bits & NOT_HIGH_PRIORITY == 0
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.bits & NOT_VISIBLE == 0
    }

    #[must_use]
    pub fn is_near(&self) -> bool {
        self.bits & NOT_NEAR_ZONE == 0
    }

    #[must_use]
    pub fn is_far(&self) -> bool {
        self.bits & NOT_FAR_ZONE == 0
    }

    /// Whether the texture competes for the budget this cycle.
    #[must_use]
    pub fn is_precached(&self) -> bool {
        self.is_force_high_res() || self.is_near() || self.is_far()
    }

    /// Desired mip in fixed point as stored in the key.
    #[must_use]
    pub fn desired_mip_fp(&self) -> i32 {
        (self.bits & MIP_MASK) as i32 - MIP_KEY_BIAS
    }

    /// The persistent mip in fixed point.
    #[must_use]
    pub fn persistent_mip_fp(&self) -> i32 {
        i32::from(self.desc.persistent_mip()) << MIP_FP_SHIFT
    }

    /// Biased desired mip clamped to `[min_mip_fp, persistent_mip]`.
    ///
    /// The persistent mip wins when the floor is coarser than it.
    #[must_use]
    pub fn cache_mip_fp(&self, bias: i32, min_mip_fp: i32) -> i32 {
        (self.desired_mip_fp() + bias)
            .max(min_mip_fp)
            .min(self.persistent_mip_fp())
    }

    /// Streamed bytes (above the persistent tail) needed at `mip_fp`.
    #[must_use]
    pub fn required_bytes(&self, mip_fp: i32) -> u64 {
        let pers = i32::from(self.desc.persistent_mip());
        let mip = (mip_fp >> MIP_FP_SHIFT).clamp(0, pers) as u8;
        self.desc.size_from_mip(mip) - self.persistent_size
    }

    /// Total order: packed key, then handle.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.bits
            .cmp(&other.bits)
            .then_with(|| self.handle.cmp(&other.handle))
    }
}
